use serde::{Deserialize, Serialize};

/// A single replicated mutation of a room.
///
/// Operations are appended to the room's log by its leader and applied in
/// log order on every node, so everything inside must be deterministic.
/// `submit_timestamp` is stamped by the leader at propose time; a timestamp
/// supplied by a forwarding node is advisory only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    #[serde(flatten)]
    pub kind: OperationKind,
    pub origin_user_id: String,
    pub submit_timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationKind {
    #[serde(rename_all = "camelCase")]
    RoomCreate { username: String },
    #[serde(rename_all = "camelCase")]
    RoomJoin { username: String },
    RoomLeave,
    #[serde(rename_all = "camelCase")]
    PlaybackPlay {
        video_id: String,
        position_seconds: f64,
    },
    #[serde(rename_all = "camelCase")]
    PlaybackPause { position_seconds: f64 },
    #[serde(rename_all = "camelCase")]
    PlaybackSeek { new_position_seconds: f64 },
    #[serde(rename_all = "camelCase")]
    PlaylistAdd {
        video_id: String,
        title: Option<String>,
        position: i64,
    },
    #[serde(rename_all = "camelCase")]
    PlaylistRemove {
        video_id: String,
        removed_video_position: i64,
    },
    #[serde(rename_all = "camelCase")]
    ChatMessage { text: String },
}

impl OperationKind {
    /// The wire name of this kind, as used in frame and envelope tags.
    pub fn name(&self) -> &'static str {
        match self {
            Self::RoomCreate { .. } => "ROOM_CREATE",
            Self::RoomJoin { .. } => "ROOM_JOIN",
            Self::RoomLeave => "ROOM_LEAVE",
            Self::PlaybackPlay { .. } => "PLAYBACK_PLAY",
            Self::PlaybackPause { .. } => "PLAYBACK_PAUSE",
            Self::PlaybackSeek { .. } => "PLAYBACK_SEEK",
            Self::PlaylistAdd { .. } => "PLAYLIST_ADD",
            Self::PlaylistRemove { .. } => "PLAYLIST_REMOVE",
            Self::ChatMessage { .. } => "CHAT_MESSAGE",
        }
    }

    /// Whether `name` is an operation kind a node may forward to a leader.
    pub fn is_forwardable(name: &str) -> bool {
        matches!(
            name,
            "ROOM_CREATE"
                | "ROOM_JOIN"
                | "ROOM_LEAVE"
                | "PLAYBACK_PLAY"
                | "PLAYBACK_PAUSE"
                | "PLAYBACK_SEEK"
                | "PLAYLIST_ADD"
                | "PLAYLIST_REMOVE"
                | "CHAT_MESSAGE"
        )
    }
}

impl Operation {
    pub fn new(kind: OperationKind, origin_user_id: impl Into<String>, submit_timestamp: u64) -> Self {
        Self {
            kind,
            origin_user_id: origin_user_id.into(),
            submit_timestamp,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn operations_round_trip_through_json() {
        let operations = vec![
            Operation::new(
                OperationKind::RoomCreate {
                    username: "Alice".to_string(),
                },
                "u1",
                1000,
            ),
            Operation::new(OperationKind::RoomLeave, "u2", 2000),
            Operation::new(
                OperationKind::PlaybackPlay {
                    video_id: "dQw4w9WgXcQ".to_string(),
                    position_seconds: 12.5,
                },
                "u1",
                3000,
            ),
            Operation::new(
                OperationKind::PlaylistAdd {
                    video_id: "xyz".to_string(),
                    title: None,
                    position: -1,
                },
                "u3",
                4000,
            ),
        ];

        for operation in operations {
            let encoded = serde_json::to_string(&operation).expect("serializes");
            let decoded: Operation = serde_json::from_str(&encoded).expect("deserializes");

            assert_eq!(decoded, operation);
        }
    }

    #[test]
    fn kind_tag_matches_wire_name() {
        let operation = Operation::new(
            OperationKind::ChatMessage {
                text: "hello".to_string(),
            },
            "u1",
            5,
        );

        let value = serde_json::to_value(&operation).expect("serializes");

        assert_eq!(value["kind"], "CHAT_MESSAGE");
        assert_eq!(value["payload"]["text"], "hello");
        assert_eq!(value["originUserId"], "u1");
    }
}
