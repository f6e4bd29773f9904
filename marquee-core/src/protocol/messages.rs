use serde::{Deserialize, Serialize};

use crate::{NodeId, RoomState};

/// A message received from a client over its session link.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    RoomCreate(RoomCreatePayload),
    RoomJoin(RoomJoinPayload),
    RoomLeave(RoomLeavePayload),
    PlaybackPlay(PlaybackPlayPayload),
    PlaybackPause(PlaybackPausePayload),
    PlaybackSeek(PlaybackSeekPayload),
    PlaylistAdd(PlaylistAddPayload),
    PlaylistRemove(PlaylistRemovePayload),
    ChatMessage(ChatMessagePayload),
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RoomCreatePayload {
    pub user_id: String,
    pub username: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RoomJoinPayload {
    pub room_code: String,
    pub user_id: String,
    pub username: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RoomLeavePayload {
    pub room_code: String,
    pub user_id: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PlaybackPlayPayload {
    pub room_code: String,
    pub video_id: String,
    pub position_seconds: f64,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PlaybackPausePayload {
    pub room_code: String,
    pub position_seconds: f64,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PlaybackSeekPayload {
    pub room_code: String,
    pub new_position_seconds: f64,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PlaylistAddPayload {
    pub room_code: String,
    pub video_id: String,
    #[serde(default)]
    pub title: Option<String>,
    pub user_id: String,
    pub username: String,
    /// `-1` appends to the end of the playlist
    pub new_video_position: i64,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PlaylistRemovePayload {
    pub room_code: String,
    pub video_id: String,
    pub removed_video_position: i64,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ChatMessagePayload {
    pub room_code: String,
    pub user_id: String,
    pub username: String,
    pub message_text: String,
    /// Advisory only. The room's leader stamps the authoritative time.
    pub timestamp: u64,
}

impl ClientMessage {
    /// The room code carried by the message, before normalization.
    pub fn room_code(&self) -> Option<&str> {
        match self {
            Self::RoomCreate(_) => None,
            Self::RoomJoin(p) => Some(&p.room_code),
            Self::RoomLeave(p) => Some(&p.room_code),
            Self::PlaybackPlay(p) => Some(&p.room_code),
            Self::PlaybackPause(p) => Some(&p.room_code),
            Self::PlaybackSeek(p) => Some(&p.room_code),
            Self::PlaylistAdd(p) => Some(&p.room_code),
            Self::PlaylistRemove(p) => Some(&p.room_code),
            Self::ChatMessage(p) => Some(&p.room_code),
        }
    }
}

/// A message pushed to a client over its session link.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerMessage {
    #[serde(rename_all = "camelCase")]
    Connected { client_id: String, node_id: NodeId },
    #[serde(rename_all = "camelCase")]
    RoomCreated {
        room_code: String,
        room_state: RoomState,
    },
    #[serde(rename_all = "camelCase")]
    RoomJoined {
        room_code: String,
        room_state: RoomState,
    },
    #[serde(rename_all = "camelCase")]
    RoomLeft { room_code: String },
    #[serde(rename_all = "camelCase")]
    RoomStateUpdate {
        room_code: String,
        room_state: RoomState,
    },
    #[serde(rename_all = "camelCase")]
    LeaderChanged {
        room_code: String,
        leader_id: Option<NodeId>,
    },
    #[serde(rename_all = "camelCase")]
    Error {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        code: Option<String>,
    },
}

impl ServerMessage {
    /// State updates are idempotent, so under backpressure an older one
    /// may be dropped in favor of a newer one. Everything else must
    /// reach the client or the session is torn down.
    pub fn is_droppable(&self) -> bool {
        matches!(self, Self::RoomStateUpdate { .. })
    }
}
