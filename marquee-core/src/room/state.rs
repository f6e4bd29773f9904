use serde::{Deserialize, Serialize};

use super::{Operation, OperationKind, RoomCode};

/// How many chat messages a room retains.
pub const MAX_CHAT_LOG: usize = 1000;

/// The replicated state of a room.
///
/// This is the value every node folds the room's committed log into.
/// Applying the same operations in the same order always produces the
/// same bytes under canonical serialization, so nothing in here may
/// derive from the applying node's clock or from iteration order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomState {
    pub code: RoomCode,
    pub created_at: u64,
    pub created_by: String,
    pub participants: Vec<Participant>,
    pub playlist: Vec<PlaylistEntry>,
    pub playback: PlaybackState,
    pub chat_log: Vec<ChatMessage>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub user_id: String,
    pub username: String,
    pub joined_at: u64,
    pub is_creator: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaylistEntry {
    pub video_id: String,
    pub title: Option<String>,
    pub added_by: String,
    pub added_at: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaybackState {
    pub is_playing: bool,
    pub current_video_id: Option<String>,
    pub position_seconds: f64,
    pub last_updated: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub user_id: String,
    pub text: String,
    pub timestamp: u64,
}

impl RoomState {
    /// The empty state a room's log is folded over.
    pub fn new(code: RoomCode) -> Self {
        Self {
            code,
            created_at: 0,
            created_by: String::new(),
            participants: Vec::new(),
            playlist: Vec::new(),
            playback: PlaybackState::default(),
            chat_log: Vec::new(),
        }
    }

    /// Whether the seeding create operation has been applied yet.
    pub fn is_created(&self) -> bool {
        self.created_at != 0
    }

    /// Folds one committed operation into the state.
    ///
    /// Every rule in here is idempotent or total, so a replayed or stale
    /// operation degrades to a no-op instead of diverging the replicas.
    /// All time fields come from the operation's `submit_timestamp`.
    pub fn apply(&mut self, operation: &Operation) {
        let origin = operation.origin_user_id.as_str();
        let timestamp = operation.submit_timestamp;

        match &operation.kind {
            OperationKind::RoomCreate { username } => {
                if self.is_created() {
                    return;
                }

                self.created_at = timestamp;
                self.created_by = origin.to_string();
                self.participants.push(Participant {
                    user_id: origin.to_string(),
                    username: username.clone(),
                    joined_at: timestamp,
                    is_creator: true,
                });
            }
            OperationKind::RoomJoin { username } => {
                let present = self.participants.iter().any(|p| p.user_id == origin);

                if !present {
                    self.participants.push(Participant {
                        user_id: origin.to_string(),
                        username: username.clone(),
                        joined_at: timestamp,
                        is_creator: false,
                    });
                }
            }
            OperationKind::RoomLeave => {
                self.participants.retain(|p| p.user_id != origin);
            }
            OperationKind::PlaybackPlay {
                video_id,
                position_seconds,
            } => {
                self.playback = PlaybackState {
                    is_playing: true,
                    current_video_id: Some(video_id.clone()),
                    position_seconds: *position_seconds,
                    last_updated: timestamp,
                };
            }
            OperationKind::PlaybackPause { position_seconds } => {
                self.playback.is_playing = false;
                self.playback.position_seconds = *position_seconds;
                self.playback.last_updated = timestamp;
            }
            OperationKind::PlaybackSeek {
                new_position_seconds,
            } => {
                self.playback.position_seconds = *new_position_seconds;
                self.playback.last_updated = timestamp;
            }
            OperationKind::PlaylistAdd {
                video_id,
                title,
                position,
            } => {
                let index = if *position < 0 {
                    self.playlist.len()
                } else {
                    (*position as usize).min(self.playlist.len())
                };

                self.playlist.insert(
                    index,
                    PlaylistEntry {
                        video_id: video_id.clone(),
                        title: title.clone(),
                        added_by: origin.to_string(),
                        added_at: timestamp,
                    },
                );
            }
            OperationKind::PlaylistRemove {
                video_id,
                removed_video_position,
            } => {
                let position = usize::try_from(*removed_video_position).ok();

                let exact = position
                    .filter(|&i| i < self.playlist.len())
                    .filter(|&i| self.playlist[i].video_id == *video_id);

                // A stale position falls back to the first match from the head
                let index = exact.or_else(|| {
                    self.playlist
                        .iter()
                        .position(|entry| entry.video_id == *video_id)
                });

                if let Some(index) = index {
                    self.playlist.remove(index);
                }
            }
            OperationKind::ChatMessage { text } => {
                self.chat_log.push(ChatMessage {
                    id: format!("{}-{}", timestamp, origin),
                    user_id: origin.to_string(),
                    text: text.clone(),
                    timestamp,
                });

                if self.chat_log.len() > MAX_CHAT_LOG {
                    let excess = self.chat_log.len() - MAX_CHAT_LOG;
                    self.chat_log.drain(..excess);
                }
            }
        }
    }

    /// Verifies the structural invariants the fold is supposed to uphold.
    ///
    /// A violation here means an apply bug, not bad input; callers treat
    /// it as fatal for the room.
    pub fn check_invariants(&self) -> Result<(), String> {
        for (i, participant) in self.participants.iter().enumerate() {
            let duplicate = self.participants[i + 1..]
                .iter()
                .any(|other| other.user_id == participant.user_id);

            if duplicate {
                return Err(format!("duplicate participant {}", participant.user_id));
            }
        }

        if self.chat_log.len() > MAX_CHAT_LOG {
            return Err(format!("chat log holds {} messages", self.chat_log.len()));
        }

        if !self.playback.position_seconds.is_finite() {
            return Err("playback position is not finite".to_string());
        }

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn empty_room() -> RoomState {
        RoomState::new(RoomCode::parse("ABC123").expect("valid code"))
    }

    fn created_room() -> RoomState {
        let mut state = empty_room();

        state.apply(&Operation::new(
            OperationKind::RoomCreate {
                username: "Alice".to_string(),
            },
            "u1",
            1000,
        ));

        state
    }

    #[test]
    fn create_seeds_the_creator() {
        let state = created_room();

        assert_eq!(state.created_at, 1000);
        assert_eq!(state.created_by, "u1");
        assert_eq!(state.participants.len(), 1);
        assert!(state.participants[0].is_creator);
    }

    #[test]
    fn create_is_idempotent() {
        let mut state = created_room();
        let before = state.clone();

        state.apply(&Operation::new(
            OperationKind::RoomCreate {
                username: "Impostor".to_string(),
            },
            "u9",
            9999,
        ));

        assert_eq!(state, before);
    }

    #[test]
    fn join_and_leave_are_idempotent() {
        let join = Operation::new(
            OperationKind::RoomJoin {
                username: "Bob".to_string(),
            },
            "u2",
            2000,
        );
        let leave = Operation::new(OperationKind::RoomLeave, "u2", 3000);

        let mut once = created_room();
        once.apply(&join);

        let mut twice = created_room();
        twice.apply(&join);
        twice.apply(&join);

        assert_eq!(once, twice);
        assert_eq!(once.participants.len(), 2);
        assert!(!once.participants[1].is_creator);

        once.apply(&leave);
        twice.apply(&leave);
        twice.apply(&leave);

        assert_eq!(once, twice);
        assert_eq!(once.participants.len(), 1);
    }

    #[test]
    fn creator_flag_is_not_transferred() {
        let mut state = created_room();

        state.apply(&Operation::new(
            OperationKind::RoomJoin {
                username: "Bob".to_string(),
            },
            "u2",
            2000,
        ));
        state.apply(&Operation::new(OperationKind::RoomLeave, "u1", 3000));
        state.apply(&Operation::new(
            OperationKind::RoomJoin {
                username: "Carol".to_string(),
            },
            "u3",
            4000,
        ));

        assert_eq!(state.created_by, "u1");
        assert!(state.participants.iter().all(|p| !p.is_creator));
    }

    #[test]
    fn playback_play_replaces_the_whole_state() {
        let mut state = created_room();

        state.apply(&Operation::new(
            OperationKind::PlaybackPlay {
                video_id: "dQw4w9WgXcQ".to_string(),
                position_seconds: 0.0,
            },
            "u1",
            5000,
        ));

        assert!(state.playback.is_playing);
        assert_eq!(state.playback.current_video_id.as_deref(), Some("dQw4w9WgXcQ"));
        assert_eq!(state.playback.position_seconds, 0.0);
        assert_eq!(state.playback.last_updated, 5000);
    }

    #[test]
    fn pause_keeps_the_current_video() {
        let mut state = created_room();

        state.apply(&Operation::new(
            OperationKind::PlaybackPlay {
                video_id: "abc".to_string(),
                position_seconds: 3.0,
            },
            "u1",
            5000,
        ));
        state.apply(&Operation::new(
            OperationKind::PlaybackPause {
                position_seconds: 7.5,
            },
            "u1",
            6000,
        ));

        assert!(!state.playback.is_playing);
        assert_eq!(state.playback.current_video_id.as_deref(), Some("abc"));
        assert_eq!(state.playback.position_seconds, 7.5);
        assert_eq!(state.playback.last_updated, 6000);
    }

    #[test]
    fn seek_while_paused_stays_paused() {
        let mut state = created_room();

        state.apply(&Operation::new(
            OperationKind::PlaybackPause {
                position_seconds: 10.0,
            },
            "u1",
            5000,
        ));
        state.apply(&Operation::new(
            OperationKind::PlaybackSeek {
                new_position_seconds: 42.0,
            },
            "u1",
            6000,
        ));

        assert!(!state.playback.is_playing);
        assert_eq!(state.playback.position_seconds, 42.0);
        assert_eq!(state.playback.last_updated, 6000);
    }

    fn add(video_id: &str, position: i64, timestamp: u64) -> Operation {
        Operation::new(
            OperationKind::PlaylistAdd {
                video_id: video_id.to_string(),
                title: None,
                position,
            },
            "u1",
            timestamp,
        )
    }

    #[test]
    fn playlist_add_clamps_positions() {
        let mut state = created_room();

        // -1 appends
        state.apply(&add("a", -1, 1));
        state.apply(&add("b", -1, 2));
        // 0 prepends
        state.apply(&add("c", 0, 3));
        // Beyond the end appends
        state.apply(&add("d", 99, 4));

        let order: Vec<_> = state.playlist.iter().map(|e| e.video_id.as_str()).collect();
        assert_eq!(order, vec!["c", "a", "b", "d"]);
    }

    #[test]
    fn playlist_remove_prefers_the_exact_position() {
        let mut state = created_room();

        state.apply(&add("a", -1, 1));
        state.apply(&add("b", -1, 2));
        state.apply(&add("a", -1, 3));

        state.apply(&Operation::new(
            OperationKind::PlaylistRemove {
                video_id: "a".to_string(),
                removed_video_position: 2,
            },
            "u1",
            4,
        ));

        let order: Vec<_> = state.playlist.iter().map(|e| e.video_id.as_str()).collect();
        assert_eq!(order, vec!["a", "b"]);
    }

    #[test]
    fn playlist_remove_falls_back_to_first_match() {
        let mut state = created_room();

        state.apply(&add("a", -1, 1));
        state.apply(&add("b", -1, 2));
        state.apply(&add("a", -1, 3));

        // Stale position pointing at a different video
        state.apply(&Operation::new(
            OperationKind::PlaylistRemove {
                video_id: "a".to_string(),
                removed_video_position: 1,
            },
            "u1",
            4,
        ));

        let order: Vec<_> = state.playlist.iter().map(|e| e.video_id.as_str()).collect();
        assert_eq!(order, vec!["b", "a"]);

        // No match at all is a no-op
        let before = state.clone();
        state.apply(&Operation::new(
            OperationKind::PlaylistRemove {
                video_id: "zzz".to_string(),
                removed_video_position: 0,
            },
            "u1",
            5,
        ));

        assert_eq!(state, before);
    }

    #[test]
    fn chat_log_is_bounded() {
        let mut state = created_room();

        for i in 0..MAX_CHAT_LOG as u64 {
            state.apply(&Operation::new(
                OperationKind::ChatMessage {
                    text: format!("message {}", i),
                },
                "u1",
                i,
            ));
        }

        assert_eq!(state.chat_log.len(), MAX_CHAT_LOG);
        let oldest = state.chat_log[0].id.clone();

        state.apply(&Operation::new(
            OperationKind::ChatMessage {
                text: "one more".to_string(),
            },
            "u1",
            5000,
        ));

        assert_eq!(state.chat_log.len(), MAX_CHAT_LOG);
        assert!(state.chat_log.iter().all(|m| m.id != oldest));
        assert_eq!(state.chat_log.last().expect("non-empty").text, "one more");
    }

    #[test]
    fn chat_ids_derive_from_the_operation() {
        let mut state = created_room();

        state.apply(&Operation::new(
            OperationKind::ChatMessage {
                text: "hi".to_string(),
            },
            "u2",
            1234,
        ));

        assert_eq!(state.chat_log[0].id, "1234-u2");
    }

    #[test]
    fn identical_folds_serialize_identically() {
        let operations = vec![
            Operation::new(
                OperationKind::RoomCreate {
                    username: "Alice".to_string(),
                },
                "u1",
                1,
            ),
            Operation::new(
                OperationKind::RoomJoin {
                    username: "Bob".to_string(),
                },
                "u2",
                2,
            ),
            Operation::new(
                OperationKind::PlaybackPlay {
                    video_id: "abc".to_string(),
                    position_seconds: 1.5,
                },
                "u2",
                3,
            ),
            Operation::new(
                OperationKind::ChatMessage {
                    text: "hello".to_string(),
                },
                "u1",
                4,
            ),
        ];

        let mut first = empty_room();
        let mut second = empty_room();

        for operation in &operations {
            first.apply(operation);
            second.apply(operation);
        }

        let first_bytes = serde_json::to_string(&first).expect("serializes");
        let second_bytes = serde_json::to_string(&second).expect("serializes");

        assert_eq!(first_bytes, second_bytes);
        first.check_invariants().expect("invariants hold");
    }
}
