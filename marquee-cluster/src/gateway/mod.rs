mod session;

use std::sync::Arc;

use dashmap::DashMap;
use log::{debug, info, warn};
use marquee_core::{
    decode_client_frame, now_ms, ArcedStore, ClientMessage, CreateRoomArgs, DecodeError, NodeId,
    Operation, OperationKind, ProposeError, RoomCode, RoomCreatePayload, RoomJoinPayload,
    RoomLeavePayload, RoomState, ServerMessage,
};
use thiserror::Error;

pub use session::*;

use crate::{ClusterContext, RegisteredRoom, RoomRegistry};

/// How many codes are tried before giving up on allocating a room.
const CODE_ATTEMPTS: usize = 32;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error("Room not found")]
    RoomNotFound,
    #[error("No leader available")]
    NoLeader,
    #[error("Not in a room")]
    NotInRoom,
    #[error("Already in a room")]
    AlreadyInRoom,
    #[error("Room refuses writes")]
    RoomUnhealthy,
    #[error("Could not allocate a room code")]
    CodesExhausted,
    #[error("Session is gone")]
    UnknownSession,
}

impl GatewayError {
    fn code(&self) -> &'static str {
        match self {
            Self::Decode(_) => "VALIDATION",
            Self::RoomNotFound => "ROOM_NOT_FOUND",
            Self::NoLeader => "NO_LEADER",
            Self::NotInRoom => "NOT_IN_ROOM",
            Self::AlreadyInRoom => "ALREADY_IN_ROOM",
            Self::RoomUnhealthy => "ROOM_UNHEALTHY",
            Self::CodesExhausted => "TRY_AGAIN",
            Self::UnknownSession => "SESSION_GONE",
        }
    }
}

/// Accepts client sessions, validates their messages, routes writes to
/// each room's leader, and fans committed state back out to subscribers.
///
/// The gateway owns sessions and the subscriber sets; room state itself
/// is only ever touched through a room's consensus group.
pub struct Gateway {
    context: ClusterContext,
    registry: Arc<RoomRegistry>,
    sessions: ArcedStore<SessionId, Session>,
    subscribers: DashMap<RoomCode, Vec<SessionId>>,
}

impl Gateway {
    pub fn new(context: &ClusterContext, registry: Arc<RoomRegistry>) -> Self {
        Self {
            context: context.clone(),
            registry,
            sessions: Default::default(),
            subscribers: Default::default(),
        }
    }

    /// Registers a fresh session and greets it.
    pub fn connect(&self) -> Arc<Session> {
        let session = Arc::new(Session::new(self.context.consensus.session_outbox_cap));

        let _ = session.push(ServerMessage::Connected {
            client_id: session.id.to_string(),
            node_id: self.context.config.local_id.clone(),
        });

        self.sessions.insert(session.id, session.clone());
        info!("Session {} connected", session.id);

        session
    }

    /// Decodes and dispatches one client frame.
    ///
    /// Validation failures answer with an `ERROR` frame and leave the
    /// session open.
    pub async fn handle_frame(&self, session_id: SessionId, frame: &str) {
        let result = match decode_client_frame(frame, self.context.consensus.max_frame_bytes) {
            Ok(message) => self.handle_message(session_id, message).await,
            Err(error) => Err(GatewayError::Decode(error)),
        };

        if let Err(error) = result {
            debug!("Session {}: {}", session_id, error);

            if let Ok(session) = self.session(session_id) {
                let _ = session.push(ServerMessage::Error {
                    message: error.to_string(),
                    code: Some(error.code().to_string()),
                });
            }
        }
    }

    async fn handle_message(
        &self,
        session_id: SessionId,
        message: ClientMessage,
    ) -> Result<(), GatewayError> {
        match message {
            ClientMessage::RoomCreate(payload) => self.create_room(session_id, payload).await,
            ClientMessage::RoomJoin(payload) => self.join_room(session_id, payload).await,
            ClientMessage::RoomLeave(payload) => self.leave_room(session_id, payload).await,
            ClientMessage::PlaybackPlay(payload) => {
                self.replicate(
                    session_id,
                    &payload.room_code,
                    OperationKind::PlaybackPlay {
                        video_id: payload.video_id,
                        position_seconds: payload.position_seconds,
                    },
                )
                .await
            }
            ClientMessage::PlaybackPause(payload) => {
                self.replicate(
                    session_id,
                    &payload.room_code,
                    OperationKind::PlaybackPause {
                        position_seconds: payload.position_seconds,
                    },
                )
                .await
            }
            ClientMessage::PlaybackSeek(payload) => {
                self.replicate(
                    session_id,
                    &payload.room_code,
                    OperationKind::PlaybackSeek {
                        new_position_seconds: payload.new_position_seconds,
                    },
                )
                .await
            }
            ClientMessage::PlaylistAdd(payload) => {
                self.replicate(
                    session_id,
                    &payload.room_code,
                    OperationKind::PlaylistAdd {
                        video_id: payload.video_id,
                        title: payload.title,
                        position: payload.new_video_position,
                    },
                )
                .await
            }
            ClientMessage::PlaylistRemove(payload) => {
                self.replicate(
                    session_id,
                    &payload.room_code,
                    OperationKind::PlaylistRemove {
                        video_id: payload.video_id,
                        removed_video_position: payload.removed_video_position,
                    },
                )
                .await
            }
            ClientMessage::ChatMessage(payload) => {
                self.replicate(
                    session_id,
                    &payload.room_code,
                    OperationKind::ChatMessage {
                        text: payload.message_text,
                    },
                )
                .await
            }
        }
    }

    async fn create_room(
        &self,
        session_id: SessionId,
        payload: RoomCreatePayload,
    ) -> Result<(), GatewayError> {
        let session = self.session(session_id)?;

        if session.bound_room().is_some() {
            return Err(GatewayError::AlreadyInRoom);
        }

        let identity = SessionIdentity {
            user_id: payload.user_id,
            username: payload.username,
        };

        let args = CreateRoomArgs {
            creator_user_id: identity.user_id.clone(),
            creator_username: identity.username.clone(),
        };

        // Allocate a code no node knows yet. The handshake doubles as the
        // cluster wide collision check and leaves every peer with the
        // room's group before the first replication round reaches it.
        let mut allocated = None;

        for _ in 0..CODE_ATTEMPTS {
            let code = RoomCode::generate();

            if self.registry.contains(&code) {
                continue;
            }

            let taken = self
                .context
                .transport
                .broadcast_create_room(&code, args.clone())
                .await;

            if taken {
                continue;
            }

            allocated = Some(code);
            break;
        }

        let code = allocated.ok_or(GatewayError::CodesExhausted)?;
        let (room, _) =
            self.registry
                .create_room(&code, true, self.context.config.local_id.clone());

        session.set_identity(identity.clone());
        session.bind(code.clone());
        self.subscribe(&code, session_id);

        let operation = Operation::new(
            OperationKind::RoomCreate {
                username: identity.username,
            },
            identity.user_id,
            now_ms(),
        );

        room.raft
            .propose(operation)
            .await
            .map_err(map_propose_error)?;

        let state = self.read_state(&room).await?;

        let _ = session.push(ServerMessage::RoomCreated {
            room_code: code.to_string(),
            room_state: state,
        });

        info!("Session {} created room {}", session_id, code);

        Ok(())
    }

    async fn join_room(
        &self,
        session_id: SessionId,
        payload: RoomJoinPayload,
    ) -> Result<(), GatewayError> {
        let session = self.session(session_id)?;

        if session.bound_room().is_some() {
            return Err(GatewayError::AlreadyInRoom);
        }

        let code = RoomCode::parse(&payload.room_code)?;

        let room = self
            .registry
            .room(&code)
            .map_err(|_| GatewayError::RoomNotFound)?;

        let identity = SessionIdentity {
            user_id: payload.user_id,
            username: payload.username,
        };

        session.set_identity(identity.clone());
        session.bind(code.clone());
        self.subscribe(&code, session_id);

        let operation = Operation::new(
            OperationKind::RoomJoin {
                username: identity.username,
            },
            identity.user_id,
            now_ms(),
        );

        if let Err(error) = self.propose_or_forward(&room, &code, operation).await {
            // The session stays unbound when the join cannot replicate
            session.unbind();
            self.unsubscribe(&code, session_id);
            return Err(error);
        }

        let state = self.read_state(&room).await?;

        let _ = session.push(ServerMessage::RoomJoined {
            room_code: code.to_string(),
            room_state: state,
        });

        info!("Session {} joined room {}", session_id, code);

        Ok(())
    }

    async fn leave_room(
        &self,
        session_id: SessionId,
        payload: RoomLeavePayload,
    ) -> Result<(), GatewayError> {
        let session = self.session(session_id)?;

        let bound = session.bound_room().ok_or(GatewayError::NotInRoom)?;
        let requested = RoomCode::parse(&payload.room_code)?;

        if requested != bound {
            return Err(GatewayError::NotInRoom);
        }

        let identity = session.identity().ok_or(GatewayError::NotInRoom)?;

        let room = self
            .registry
            .room(&bound)
            .map_err(|_| GatewayError::RoomNotFound)?;

        let operation = Operation::new(OperationKind::RoomLeave, identity.user_id, now_ms());

        self.propose_or_forward(&room, &bound, operation).await?;

        session.unbind();
        self.unsubscribe(&bound, session_id);

        let _ = session.push(ServerMessage::RoomLeft {
            room_code: bound.to_string(),
        });

        info!("Session {} left room {}", session_id, bound);

        Ok(())
    }

    /// Builds and routes one of the in-room operations.
    async fn replicate(
        &self,
        session_id: SessionId,
        raw_code: &str,
        kind: OperationKind,
    ) -> Result<(), GatewayError> {
        let session = self.session(session_id)?;

        let bound = session.bound_room().ok_or(GatewayError::NotInRoom)?;
        let requested = RoomCode::parse(raw_code)?;

        if requested != bound {
            return Err(GatewayError::NotInRoom);
        }

        let identity = session.identity().ok_or(GatewayError::NotInRoom)?;

        let room = self
            .registry
            .room(&bound)
            .map_err(|_| GatewayError::RoomNotFound)?;

        let operation = Operation::new(kind, identity.user_id, now_ms());

        self.propose_or_forward(&room, &bound, operation).await
    }

    /// Proposes locally when this node leads the room, otherwise hands
    /// the operation to the known leader. The leader stamps the
    /// authoritative timestamp, so a forwarded operation may commit with
    /// a different time than the one given here.
    async fn propose_or_forward(
        &self,
        room: &RegisteredRoom,
        code: &RoomCode,
        operation: Operation,
    ) -> Result<(), GatewayError> {
        match room.raft.propose(operation.clone()).await {
            Ok(()) => Ok(()),
            Err(ProposeError::NotLeader {
                leader: Some(leader),
            }) => {
                let ack = self
                    .context
                    .transport
                    .forward_operation(&leader, code, operation)
                    .await
                    .map_err(|error| {
                        debug!("Forward for room {} to {} failed: {}", code, leader, error);
                        GatewayError::NoLeader
                    })?;

                if ack.ok {
                    Ok(())
                } else {
                    Err(GatewayError::NoLeader)
                }
            }
            Err(ProposeError::NotLeader { leader: None }) => Err(GatewayError::NoLeader),
            Err(ProposeError::Poisoned) => Err(GatewayError::RoomUnhealthy),
            Err(ProposeError::Closed) => Err(GatewayError::RoomNotFound),
        }
    }

    /// Tears a session down, recording its departure from a bound room.
    pub async fn disconnect(&self, session_id: SessionId) {
        let Some((_, session)) = self.sessions.remove(&session_id) else {
            return;
        };

        if let Some(code) = session.unbind() {
            self.unsubscribe(&code, session_id);

            if let Some(identity) = session.identity() {
                let operation =
                    Operation::new(OperationKind::RoomLeave, identity.user_id, now_ms());

                if let Ok(room) = self.registry.room(&code) {
                    if let Err(error) = self.propose_or_forward(&room, &code, operation).await {
                        warn!(
                            "Could not record the departure of session {} from {}: {}",
                            session_id, code, error
                        );
                    }
                }
            }
        }

        session.close();
        info!("Session {} disconnected", session_id);
    }

    /// Pushes a post-apply snapshot to every local subscriber of a room.
    pub fn fanout(&self, code: &RoomCode, state: &RoomState) {
        for session_id in self.subscriber_ids(code) {
            if let Ok(session) = self.session(session_id) {
                // Dropped updates are fine; a newer snapshot supersedes
                let _ = session.push(ServerMessage::RoomStateUpdate {
                    room_code: code.to_string(),
                    room_state: state.clone(),
                });
            }
        }
    }

    /// Tells a room's local subscribers who leads it now.
    pub fn notify_leader_changed(&self, code: &RoomCode, leader_id: Option<NodeId>) {
        for session_id in self.subscriber_ids(code) {
            if let Ok(session) = self.session(session_id) {
                let _ = session.push(ServerMessage::LeaderChanged {
                    room_code: code.to_string(),
                    leader_id: leader_id.clone(),
                });
            }
        }
    }

    pub fn subscriber_count(&self, code: &RoomCode) -> usize {
        self.subscribers
            .get(code)
            .map(|subscribers| subscribers.len())
            .unwrap_or(0)
    }

    fn subscriber_ids(&self, code: &RoomCode) -> Vec<SessionId> {
        self.subscribers
            .get(code)
            .map(|subscribers| subscribers.clone())
            .unwrap_or_default()
    }

    fn subscribe(&self, code: &RoomCode, session_id: SessionId) {
        let mut subscribers = self.subscribers.entry(code.clone()).or_default();

        if !subscribers.contains(&session_id) {
            subscribers.push(session_id);
        }
    }

    fn unsubscribe(&self, code: &RoomCode, session_id: SessionId) {
        if let Some(mut subscribers) = self.subscribers.get_mut(code) {
            subscribers.retain(|subscriber| *subscriber != session_id);
        }

        self.subscribers
            .remove_if(code, |_, subscribers| subscribers.is_empty());
    }

    fn session(&self, session_id: SessionId) -> Result<Arc<Session>, GatewayError> {
        self.sessions
            .get(&session_id)
            .map(|session| session.clone())
            .ok_or(GatewayError::UnknownSession)
    }

    async fn read_state(&self, room: &RegisteredRoom) -> Result<RoomState, GatewayError> {
        room.raft
            .snapshot()
            .await
            .map_err(|_| GatewayError::RoomNotFound)
    }
}

fn map_propose_error(error: ProposeError) -> GatewayError {
    match error {
        ProposeError::NotLeader { .. } => GatewayError::NoLeader,
        ProposeError::Poisoned => GatewayError::RoomUnhealthy,
        ProposeError::Closed => GatewayError::RoomNotFound,
    }
}
