use log::trace;
use marquee_core::{
    now_ms, DecodeError, ProposeError, RaftMessage, RaftReply, RoomCode, RpcAck, RpcBody,
    RpcEnvelope,
};
use serde_json::Value;
use thiserror::Error;

use crate::Cluster;

#[derive(Debug, Error)]
pub enum RpcError {
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error("Room {0} does not exist on this node")]
    RoomNotFound(RoomCode),
    #[error("The room's consensus group stopped")]
    GroupClosed,
}

impl Cluster {
    /// Dispatches one envelope from a peer and produces the reply body.
    ///
    /// Consensus messages go to the addressed room's group; the create
    /// handshake instantiates groups ahead of replication; forwarded
    /// client operations are stamped here, where the leader runs.
    pub async fn handle_rpc(&self, body: &str) -> Result<Value, RpcError> {
        let envelope = RpcEnvelope::decode(body, self.context.consensus.max_envelope_bytes())?;

        let RpcEnvelope {
            body,
            source_node_id,
            room_code: code,
            ..
        } = envelope;

        trace!("Rpc {} from {} for room {}", body.kind(), source_node_id, code);

        match body {
            RpcBody::RequestVote(args) => {
                let room = self
                    .registry
                    .room(&code)
                    .map_err(|_| RpcError::RoomNotFound(code))?;

                match room.raft.deliver(RaftMessage::RequestVote(args)).await {
                    Ok(RaftReply::RequestVote(reply)) => Ok(reply_value(&reply)),
                    _ => Err(RpcError::GroupClosed),
                }
            }
            RpcBody::AppendEntries(args) => {
                let room = self
                    .registry
                    .room(&code)
                    .map_err(|_| RpcError::RoomNotFound(code))?;

                match room.raft.deliver(RaftMessage::AppendEntries(args)).await {
                    Ok(RaftReply::AppendEntries(reply)) => Ok(reply_value(&reply)),
                    _ => Err(RpcError::GroupClosed),
                }
            }
            RpcBody::CreateRoom(_args) => {
                let (room, created) =
                    self.registry
                        .create_room(&code, false, source_node_id.clone());

                // A repeated handshake from the allocator is acknowledged;
                // an existing room allocated by anyone else tells the
                // caller its code lost the collision check
                let ack = if created || *room.allocated_by() == source_node_id {
                    RpcAck::ok()
                } else {
                    RpcAck::rejected("room exists", None)
                };

                Ok(reply_value(&ack))
            }
            RpcBody::Forward(mut operation) => {
                let room = self
                    .registry
                    .room(&code)
                    .map_err(|_| RpcError::RoomNotFound(code))?;

                // The proposing leader owns the authoritative timestamp;
                // whatever the forwarding node stamped was advisory
                operation.submit_timestamp = now_ms();

                let ack = match room.raft.propose(operation).await {
                    Ok(()) => RpcAck::ok(),
                    Err(ProposeError::NotLeader { leader }) => {
                        RpcAck::rejected("not the leader", leader)
                    }
                    Err(ProposeError::Poisoned) => RpcAck::rejected("room refuses writes", None),
                    Err(ProposeError::Closed) => RpcAck::rejected("room group stopped", None),
                };

                Ok(reply_value(&ack))
            }
        }
    }
}

fn reply_value<T: serde::Serialize>(reply: &T) -> Value {
    serde_json::to_value(reply).expect("rpc replies always serialize")
}
