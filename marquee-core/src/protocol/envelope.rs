use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::{
    AppendEntriesArgs, DecodeError, NodeId, Operation, OperationKind, RequestVoteArgs, RoomCode,
};

/// The envelope wrapped around every message on the inter-node link.
#[derive(Debug, Clone, PartialEq)]
pub struct RpcEnvelope {
    pub body: RpcBody,
    pub source_node_id: NodeId,
    pub target_node_id: Option<NodeId>,
    pub message_id: String,
    pub room_code: RoomCode,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RpcBody {
    RequestVote(RequestVoteArgs),
    AppendEntries(AppendEntriesArgs),
    CreateRoom(CreateRoomArgs),
    /// A client operation forwarded to the room's leader for stamping
    /// and proposal.
    Forward(Operation),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CreateRoomArgs {
    pub creator_user_id: String,
    pub creator_username: String,
}

/// The acknowledgement returned for create and forward calls.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcAck {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leader_id: Option<NodeId>,
}

impl RpcAck {
    pub fn ok() -> Self {
        Self {
            ok: true,
            ..Default::default()
        }
    }

    pub fn rejected(error: impl Into<String>, leader_id: Option<NodeId>) -> Self {
        Self {
            ok: false,
            error: Some(error.into()),
            leader_id,
        }
    }
}

/// The reply of the health endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReply {
    pub status: String,
    pub node_id: NodeId,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct RawEnvelope {
    #[serde(rename = "type")]
    kind: String,
    payload: Value,
    source_node_id: NodeId,
    #[serde(default)]
    target_node_id: Option<NodeId>,
    message_id: String,
    room_code: String,
}

impl RpcBody {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::RequestVote(_) => "REQUEST_VOTE",
            Self::AppendEntries(_) => "APPEND_ENTRIES",
            Self::CreateRoom(_) => "CREATE_ROOM",
            Self::Forward(operation) => operation.kind.name(),
        }
    }

    fn payload_value(&self) -> Value {
        match self {
            Self::RequestVote(args) => serde_json::to_value(args),
            Self::AppendEntries(args) => serde_json::to_value(args),
            Self::CreateRoom(args) => serde_json::to_value(args),
            Self::Forward(operation) => serde_json::to_value(operation),
        }
        .expect("rpc payloads always serialize")
    }
}

impl RpcEnvelope {
    pub fn encode(&self) -> String {
        let value = json!({
            "type": self.body.kind(),
            "payload": self.body.payload_value(),
            "sourceNodeId": self.source_node_id,
            "targetNodeId": self.target_node_id,
            "messageId": self.message_id,
            "roomCode": self.room_code,
        });

        value.to_string()
    }

    pub fn decode(text: &str, max_bytes: usize) -> Result<Self, DecodeError> {
        if text.len() > max_bytes {
            return Err(DecodeError::FrameTooLarge {
                size: text.len(),
                max: max_bytes,
            });
        }

        let raw: RawEnvelope =
            serde_json::from_str(text).map_err(|e| DecodeError::MalformedJson(e.to_string()))?;

        let body = match raw.kind.as_str() {
            "REQUEST_VOTE" => RpcBody::RequestVote(parse(&raw)?),
            "APPEND_ENTRIES" => RpcBody::AppendEntries(parse(&raw)?),
            "CREATE_ROOM" => RpcBody::CreateRoom(parse(&raw)?),
            other if OperationKind::is_forwardable(other) => {
                let operation: Operation = parse(&raw)?;

                if operation.kind.name() != other {
                    return Err(DecodeError::InvalidPayload {
                        kind: raw.kind,
                        reason: "envelope type does not match the operation".to_string(),
                    });
                }

                RpcBody::Forward(operation)
            }
            other => return Err(DecodeError::UnknownType(other.to_string())),
        };

        Ok(Self {
            body,
            source_node_id: raw.source_node_id,
            target_node_id: raw.target_node_id,
            message_id: raw.message_id,
            room_code: RoomCode::parse(&raw.room_code)?,
        })
    }
}

fn parse<T: serde::de::DeserializeOwned>(raw: &RawEnvelope) -> Result<T, DecodeError> {
    serde_json::from_value(raw.payload.clone()).map_err(|e| DecodeError::InvalidPayload {
        kind: raw.kind.clone(),
        reason: e.to_string(),
    })
}
