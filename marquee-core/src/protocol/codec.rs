use serde::de::DeserializeOwned;
use serde::Deserialize;
use thiserror::Error;

use super::{
    ChatMessagePayload, ClientMessage, PlaybackPausePayload, PlaybackPlayPayload,
    PlaybackSeekPayload, PlaylistAddPayload, PlaylistRemovePayload, RoomCreatePayload,
    RoomJoinPayload, RoomLeavePayload, ServerMessage,
};

/// How many characters a chat message may hold.
pub const MAX_CHAT_CHARS: usize = 500;

/// A decode failure on either link. Never panics, never tears the link.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("frame of {size} bytes exceeds the {max} byte cap")]
    FrameTooLarge { size: usize, max: usize },
    #[error("malformed JSON: {0}")]
    MalformedJson(String),
    #[error("unknown message type {0:?}")]
    UnknownType(String),
    #[error("invalid {kind} payload: {reason}")]
    InvalidPayload { kind: String, reason: String },
    #[error("chat text of {len} characters exceeds the {max} character cap")]
    ChatTooLong { len: usize, max: usize },
    #[error("malformed room code {0:?}")]
    BadRoomCode(String),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct RawFrame {
    #[serde(rename = "type")]
    kind: String,
    payload: serde_json::Value,
}

/// Decodes one client frame, enforcing the frame cap and strict payloads.
pub fn decode_client_frame(text: &str, max_bytes: usize) -> Result<ClientMessage, DecodeError> {
    if text.len() > max_bytes {
        return Err(DecodeError::FrameTooLarge {
            size: text.len(),
            max: max_bytes,
        });
    }

    let frame: RawFrame =
        serde_json::from_str(text).map_err(|e| DecodeError::MalformedJson(e.to_string()))?;

    let message = match frame.kind.as_str() {
        "ROOM_CREATE" => ClientMessage::RoomCreate(payload(&frame)?),
        "ROOM_JOIN" => ClientMessage::RoomJoin(payload(&frame)?),
        "ROOM_LEAVE" => ClientMessage::RoomLeave(payload(&frame)?),
        "PLAYBACK_PLAY" => {
            let parsed: PlaybackPlayPayload = payload(&frame)?;
            require_finite(&frame, parsed.position_seconds)?;
            ClientMessage::PlaybackPlay(parsed)
        }
        "PLAYBACK_PAUSE" => {
            let parsed: PlaybackPausePayload = payload(&frame)?;
            require_finite(&frame, parsed.position_seconds)?;
            ClientMessage::PlaybackPause(parsed)
        }
        "PLAYBACK_SEEK" => {
            let parsed: PlaybackSeekPayload = payload(&frame)?;
            require_finite(&frame, parsed.new_position_seconds)?;
            ClientMessage::PlaybackSeek(parsed)
        }
        "PLAYLIST_ADD" => ClientMessage::PlaylistAdd(payload(&frame)?),
        "PLAYLIST_REMOVE" => ClientMessage::PlaylistRemove(payload(&frame)?),
        "CHAT_MESSAGE" => {
            let parsed: ChatMessagePayload = payload(&frame)?;
            let len = parsed.message_text.chars().count();

            if len > MAX_CHAT_CHARS {
                return Err(DecodeError::ChatTooLong {
                    len,
                    max: MAX_CHAT_CHARS,
                });
            }

            ClientMessage::ChatMessage(parsed)
        }
        other => return Err(DecodeError::UnknownType(other.to_string())),
    };

    Ok(message)
}

/// Encodes one server frame.
pub fn encode_server_frame(message: &ServerMessage) -> String {
    serde_json::to_string(message).expect("server frames always serialize")
}

fn payload<T: DeserializeOwned>(frame: &RawFrame) -> Result<T, DecodeError> {
    serde_json::from_value(frame.payload.clone()).map_err(|e| DecodeError::InvalidPayload {
        kind: frame.kind.clone(),
        reason: e.to_string(),
    })
}

fn require_finite(frame: &RawFrame, value: f64) -> Result<(), DecodeError> {
    if value.is_finite() {
        return Ok(());
    }

    Err(DecodeError::InvalidPayload {
        kind: frame.kind.clone(),
        reason: "position must be a finite number".to_string(),
    })
}
