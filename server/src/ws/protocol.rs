//! JSON frames exchanged over the realtime connection.
//!
//! Client -> server: one `InboundPayload` per text frame.
//! Server -> client: a bare `MessagePayload` for each delivery, or
//! `{"error": {"code", "message"}}` for a rejected inbound payload.

use axum::extract::ws::Message;
use serde::{Deserialize, Serialize};

use crate::chat::message::{InboundPayload, Message as ChatMessage, MessagePayload};
use crate::chat::time::DisplayClock;
use crate::error::AdmissionError;

/// Close codes used by the realtime endpoint.
pub const CLOSE_GOING_AWAY: u16 = 1001;
pub const CLOSE_UNSUPPORTED_DATA: u16 = 1003;
pub const CLOSE_INVALID_PAYLOAD: u16 = 1007;
pub const CLOSE_SUPERSEDED: u16 = 4000;
pub const CLOSE_TOKEN_EXPIRED: u16 = 4001;
pub const CLOSE_TOKEN_INVALID: u16 = 4002;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorFrame {
    pub error: ErrorBody,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

/// Decode a text frame into an inbound payload.
pub fn decode_inbound(text: &str) -> Result<InboundPayload, serde_json::Error> {
    serde_json::from_str(text)
}

/// Encode a persisted message as the frame pushed to recipients.
pub fn delivery_frame(
    message: &ChatMessage,
    clock: &DisplayClock,
) -> Result<Message, serde_json::Error> {
    let json = serde_json::to_string(&MessagePayload::render(message, clock))?;
    Ok(Message::Text(json.into()))
}

pub fn error_frame(err: &AdmissionError) -> Result<Message, serde_json::Error> {
    let frame = ErrorFrame {
        error: ErrorBody {
            code: err.code().to_string(),
            message: err.to_string(),
        },
    };
    Ok(Message::Text(serde_json::to_string(&frame)?.into()))
}
