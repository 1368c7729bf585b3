//! Message model shared by admission, fanout, and history.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::chat::time::DisplayClock;

pub type UserId = i64;
pub type GroupId = i64;

/// Where a message goes. A message has exactly one addressing mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Addressing {
    Direct(UserId),
    Group(GroupId),
}

impl Addressing {
    /// Build from the nullable wire/storage columns. Both set or both
    /// absent yields `None`.
    pub fn from_parts(receiver_id: Option<UserId>, group_id: Option<GroupId>) -> Option<Self> {
        match (receiver_id, group_id) {
            (Some(receiver), None) => Some(Addressing::Direct(receiver)),
            (None, Some(group)) => Some(Addressing::Group(group)),
            _ => None,
        }
    }

    pub fn receiver_id(&self) -> Option<UserId> {
        match self {
            Addressing::Direct(receiver) => Some(*receiver),
            Addressing::Group(_) => None,
        }
    }

    pub fn group_id(&self) -> Option<GroupId> {
        match self {
            Addressing::Direct(_) => None,
            Addressing::Group(group) => Some(*group),
        }
    }
}

/// A validated, stamped message that has not been persisted yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    pub content: String,
    pub sender_id: UserId,
    pub addressing: Addressing,
    pub created_at: DateTime<Utc>,
}

/// A persisted message. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: i64,
    pub content: String,
    pub sender_id: UserId,
    pub addressing: Addressing,
    pub created_at: DateTime<Utc>,
}

impl NewMessage {
    pub fn into_persisted(self, id: i64) -> Message {
        Message {
            id,
            content: self.content,
            sender_id: self.sender_id,
            addressing: self.addressing,
            created_at: self.created_at,
        }
    }
}

/// Inbound payload from a client, over WebSocket or REST.
/// Any client-supplied sender field is ignored.
#[derive(Debug, Clone, Deserialize)]
pub struct InboundPayload {
    pub content: String,
    #[serde(default)]
    pub receiver_id: Option<UserId>,
    #[serde(default)]
    pub group_id: Option<GroupId>,
}

/// Message as pushed to recipients and returned by history queries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePayload {
    pub id: i64,
    pub content: String,
    pub sender_id: UserId,
    pub receiver_id: Option<UserId>,
    pub group_id: Option<GroupId>,
    pub created_at: String,
}

impl MessagePayload {
    pub fn render(message: &Message, clock: &DisplayClock) -> Self {
        Self {
            id: message.id,
            content: message.content.clone(),
            sender_id: message.sender_id,
            receiver_id: message.addressing.receiver_id(),
            group_id: message.addressing.group_id(),
            created_at: clock.render(message.created_at),
        }
    }
}
