//! Transcript records: every message exchanged with a contact.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::funnel::command::OutboundCommand;
use crate::funnel::event::InboundEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Incoming,
    Outgoing,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Incoming => "incoming",
            Self::Outgoing => "outgoing",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "incoming" => Some(Self::Incoming),
            "outgoing" => Some(Self::Outgoing),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Received,
    Sent,
    Failed,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::Sent => "sent",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "received" => Some(Self::Received),
            "sent" => Some(Self::Sent),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// One line of a contact's conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscriptMessage {
    pub address: String,
    /// Provider id for incoming messages; outgoing sends carry none.
    pub message_id: Option<String>,
    pub direction: Direction,
    /// `text`, `button`, `list` or `document`.
    pub message_type: String,
    pub content: String,
    pub status: DeliveryStatus,
    pub at: DateTime<Utc>,
}

impl TranscriptMessage {
    pub fn incoming(event: &InboundEvent, at: DateTime<Utc>) -> Self {
        Self {
            address: event.address.clone(),
            message_id: Some(event.message_id.clone()).filter(|id| !id.is_empty()),
            direction: Direction::Incoming,
            message_type: event.payload.kind().to_string(),
            content: event.payload.value().to_string(),
            status: DeliveryStatus::Received,
            at,
        }
    }

    /// Transcript line for a send attempt. Read receipts are not messages.
    pub fn outgoing(command: &OutboundCommand, at: DateTime<Utc>, delivered: bool) -> Option<Self> {
        let (to, message_type, content) = match command {
            OutboundCommand::SendText { to, body } => (to, "text", body.as_str()),
            OutboundCommand::SendButtons { to, body, .. } => (to, "button", body.as_str()),
            OutboundCommand::SendList { to, body, .. } => (to, "list", body.as_str()),
            OutboundCommand::SendDocument { to, caption, .. } => (to, "document", caption.as_str()),
            OutboundCommand::MarkRead { .. } => return None,
        };
        Some(Self {
            address: to.clone(),
            message_id: None,
            direction: Direction::Outgoing,
            message_type: message_type.to_string(),
            content: content.to_string(),
            status: if delivered {
                DeliveryStatus::Sent
            } else {
                DeliveryStatus::Failed
            },
            at,
        })
    }
}

/// A contact's conversation at a glance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConversationSummary {
    pub address: String,
    pub name: Option<String>,
    pub city: Option<String>,
    pub specialty: Option<String>,
    pub status: Option<String>,
    pub stage: Option<String>,
    pub message_count: i64,
    pub last_message_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConversationStats {
    pub total: i64,
    /// Conversations whose contact is still `active` or `warm_lead`.
    pub active: i64,
    pub average_messages: f64,
    /// Conversations with a message in the last 24 hours.
    pub recent_activity: i64,
    pub top_active: Vec<ConversationSummary>,
}

/// Filter for searching message content.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageSearch {
    /// Case-insensitive substring of any message in the conversation.
    pub text: Option<String>,
    /// Bounds on the conversation's latest message.
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub limit: usize,
}
