//! Outbound commands and interaction facts: the values the pure core emits.
//!
//! The stage machine and the drip planner never talk to the channel or the
//! store directly. They return these values and the dispatch engine executes
//! them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Maximum number of reply buttons per interactive message.
pub const MAX_BUTTONS: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ButtonOption {
    pub id: String,
    pub title: String,
}

impl ButtonOption {
    pub fn new(id: &str, title: &str) -> Self {
        Self {
            id: id.to_string(),
            title: title.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListRow {
    pub id: String,
    pub title: String,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListSection {
    pub title: String,
    pub rows: Vec<ListRow>,
}

/// One side effect against the channel gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundCommand {
    SendText {
        to: String,
        body: String,
    },
    SendButtons {
        to: String,
        body: String,
        options: Vec<ButtonOption>,
    },
    SendList {
        to: String,
        body: String,
        button_label: String,
        sections: Vec<ListSection>,
    },
    SendDocument {
        to: String,
        url: String,
        caption: String,
        filename: String,
    },
    MarkRead {
        message_id: String,
    },
}

impl OutboundCommand {
    pub fn text(to: &str, body: impl Into<String>) -> Self {
        Self::SendText {
            to: to.to_string(),
            body: body.into(),
        }
    }

    /// Interactive buttons. Options beyond [`MAX_BUTTONS`] are dropped.
    pub fn buttons(to: &str, body: impl Into<String>, mut options: Vec<ButtonOption>) -> Self {
        options.truncate(MAX_BUTTONS);
        Self::SendButtons {
            to: to.to_string(),
            body: body.into(),
            options,
        }
    }

    pub fn document(to: &str, url: &str, caption: &str, filename: &str) -> Self {
        Self::SendDocument {
            to: to.to_string(),
            url: url.to_string(),
            caption: caption.to_string(),
            filename: filename.to_string(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::SendText { .. } => "send_text",
            Self::SendButtons { .. } => "send_buttons",
            Self::SendList { .. } => "send_list",
            Self::SendDocument { .. } => "send_document",
            Self::MarkRead { .. } => "mark_read",
        }
    }

    /// The contact a send targets; `None` for read receipts.
    pub fn recipient(&self) -> Option<&str> {
        match self {
            Self::SendText { to, .. }
            | Self::SendButtons { to, .. }
            | Self::SendList { to, .. }
            | Self::SendDocument { to, .. } => Some(to),
            Self::MarkRead { .. } => None,
        }
    }
}

/// A command that must not run before `not_before`.
///
/// Commands due at or before "now" run inline; the rest go to the deferred
/// queue. Dropping a deferred command never affects contact state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledCommand {
    pub not_before: DateTime<Utc>,
    pub command: OutboundCommand,
}

impl ScheduledCommand {
    pub fn now(now: DateTime<Utc>, command: OutboundCommand) -> Self {
        Self {
            not_before: now,
            command,
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.not_before <= now
    }
}

/// Kind of an append-only interaction record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InteractionKind {
    MessageReceived,
    MessageSent,
    OptionSelected,
    DocumentSent,
    CallScheduled,
    ReferralIssued,
    RegistrationCompleted,
}

impl InteractionKind {
    pub const ALL: [InteractionKind; 7] = [
        InteractionKind::MessageReceived,
        InteractionKind::MessageSent,
        InteractionKind::OptionSelected,
        InteractionKind::DocumentSent,
        InteractionKind::CallScheduled,
        InteractionKind::ReferralIssued,
        InteractionKind::RegistrationCompleted,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MessageReceived => "message_received",
            Self::MessageSent => "message_sent",
            Self::OptionSelected => "option_selected",
            Self::DocumentSent => "document_sent",
            Self::CallScheduled => "call_scheduled",
            Self::ReferralIssued => "referral_issued",
            Self::RegistrationCompleted => "registration_completed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == s)
    }
}

impl std::fmt::Display for InteractionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable audit fact: written once, never updated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InteractionFact {
    pub address: String,
    pub kind: InteractionKind,
    pub at: DateTime<Utc>,
    pub details: serde_json::Value,
}

impl InteractionFact {
    pub fn new(
        address: &str,
        kind: InteractionKind,
        at: DateTime<Utc>,
        details: serde_json::Value,
    ) -> Self {
        Self {
            address: address.to_string(),
            kind,
            at,
            details,
        }
    }
}
