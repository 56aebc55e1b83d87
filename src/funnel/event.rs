//! Normalized inbound events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::FunnelError;

/// What the contact did. Exactly one of these per event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum EventPayload {
    FreeText(String),
    Button(String),
    ListSelection(String),
}

impl EventPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::FreeText(_) => "text",
            Self::Button(_) => "button",
            Self::ListSelection(_) => "list",
        }
    }

    /// The raw text or option id carried by the event.
    pub fn value(&self) -> &str {
        match self {
            Self::FreeText(v) | Self::Button(v) | Self::ListSelection(v) => v,
        }
    }
}

/// One inbound message or click, as decoded by the delivery surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundEvent {
    pub address: String,
    pub message_id: String,
    pub timestamp: DateTime<Utc>,
    pub payload: EventPayload,
}

impl InboundEvent {
    pub fn text(
        address: impl Into<String>,
        message_id: impl Into<String>,
        timestamp: DateTime<Utc>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            address: address.into(),
            message_id: message_id.into(),
            timestamp,
            payload: EventPayload::FreeText(text.into()),
        }
    }

    pub fn button(
        address: impl Into<String>,
        message_id: impl Into<String>,
        timestamp: DateTime<Utc>,
        button_id: impl Into<String>,
    ) -> Self {
        Self {
            address: address.into(),
            message_id: message_id.into(),
            timestamp,
            payload: EventPayload::Button(button_id.into()),
        }
    }

    pub fn list(
        address: impl Into<String>,
        message_id: impl Into<String>,
        timestamp: DateTime<Utc>,
        list_id: impl Into<String>,
    ) -> Self {
        Self {
            address: address.into(),
            message_id: message_id.into(),
            timestamp,
            payload: EventPayload::ListSelection(list_id.into()),
        }
    }

    /// Build an event from the loose wire shape
    /// `{address, messageId, timestamp, kind, text?, buttonId?, listId?}`.
    ///
    /// Unknown kinds, a missing address, and empty payloads are rejected.
    pub fn from_parts(
        address: &str,
        message_id: &str,
        timestamp: DateTime<Utc>,
        kind: &str,
        text: Option<&str>,
        button_id: Option<&str>,
        list_id: Option<&str>,
    ) -> Result<Self, FunnelError> {
        let address = address.trim();
        if address.is_empty() {
            return Err(FunnelError::MalformedEvent("missing sender address".into()));
        }

        fn non_empty(v: Option<&str>) -> Option<&str> {
            v.map(str::trim).filter(|v| !v.is_empty())
        }

        let payload = match kind {
            "text" => non_empty(text).map(|t| EventPayload::FreeText(t.to_string())),
            "button" => non_empty(button_id).map(|b| EventPayload::Button(b.to_string())),
            "list" => non_empty(list_id).map(|l| EventPayload::ListSelection(l.to_string())),
            other => {
                return Err(FunnelError::MalformedEvent(format!(
                    "unrecognized event kind '{other}' from {address}"
                )));
            }
        }
        .ok_or_else(|| {
            FunnelError::MalformedEvent(format!("empty {kind} payload from {address}"))
        })?;

        Ok(Self {
            address: address.to_string(),
            message_id: message_id.to_string(),
            timestamp,
            payload,
        })
    }
}
