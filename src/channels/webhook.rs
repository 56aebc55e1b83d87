//! WhatsApp webhook ingress: verification handshake and message decoding.
//!
//! `POST /webhook` acknowledges every delivery with 200 and processes each
//! decoded message on its own task.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::dispatch::DispatchEngine;
use crate::error::FunnelError;
use crate::funnel::event::InboundEvent;

const BUSINESS_ACCOUNT_OBJECT: &str = "whatsapp_business_account";

/// Shared state for webhook routes.
#[derive(Clone)]
pub struct WebhookState {
    pub engine: Arc<DispatchEngine>,
    pub verify_token: String,
}

// ── Wire shapes ─────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct VerifyParams {
    #[serde(rename = "hub.mode")]
    mode: Option<String>,
    #[serde(rename = "hub.verify_token")]
    verify_token: Option<String>,
    #[serde(rename = "hub.challenge")]
    challenge: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct WebhookPayload {
    #[serde(default)]
    object: String,
    #[serde(default)]
    entry: Vec<WebhookEntry>,
}

#[derive(Debug, Default, Deserialize)]
struct WebhookEntry {
    #[serde(default)]
    changes: Vec<WebhookChange>,
}

#[derive(Debug, Default, Deserialize)]
struct WebhookChange {
    #[serde(default)]
    value: ChangeValue,
}

#[derive(Debug, Default, Deserialize)]
struct ChangeValue {
    #[serde(default)]
    messages: Vec<WireMessage>,
    #[serde(default)]
    statuses: Vec<serde_json::Value>,
}

#[derive(Debug, Default, Deserialize)]
struct WireMessage {
    #[serde(default)]
    from: String,
    #[serde(default)]
    id: String,
    /// Epoch seconds, as a string.
    #[serde(default)]
    timestamp: Option<String>,
    #[serde(rename = "type", default)]
    kind: String,
    text: Option<WireText>,
    interactive: Option<WireInteractive>,
}

#[derive(Debug, Deserialize)]
struct WireText {
    body: String,
}

#[derive(Debug, Deserialize)]
struct WireInteractive {
    button_reply: Option<WireReply>,
    list_reply: Option<WireReply>,
}

#[derive(Debug, Deserialize)]
struct WireReply {
    id: String,
}

// ── Decoding ────────────────────────────────────────────────────────────

fn parse_timestamp(raw: Option<&str>, fallback: DateTime<Utc>) -> DateTime<Utc> {
    raw.and_then(|s| s.trim().parse::<i64>().ok())
        .and_then(|secs| DateTime::from_timestamp(secs, 0))
        .unwrap_or(fallback)
}

fn decode_message(msg: &WireMessage, received_at: DateTime<Utc>) -> Result<InboundEvent, FunnelError> {
    let button_id = msg
        .interactive
        .as_ref()
        .and_then(|i| i.button_reply.as_ref())
        .map(|r| r.id.as_str());
    let list_id = msg
        .interactive
        .as_ref()
        .and_then(|i| i.list_reply.as_ref())
        .map(|r| r.id.as_str());

    let kind = match (msg.kind.as_str(), button_id, list_id) {
        (_, Some(_), _) => "button",
        (_, None, Some(_)) => "list",
        ("text", None, None) => "text",
        (other, None, None) => other,
    };

    InboundEvent::from_parts(
        &msg.from,
        &msg.id,
        parse_timestamp(msg.timestamp.as_deref(), received_at),
        kind,
        msg.text.as_ref().map(|t| t.body.as_str()),
        button_id,
        list_id,
    )
}

/// Decode every message in a delivery. Malformed messages come back as
/// errors alongside the good ones; status callbacks are counted but dropped.
pub fn decode_payload(
    payload: &WebhookPayload,
    received_at: DateTime<Utc>,
) -> (Vec<InboundEvent>, Vec<FunnelError>, usize) {
    let mut events = Vec::new();
    let mut rejected = Vec::new();
    let mut statuses = 0;

    if payload.object != BUSINESS_ACCOUNT_OBJECT {
        return (events, rejected, statuses);
    }

    for change in payload.entry.iter().flat_map(|e| e.changes.iter()) {
        statuses += change.value.statuses.len();
        for msg in &change.value.messages {
            match decode_message(msg, received_at) {
                Ok(event) => events.push(event),
                Err(e) => rejected.push(e),
            }
        }
    }
    (events, rejected, statuses)
}

// ── Handlers ────────────────────────────────────────────────────────────

/// GET /webhook
///
/// Echoes `hub.challenge` when the mode is `subscribe` and the token matches.
async fn verify(
    State(state): State<WebhookState>,
    Query(params): Query<VerifyParams>,
) -> impl IntoResponse {
    let mode_ok = params.mode.as_deref() == Some("subscribe");
    let token_ok = params.verify_token.as_deref() == Some(state.verify_token.as_str());

    if mode_ok && token_ok {
        tracing::info!("Webhook verified");
        (StatusCode::OK, params.challenge.unwrap_or_default()).into_response()
    } else {
        tracing::warn!(target: "audit", mode = ?params.mode, "Webhook verification rejected");
        StatusCode::FORBIDDEN.into_response()
    }
}

/// POST /webhook
async fn receive(
    State(state): State<WebhookState>,
    body: Bytes,
) -> impl IntoResponse {
    let payload: WebhookPayload = match serde_json::from_slice(&body) {
        Ok(p) => p,
        Err(e) => {
            tracing::warn!(target: "audit", error = %e, "Undecodable webhook body");
            return StatusCode::OK;
        }
    };

    let received_at = state.engine.now();
    let (events, rejected, statuses) = decode_payload(&payload, received_at);

    for err in rejected {
        tracing::warn!(target: "audit", error = %err, "Dropping malformed inbound event");
    }
    if statuses > 0 {
        tracing::debug!(count = statuses, "Ignoring status callbacks");
    }

    // One task per contact so a batch from the same sender applies in order.
    for batch in group_by_contact(events) {
        let engine = Arc::clone(&state.engine);
        tokio::spawn(async move {
            for event in batch {
                let address = event.address.clone();
                if let Err(e) = engine.handle_event(event).await {
                    tracing::error!(address = %address, error = %e, "Inbound event not processed");
                }
            }
        });
    }

    StatusCode::OK
}

/// Split events into per-address batches, keeping delivery order within
/// each batch and first-seen order across batches.
fn group_by_contact(events: Vec<InboundEvent>) -> Vec<Vec<InboundEvent>> {
    let mut batches: Vec<Vec<InboundEvent>> = Vec::new();
    for event in events {
        match batches.iter_mut().find(|b| b[0].address == event.address) {
            Some(batch) => batch.push(event),
            None => batches.push(vec![event]),
        }
    }
    batches
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

/// Build the webhook routes.
pub fn webhook_routes(state: WebhookState) -> Router {
    Router::new()
        .route("/webhook", get(verify).post(receive))
        .route("/health", get(health))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::funnel::event::EventPayload;
    use serde_json::json;

    fn delivery(messages: serde_json::Value) -> WebhookPayload {
        serde_json::from_value(json!({
            "object": "whatsapp_business_account",
            "entry": [{ "changes": [{ "value": { "messages": messages } }] }]
        }))
        .unwrap()
    }

    #[test]
    fn decodes_text_button_and_list() {
        let payload = delivery(json!([
            { "from": "923001234567", "id": "wamid.1", "timestamp": "1700000000",
              "type": "text", "text": { "body": "Hello" } },
            { "from": "923001234567", "id": "wamid.2", "timestamp": "1700000001",
              "type": "interactive", "interactive": { "button_reply": { "id": "yes_call", "title": "Yes" } } },
            { "from": "923001234567", "id": "wamid.3", "timestamp": "1700000002",
              "type": "interactive", "interactive": { "list_reply": { "id": "referral", "title": "Referral" } } }
        ]));

        let (events, rejected, _) = decode_payload(&payload, Utc::now());
        assert!(rejected.is_empty());
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].payload, EventPayload::FreeText("Hello".into()));
        assert_eq!(events[0].timestamp.timestamp(), 1_700_000_000);
        assert_eq!(events[1].payload, EventPayload::Button("yes_call".into()));
        assert_eq!(events[2].payload, EventPayload::ListSelection("referral".into()));
    }

    #[test]
    fn malformed_messages_are_rejected_individually() {
        let payload = delivery(json!([
            { "from": "", "id": "wamid.1", "type": "text", "text": { "body": "hi" } },
            { "from": "923001234567", "id": "wamid.2", "type": "image" },
            { "from": "923001234567", "id": "wamid.3", "type": "text", "text": { "body": "ok" } }
        ]));

        let (events, rejected, _) = decode_payload(&payload, Utc::now());
        assert_eq!(events.len(), 1);
        assert_eq!(rejected.len(), 2);
        assert!(rejected.iter().all(|e| matches!(e, FunnelError::MalformedEvent(_))));
    }

    #[test]
    fn foreign_objects_and_statuses_are_ignored() {
        let foreign: WebhookPayload = serde_json::from_value(json!({
            "object": "page",
            "entry": [{ "changes": [{ "value": { "messages": [
                { "from": "1", "id": "x", "type": "text", "text": { "body": "hi" } }
            ] } }] }]
        }))
        .unwrap();
        let (events, rejected, _) = decode_payload(&foreign, Utc::now());
        assert!(events.is_empty() && rejected.is_empty());

        let statuses: WebhookPayload = serde_json::from_value(json!({
            "object": "whatsapp_business_account",
            "entry": [{ "changes": [{ "value": { "statuses": [{ "status": "read" }] } }] }]
        }))
        .unwrap();
        let (events, _, count) = decode_payload(&statuses, Utc::now());
        assert!(events.is_empty());
        assert_eq!(count, 1);
    }

    #[test]
    fn bad_timestamp_falls_back_to_receipt_time() {
        let now = Utc::now();
        assert_eq!(parse_timestamp(Some("not-a-number"), now), now);
        assert_eq!(parse_timestamp(None, now), now);
    }

    #[test]
    fn batches_keep_per_contact_order() {
        let now = Utc::now();
        let events = vec![
            InboundEvent::text("A", "1", now, "Ali Khan"),
            InboundEvent::text("B", "2", now, "Sana Malik"),
            InboundEvent::text("A", "3", now, "Lahore"),
            InboundEvent::text("A", "4", now, "Cardiologist"),
            InboundEvent::text("B", "5", now, "Karachi"),
        ];

        let batches = group_by_contact(events);
        let ids: Vec<Vec<&str>> = batches
            .iter()
            .map(|b| b.iter().map(|e| e.message_id.as_str()).collect())
            .collect();
        assert_eq!(ids, vec![vec!["1", "3", "4"], vec!["2", "5"]]);
        assert!(group_by_contact(Vec::new()).is_empty());
    }
}
