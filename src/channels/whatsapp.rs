//! WhatsApp Cloud API gateway.
//!
//! Every send is a JSON POST to `{api_base}/{phone_number_id}/messages`
//! with a bearer token.

use async_trait::async_trait;
use secrecy::ExposeSecret;
use serde_json::{Value, json};

use crate::channels::gateway::ChannelGateway;
use crate::config::WhatsAppConfig;
use crate::error::ChannelError;
use crate::funnel::command::{ButtonOption, ListSection};

const CHANNEL_NAME: &str = "whatsapp";

/// Reply-button titles longer than this are rejected by the API.
pub const MAX_BUTTON_TITLE_CHARS: usize = 20;

/// List-row titles are capped at 24 characters.
pub const MAX_ROW_TITLE_CHARS: usize = 24;

pub struct WhatsAppGateway {
    config: WhatsAppConfig,
    client: reqwest::Client,
}

impl WhatsAppGateway {
    pub fn new(config: WhatsAppConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    fn messages_url(&self) -> String {
        format!(
            "{}/{}/messages",
            self.config.api_base.trim_end_matches('/'),
            self.config.phone_number_id
        )
    }

    async fn post(&self, kind: &str, body: Value) -> Result<(), ChannelError> {
        let resp = self
            .client
            .post(self.messages_url())
            .bearer_auth(self.config.access_token.expose_secret())
            .json(&body)
            .send()
            .await
            .map_err(|e| ChannelError::Http {
                name: CHANNEL_NAME.into(),
                reason: format!("{kind}: {e}"),
            })?;

        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }

        let detail = resp.text().await.unwrap_or_default();
        match status.as_u16() {
            401 | 403 => Err(ChannelError::AuthFailed {
                name: CHANNEL_NAME.into(),
                reason: detail,
            }),
            429 => Err(ChannelError::RateLimited {
                name: CHANNEL_NAME.into(),
            }),
            _ => Err(ChannelError::SendFailed {
                name: CHANNEL_NAME.into(),
                kind: kind.into(),
                reason: format!("HTTP {status}: {detail}"),
            }),
        }
    }
}

/// Char-safe truncation.
fn truncate_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

/// Envelope for a message to one recipient.
fn message_body(to: &str, kind: &str, payload: Value) -> Value {
    let mut body = json!({
        "messaging_product": "whatsapp",
        "recipient_type": "individual",
        "to": to,
        "type": kind,
    });
    body[kind] = payload;
    body
}

fn buttons_payload(body: &str, options: &[ButtonOption]) -> Value {
    let buttons: Vec<Value> = options
        .iter()
        .take(crate::funnel::command::MAX_BUTTONS)
        .map(|o| {
            json!({
                "type": "reply",
                "reply": { "id": o.id, "title": truncate_chars(&o.title, MAX_BUTTON_TITLE_CHARS) },
            })
        })
        .collect();
    json!({
        "type": "button",
        "body": { "text": body },
        "action": { "buttons": buttons },
    })
}

fn list_payload(body: &str, button_label: &str, sections: &[ListSection]) -> Value {
    let sections: Vec<Value> = sections
        .iter()
        .map(|s| {
            let rows: Vec<Value> = s
                .rows
                .iter()
                .map(|r| {
                    json!({
                        "id": r.id,
                        "title": truncate_chars(&r.title, MAX_ROW_TITLE_CHARS),
                        "description": r.description,
                    })
                })
                .collect();
            json!({ "title": s.title, "rows": rows })
        })
        .collect();
    json!({
        "type": "list",
        "body": { "text": body },
        "action": { "button": button_label, "sections": sections },
    })
}

#[async_trait]
impl ChannelGateway for WhatsAppGateway {
    fn name(&self) -> &str {
        CHANNEL_NAME
    }

    async fn send_text(&self, to: &str, body: &str) -> Result<(), ChannelError> {
        let payload = json!({ "body": body, "preview_url": true });
        self.post("text", message_body(to, "text", payload)).await?;
        tracing::debug!(to, "WhatsApp text sent");
        Ok(())
    }

    async fn send_buttons(
        &self,
        to: &str,
        body: &str,
        options: &[ButtonOption],
    ) -> Result<(), ChannelError> {
        let payload = buttons_payload(body, options);
        self.post("buttons", message_body(to, "interactive", payload))
            .await?;
        tracing::debug!(to, count = options.len(), "WhatsApp buttons sent");
        Ok(())
    }

    async fn send_list(
        &self,
        to: &str,
        body: &str,
        button_label: &str,
        sections: &[ListSection],
    ) -> Result<(), ChannelError> {
        let payload = list_payload(body, button_label, sections);
        self.post("list", message_body(to, "interactive", payload))
            .await?;
        tracing::debug!(to, "WhatsApp list sent");
        Ok(())
    }

    async fn send_document(
        &self,
        to: &str,
        url: &str,
        caption: &str,
        filename: &str,
    ) -> Result<(), ChannelError> {
        let payload = json!({ "link": url, "caption": caption, "filename": filename });
        self.post("document", message_body(to, "document", payload))
            .await?;
        tracing::debug!(to, filename, "WhatsApp document sent");
        Ok(())
    }

    async fn mark_read(&self, message_id: &str) -> Result<(), ChannelError> {
        let body = json!({
            "messaging_product": "whatsapp",
            "status": "read",
            "message_id": message_id,
        });
        self.post("mark_read", body).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::funnel::command::ListRow;

    #[test]
    fn button_titles_are_truncated() {
        let payload = buttons_payload(
            "Pick one",
            &[
                ButtonOption::new("a", "💰 ROI Calculation and a lot more"),
                ButtonOption::new("b", "short"),
            ],
        );
        let buttons = payload["action"]["buttons"].as_array().unwrap();
        assert_eq!(buttons.len(), 2);
        let title = buttons[0]["reply"]["title"].as_str().unwrap();
        assert_eq!(title.chars().count(), MAX_BUTTON_TITLE_CHARS);
        assert_eq!(buttons[1]["reply"]["title"], "short");
        assert_eq!(buttons[0]["reply"]["id"], "a");
    }

    #[test]
    fn list_payload_shape() {
        let payload = list_payload(
            "Choose",
            "Select Option",
            &[ListSection {
                title: "Angill Options".into(),
                rows: vec![ListRow {
                    id: "referral".into(),
                    title: "Referral Program".into(),
                    description: "Earn by referring doctors".into(),
                }],
            }],
        );
        assert_eq!(payload["type"], "list");
        assert_eq!(payload["action"]["button"], "Select Option");
        assert_eq!(payload["action"]["sections"][0]["rows"][0]["id"], "referral");
    }

    #[test]
    fn envelope_nests_payload_under_type() {
        let body = message_body("+92300", "text", json!({ "body": "hi" }));
        assert_eq!(body["to"], "+92300");
        assert_eq!(body["type"], "text");
        assert_eq!(body["text"]["body"], "hi");
        assert_eq!(body["messaging_product"], "whatsapp");
    }

    fn gateway(api_base: &str) -> WhatsAppGateway {
        WhatsAppGateway::new(WhatsAppConfig {
            api_base: api_base.into(),
            phone_number_id: "12345".into(),
            access_token: secrecy::SecretString::from("token".to_string()),
            verify_token: "verify".into(),
        })
    }

    #[test]
    fn messages_url_joins_base_and_phone_id() {
        let gateway = gateway("https://graph.test/v21.0/");
        assert_eq!(gateway.messages_url(), "https://graph.test/v21.0/12345/messages");
    }

    #[tokio::test]
    async fn unreachable_api_is_an_http_error() {
        // Grab a free port, then close it so the connection is refused.
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let gateway = gateway(&format!("http://127.0.0.1:{port}"));

        let err = gateway.send_text("+92300", "hi").await.unwrap_err();
        assert!(matches!(err, ChannelError::Http { .. }), "got {err:?}");
    }
}
