//! Messaging channel: outbound gateway and inbound webhook.

pub mod gateway;
pub mod webhook;
pub mod whatsapp;

pub use gateway::ChannelGateway;
pub use webhook::{WebhookState, webhook_routes};
pub use whatsapp::WhatsAppGateway;
