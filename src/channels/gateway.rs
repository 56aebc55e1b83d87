//! Outbound channel seam.

use async_trait::async_trait;

use crate::error::ChannelError;
use crate::funnel::command::{ButtonOption, ListSection, OutboundCommand};

/// Sends messages to contacts. Every call may fail transiently; callers log
/// and move on rather than retry.
#[async_trait]
pub trait ChannelGateway: Send + Sync {
    /// Channel name for logs and errors.
    fn name(&self) -> &str;

    async fn send_text(&self, to: &str, body: &str) -> Result<(), ChannelError>;

    /// Reply buttons. Implementations shorten titles to the channel's limit.
    async fn send_buttons(
        &self,
        to: &str,
        body: &str,
        options: &[ButtonOption],
    ) -> Result<(), ChannelError>;

    async fn send_list(
        &self,
        to: &str,
        body: &str,
        button_label: &str,
        sections: &[ListSection],
    ) -> Result<(), ChannelError>;

    async fn send_document(
        &self,
        to: &str,
        url: &str,
        caption: &str,
        filename: &str,
    ) -> Result<(), ChannelError>;

    async fn mark_read(&self, message_id: &str) -> Result<(), ChannelError>;

    /// Run one outbound command.
    async fn execute(&self, command: &OutboundCommand) -> Result<(), ChannelError> {
        match command {
            OutboundCommand::SendText { to, body } => self.send_text(to, body).await,
            OutboundCommand::SendButtons { to, body, options } => {
                self.send_buttons(to, body, options).await
            }
            OutboundCommand::SendList {
                to,
                body,
                button_label,
                sections,
            } => self.send_list(to, body, button_label, sections).await,
            OutboundCommand::SendDocument {
                to,
                url,
                caption,
                filename,
            } => self.send_document(to, url, caption, filename).await,
            OutboundCommand::MarkRead { message_id } => self.mark_read(message_id).await,
        }
    }
}
