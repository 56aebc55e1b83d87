//! Test doubles for the channel and the clock.

use std::collections::HashSet;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use crate::channels::ChannelGateway;
use crate::clock::Clock;
use crate::error::ChannelError;
use crate::funnel::command::{ButtonOption, ListSection, OutboundCommand};

/// Gateway that records every send instead of delivering it.
#[derive(Default)]
pub struct RecordingGateway {
    sent: Mutex<Vec<OutboundCommand>>,
    read_receipts: Mutex<Vec<String>>,
    failing: AtomicBool,
    failing_for: Mutex<HashSet<String>>,
}

impl RecordingGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// While set, every call fails and nothing is recorded.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Fail every send addressed to `to` until [`Self::recover`] is called.
    pub fn fail_for(&self, to: &str) {
        if let Ok(mut failing) = self.failing_for.lock() {
            failing.insert(to.to_string());
        }
    }

    pub fn recover(&self, to: &str) {
        if let Ok(mut failing) = self.failing_for.lock() {
            failing.remove(to);
        }
    }

    fn fails(&self, command: &OutboundCommand) -> bool {
        if self.failing.load(Ordering::SeqCst) {
            return true;
        }
        let Some(to) = command.recipient() else {
            return false;
        };
        self.failing_for
            .lock()
            .map(|f| f.contains(to))
            .unwrap_or(false)
    }

    /// Successfully sent commands, oldest first. Read receipts excluded.
    pub fn sent(&self) -> Vec<OutboundCommand> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }

    /// Sent commands addressed to `to`.
    pub fn sent_to(&self, to: &str) -> Vec<OutboundCommand> {
        self.sent()
            .into_iter()
            .filter(|c| c.recipient() == Some(to))
            .collect()
    }

    pub fn read_receipts(&self) -> Vec<String> {
        self.read_receipts.lock().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn clear(&self) {
        if let Ok(mut sent) = self.sent.lock() {
            sent.clear();
        }
    }

    fn record(&self, command: OutboundCommand) -> Result<(), ChannelError> {
        if self.fails(&command) {
            return Err(ChannelError::SendFailed {
                name: "recording".into(),
                kind: command.kind().into(),
                reason: "simulated failure".into(),
            });
        }
        if let Ok(mut sent) = self.sent.lock() {
            sent.push(command);
        }
        Ok(())
    }
}

#[async_trait]
impl ChannelGateway for RecordingGateway {
    fn name(&self) -> &str {
        "recording"
    }

    async fn send_text(&self, to: &str, body: &str) -> Result<(), ChannelError> {
        self.record(OutboundCommand::SendText {
            to: to.into(),
            body: body.into(),
        })
    }

    async fn send_buttons(
        &self,
        to: &str,
        body: &str,
        options: &[ButtonOption],
    ) -> Result<(), ChannelError> {
        self.record(OutboundCommand::SendButtons {
            to: to.into(),
            body: body.into(),
            options: options.to_vec(),
        })
    }

    async fn send_list(
        &self,
        to: &str,
        body: &str,
        button_label: &str,
        sections: &[ListSection],
    ) -> Result<(), ChannelError> {
        self.record(OutboundCommand::SendList {
            to: to.into(),
            body: body.into(),
            button_label: button_label.into(),
            sections: sections.to_vec(),
        })
    }

    async fn send_document(
        &self,
        to: &str,
        url: &str,
        caption: &str,
        filename: &str,
    ) -> Result<(), ChannelError> {
        self.record(OutboundCommand::SendDocument {
            to: to.into(),
            url: url.into(),
            caption: caption.into(),
            filename: filename.into(),
        })
    }

    async fn mark_read(&self, message_id: &str) -> Result<(), ChannelError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(ChannelError::RateLimited {
                name: "recording".into(),
            });
        }
        if let Ok(mut receipts) = self.read_receipts.lock() {
            receipts.push(message_id.to_string());
        }
        Ok(())
    }
}

/// Clock that only moves when told to.
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        if let Ok(mut now) = self.now.lock() {
            *now += by;
        }
    }

    pub fn set(&self, to: DateTime<Utc>) {
        if let Ok(mut now) = self.now.lock() {
            *now = to;
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        match self.now.lock() {
            Ok(now) => *now,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}
