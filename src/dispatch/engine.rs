//! Dispatch engine: runs inbound events through the stage machine and
//! carries out what it asks for.
//!
//! For each event: take the contact's lock, drop it if its message id was
//! already applied, load (or create) the record, compute the transition,
//! persist it under the version check, append the interaction facts and the
//! transcript line, then send. Commands due now go out inline; later ones go
//! to the [`DeferredQueue`]. Send failures are logged and never roll back the
//! stage update.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::channels::ChannelGateway;
use crate::clock::Clock;
use crate::contacts::Contact;
use crate::conversations::TranscriptMessage;
use crate::dispatch::deferred::DeferredQueue;
use crate::dispatch::locks::ContactLocks;
use crate::error::{ChannelError, DatabaseError, FunnelError};
use crate::funnel::command::{InteractionFact, InteractionKind, OutboundCommand, ScheduledCommand};
use crate::funnel::content::ContentCatalog;
use crate::funnel::event::InboundEvent;
use crate::funnel::machine::{Transition, TransitionContext, transition};
use crate::funnel::referral::issue_referral;
use crate::store::Database;

/// What happened to one inbound event.
#[derive(Debug, Clone)]
pub struct HandledEvent {
    /// The contact as stored after the event.
    pub contact: Contact,
    /// Commands attempted inline (whether or not the send succeeded).
    pub sent_now: usize,
    pub send_failures: usize,
    pub deferred: usize,
    /// The message id had already been applied; nothing changed.
    pub duplicate: bool,
}

pub struct DispatchEngine {
    pub(crate) store: Arc<dyn Database>,
    pub(crate) gateway: Arc<dyn ChannelGateway>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) catalog: ContentCatalog,
    pub(crate) locks: ContactLocks,
    deferred: Arc<DeferredQueue>,
}

impl DispatchEngine {
    pub fn new(
        store: Arc<dyn Database>,
        gateway: Arc<dyn ChannelGateway>,
        clock: Arc<dyn Clock>,
        catalog: ContentCatalog,
    ) -> Self {
        Self {
            store,
            gateway,
            clock,
            catalog,
            locks: ContactLocks::new(),
            deferred: Arc::new(DeferredQueue::new()),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn store(&self) -> &Arc<dyn Database> {
        &self.store
    }

    pub fn gateway(&self) -> &Arc<dyn ChannelGateway> {
        &self.gateway
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn catalog(&self) -> &ContentCatalog {
        &self.catalog
    }

    pub fn deferred(&self) -> &Arc<DeferredQueue> {
        &self.deferred
    }

    /// Process one inbound event end to end.
    ///
    /// An `Err` means the event was not applied; the caller decides whether
    /// the delivery should be retried.
    pub async fn handle_event(&self, event: InboundEvent) -> Result<HandledEvent, FunnelError> {
        if !event.message_id.is_empty() {
            if let Err(e) = self.gateway.mark_read(&event.message_id).await {
                tracing::debug!(message_id = %event.message_id, error = %e, "Mark-read failed");
            }
        }

        let _guard = self.locks.acquire(&event.address).await;
        let now = self.clock.now();

        if self.already_applied(&event).await? {
            tracing::info!(
                address = %event.address,
                message_id = %event.message_id,
                "Duplicate delivery ignored"
            );
            return Ok(HandledEvent {
                contact: self.reload(&event.address).await?,
                sent_now: 0,
                send_failures: 0,
                deferred: 0,
                duplicate: true,
            });
        }

        let ctx = TransitionContext {
            now,
            catalog: &self.catalog,
        };

        let mut contact = self.load_or_create(&event.address, now).await?;
        let mut retried = false;

        let (stored, outcome) = loop {
            let mut outcome = transition(&contact, &event, &ctx);
            if outcome.referral_requested {
                let issued = issue_referral(
                    self.store.as_ref(),
                    &outcome.contact,
                    &self.catalog.links().referral_base_url,
                )
                .await?;
                outcome.complete_referral(&self.catalog, now, &issued.code, &issued.link);
            }

            match self.store.update_contact(&outcome.contact).await {
                Ok(stored) => break (stored, outcome),
                Err(DatabaseError::Conflict { .. }) if !retried => {
                    retried = true;
                    tracing::debug!(address = %event.address, "Version conflict, recomputing");
                    contact = self.reload(&event.address).await?;
                }
                Err(DatabaseError::Conflict { .. }) => {
                    return Err(FunnelError::ConcurrentUpdate {
                        address: event.address.clone(),
                    });
                }
                Err(e) => {
                    tracing::error!(address = %event.address, error = %e, "Contact update failed");
                    return Err(e.into());
                }
            }
        };

        if stored.stage != contact.stage {
            tracing::info!(
                address = %stored.address,
                from = %contact.stage,
                to = %stored.stage,
                "Stage advanced"
            );
        }

        let Transition {
            commands, facts, ..
        } = outcome;
        self.append_facts(&facts).await;
        self.record_transcript(&TranscriptMessage::incoming(&event, now)).await;
        let (sent_now, send_failures, deferred) = self.run_commands(commands, now).await;

        Ok(HandledEvent {
            contact: stored,
            sent_now,
            send_failures,
            deferred,
            duplicate: false,
        })
    }

    /// Mark a contact as registered on the platform: converted, drip stops.
    pub async fn mark_registered(&self, address: &str) -> Result<Contact, FunnelError> {
        let _guard = self.locks.acquire(address).await;
        let now = self.clock.now();

        let mut retried = false;
        loop {
            let mut contact = self.reload(address).await?;
            let already = contact.engagement.registered;
            contact.engagement.registered = true;
            contact.lifecycle.mark_converted();
            contact.updated_at = now;

            match self.store.update_contact(&contact).await {
                Ok(stored) => {
                    if !already {
                        let fact = InteractionFact::new(
                            address,
                            InteractionKind::RegistrationCompleted,
                            now,
                            serde_json::json!({ "status": stored.lifecycle.status }),
                        );
                        self.append_facts(std::slice::from_ref(&fact)).await;
                        tracing::info!(address, "Contact registered");
                    }
                    return Ok(stored);
                }
                Err(DatabaseError::Conflict { .. }) if !retried => retried = true,
                Err(DatabaseError::Conflict { .. }) => {
                    return Err(FunnelError::ConcurrentUpdate {
                        address: address.to_string(),
                    });
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn load_or_create(&self, address: &str, now: DateTime<Utc>) -> Result<Contact, FunnelError> {
        let unavailable = |source| FunnelError::ContactUnavailable {
            address: address.to_string(),
            source,
        };

        if let Some(contact) = self.store.get_contact(address).await.map_err(unavailable)? {
            return Ok(contact);
        }

        let fresh = Contact::new(address, now);
        if self
            .store
            .create_contact_if_absent(&fresh)
            .await
            .map_err(unavailable)?
        {
            tracing::info!(address, "New contact");
        }
        self.reload(address).await
    }

    pub(crate) async fn reload(&self, address: &str) -> Result<Contact, FunnelError> {
        let unavailable = |source| FunnelError::ContactUnavailable {
            address: address.to_string(),
            source,
        };
        self.store
            .get_contact(address)
            .await
            .map_err(unavailable)?
            .ok_or_else(|| {
                unavailable(DatabaseError::NotFound {
                    entity: "contact".into(),
                    id: address.to_string(),
                })
            })
    }

    /// Send whatever deferred commands are due now. Failures are logged and dropped.
    pub async fn flush_deferred(&self) -> usize {
        let now = self.clock.now();
        let due = self.deferred.drain_due(now);
        let count = due.len();
        for scheduled in due {
            if let Err(e) = self.send(&scheduled.command, now).await {
                tracing::warn!(
                    kind = scheduled.command.kind(),
                    to = scheduled.command.recipient().unwrap_or("-"),
                    error = %e,
                    "Deferred send failed"
                );
            }
        }
        count
    }

    /// Execute one command and write it to the transcript, delivered or not.
    pub(crate) async fn send(&self, command: &OutboundCommand, now: DateTime<Utc>) -> Result<(), ChannelError> {
        let result = self.gateway.execute(command).await;
        if let Some(line) = TranscriptMessage::outgoing(command, now, result.is_ok()) {
            self.record_transcript(&line).await;
        }
        result
    }

    async fn already_applied(&self, event: &InboundEvent) -> Result<bool, FunnelError> {
        if event.message_id.is_empty() {
            return Ok(false);
        }
        Ok(self
            .store
            .has_inbound_message(&event.address, &event.message_id)
            .await?)
    }

    async fn record_transcript(&self, message: &TranscriptMessage) {
        if let Err(e) = self.store.record_message(message).await {
            tracing::error!(
                address = %message.address,
                direction = message.direction.as_str(),
                error = %e,
                "Failed to record transcript message"
            );
        }
    }

    pub(crate) async fn append_facts(&self, facts: &[InteractionFact]) {
        for fact in facts {
            if let Err(e) = self.store.append_interaction(fact).await {
                tracing::error!(
                    address = %fact.address,
                    kind = %fact.kind,
                    error = %e,
                    "Failed to append interaction"
                );
            }
        }
    }

    /// Returns `(attempted, failed, deferred)`.
    async fn run_commands(&self, commands: Vec<ScheduledCommand>, now: DateTime<Utc>) -> (usize, usize, usize) {
        let mut attempted = 0;
        let mut failed = 0;
        let mut deferred = 0;

        for scheduled in commands {
            if !scheduled.is_due(now) {
                self.deferred.push(scheduled);
                deferred += 1;
                continue;
            }
            attempted += 1;
            if let Err(e) = self.send(&scheduled.command, now).await {
                failed += 1;
                tracing::warn!(
                    kind = scheduled.command.kind(),
                    to = scheduled.command.recipient().unwrap_or("-"),
                    error = %e,
                    "Send failed"
                );
            }
        }
        (attempted, failed, deferred)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contacts::{ContactStatus, Stage};
    use crate::conversations::{DeliveryStatus, Direction};
    use crate::store::LibSqlBackend;
    use crate::testing::{ManualClock, RecordingGateway};

    async fn engine() -> (Arc<DispatchEngine>, Arc<RecordingGateway>, Arc<ManualClock>, Arc<dyn Database>) {
        let store: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let gateway = Arc::new(RecordingGateway::new());
        let clock = Arc::new(ManualClock::new("2025-03-01T09:00:00Z".parse().unwrap()));
        let engine = Arc::new(DispatchEngine::new(
            Arc::clone(&store),
            gateway.clone(),
            clock.clone(),
            ContentCatalog::default(),
        ));
        (engine, gateway, clock, store)
    }

    #[tokio::test]
    async fn first_event_creates_contact_and_welcomes() {
        let (engine, gateway, clock, store) = engine().await;
        let event = InboundEvent::text("+923001234567", "wamid.1", clock.now(), "Hi");

        let handled = engine.handle_event(event).await.unwrap();
        assert_eq!(handled.contact.stage, Stage::CollectingName);
        assert_eq!(handled.sent_now, 1);
        assert_eq!(gateway.read_receipts(), vec!["wamid.1".to_string()]);
        assert!(matches!(gateway.sent()[0], OutboundCommand::SendText { .. }));

        let facts = store.list_interactions("+923001234567", 10).await.unwrap();
        assert_eq!(facts.len(), 1);
        assert_eq!(facts[0].kind, InteractionKind::MessageReceived);
    }

    #[tokio::test]
    async fn failed_send_still_advances_stage() {
        let (engine, gateway, clock, _) = engine().await;
        gateway.set_failing(true);
        let event = InboundEvent::text("+1", "m1", clock.now(), "Hello");

        let handled = engine.handle_event(event).await.unwrap();
        assert_eq!(handled.contact.stage, Stage::CollectingName);
        assert_eq!(handled.send_failures, 1);
    }

    #[tokio::test]
    async fn delayed_commands_are_deferred() {
        let (engine, gateway, clock, _) = engine().await;
        for (i, text) in ["Hi", "Ali Khan", "Lahore"].iter().enumerate() {
            let ev = InboundEvent::text("+1", format!("m{i}"), clock.now(), *text);
            engine.handle_event(ev).await.unwrap();
        }
        let before = gateway.sent().len();

        let ev = InboundEvent::text("+1", "m3", clock.now(), "Cardiologist");
        let handled = engine.handle_event(ev).await.unwrap();
        assert_eq!(handled.contact.stage, Stage::Menu);
        assert_eq!(handled.sent_now, 1);
        assert_eq!(handled.deferred, 1);
        assert_eq!(gateway.sent().len(), before + 1);
        assert_eq!(engine.deferred().len(), 1);
    }

    #[tokio::test]
    async fn redelivered_events_are_applied_once() {
        let (engine, gateway, clock, _) = engine().await;
        let hi = InboundEvent::text("+1", "wamid.1", clock.now(), "Hi");
        let name = InboundEvent::text("+1", "wamid.2", clock.now(), "Dr. Ali Khan");

        engine.handle_event(hi.clone()).await.unwrap();
        let again = engine.handle_event(hi).await.unwrap();
        assert!(again.duplicate);
        assert_eq!(again.contact.stage, Stage::CollectingName);
        assert_eq!(again.contact.profile.name, None);
        assert_eq!(again.sent_now, 0);

        engine.handle_event(name.clone()).await.unwrap();
        let again = engine.handle_event(name).await.unwrap();
        assert!(again.duplicate);
        assert_eq!(again.contact.stage, Stage::CollectingCity);
        assert_eq!(again.contact.profile.name.as_deref(), Some("Dr. Ali Khan"));
        assert_eq!(again.contact.profile.city, None);
        // Welcome plus the city prompt, nothing resent.
        assert_eq!(gateway.sent().len(), 2);
    }

    #[tokio::test]
    async fn events_without_ids_are_never_deduplicated() {
        let (engine, _, clock, _) = engine().await;
        engine
            .handle_event(InboundEvent::text("+1", "", clock.now(), "Hi"))
            .await
            .unwrap();
        let second = engine
            .handle_event(InboundEvent::text("+1", "", clock.now(), "Ali Khan"))
            .await
            .unwrap();
        assert!(!second.duplicate);
        assert_eq!(second.contact.stage, Stage::CollectingCity);
    }

    #[tokio::test]
    async fn transcript_records_both_directions() {
        let (engine, gateway, clock, store) = engine().await;
        engine
            .handle_event(InboundEvent::text("+1", "wamid.1", clock.now(), "Hi"))
            .await
            .unwrap();
        gateway.set_failing(true);
        engine
            .handle_event(InboundEvent::text("+1", "wamid.2", clock.now(), "Ali Khan"))
            .await
            .unwrap();

        let lines: Vec<_> = store
            .list_messages("+1", 10)
            .await
            .unwrap()
            .into_iter()
            .map(|m| (m.direction, m.status))
            .collect();
        assert_eq!(
            lines,
            vec![
                (Direction::Incoming, DeliveryStatus::Received),
                (Direction::Outgoing, DeliveryStatus::Sent),
                (Direction::Incoming, DeliveryStatus::Received),
                (Direction::Outgoing, DeliveryStatus::Failed),
            ]
        );
    }

    #[tokio::test]
    async fn flush_sends_due_and_survives_gateway_failure() {
        let (engine, gateway, clock, store) = engine().await;
        let later = clock.now() + chrono::Duration::seconds(2);
        for body in ["a", "b"] {
            engine.deferred().push(ScheduledCommand {
                not_before: later,
                command: OutboundCommand::text("+1", body),
            });
        }

        assert_eq!(engine.flush_deferred().await, 0);
        clock.advance(chrono::Duration::seconds(2));
        gateway.set_failing(true);
        assert_eq!(engine.flush_deferred().await, 2);
        assert!(engine.deferred().is_empty());
        assert!(gateway.sent().is_empty());

        let failed = store.list_messages("+1", 10).await.unwrap();
        assert_eq!(failed.len(), 2);
        assert!(failed.iter().all(|m| m.status == DeliveryStatus::Failed));
    }

    #[tokio::test]
    async fn registration_converts_and_stops_drip() {
        let (engine, _, clock, store) = engine().await;
        engine
            .handle_event(InboundEvent::text("+1", "m1", clock.now(), "Hi"))
            .await
            .unwrap();

        let contact = engine.mark_registered("+1").await.unwrap();
        assert!(contact.engagement.registered);
        assert_eq!(contact.lifecycle.status, ContactStatus::Converted);
        assert!(contact.lifecycle.next_follow_up_at.is_none());

        let kinds: Vec<_> = store
            .list_interactions("+1", 10)
            .await
            .unwrap()
            .into_iter()
            .map(|f| f.kind)
            .collect();
        assert!(kinds.contains(&InteractionKind::RegistrationCompleted));
    }

    #[tokio::test]
    async fn registering_unknown_contact_fails() {
        let (engine, _, _, _) = engine().await;
        let err = engine.mark_registered("+404").await.unwrap_err();
        assert!(matches!(err, FunnelError::ContactUnavailable { .. }));
    }
}
