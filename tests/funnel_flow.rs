//! End-to-end funnel scenarios through the dispatch engine, an in-memory
//! store, a recording gateway and a manual clock.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use chrono::{DateTime, Duration, Utc};

use funnel_assist::clock::Clock;
use funnel_assist::contacts::{ContactStatus, Stage, Track};
use funnel_assist::dispatch::{DispatchEngine, DripScheduler, HandledEvent};
use funnel_assist::funnel::content::buttons;
use funnel_assist::funnel::{ContentCatalog, InboundEvent, InteractionKind, OutboundCommand};
use funnel_assist::store::{Database, LibSqlBackend};
use funnel_assist::testing::{ManualClock, RecordingGateway};

const ALI: &str = "+923001234567";

struct Harness {
    engine: Arc<DispatchEngine>,
    drip: DripScheduler,
    gateway: Arc<RecordingGateway>,
    clock: Arc<ManualClock>,
    store: Arc<dyn Database>,
    seq: AtomicUsize,
}

impl Harness {
    async fn new() -> Self {
        let store: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let gateway = Arc::new(RecordingGateway::new());
        let clock = Arc::new(ManualClock::new(start()));
        let engine = Arc::new(DispatchEngine::new(
            Arc::clone(&store),
            gateway.clone(),
            clock.clone(),
            ContentCatalog::default(),
        ));
        let drip = DripScheduler::new(Arc::clone(&engine), 100);
        Self {
            engine,
            drip,
            gateway,
            clock,
            store,
            seq: AtomicUsize::new(0),
        }
    }

    fn message_id(&self) -> String {
        format!("wamid.{}", self.seq.fetch_add(1, Ordering::SeqCst))
    }

    async fn text(&self, from: &str, body: &str) -> HandledEvent {
        let ev = InboundEvent::text(from, self.message_id(), self.clock.now(), body);
        self.engine.handle_event(ev).await.unwrap()
    }

    /// Deliver a text with a fixed message id, as a provider redelivery would.
    async fn deliver(&self, from: &str, message_id: &str, body: &str) -> HandledEvent {
        let ev = InboundEvent::text(from, message_id, self.clock.now(), body);
        self.engine.handle_event(ev).await.unwrap()
    }

    async fn button(&self, from: &str, id: &str) -> HandledEvent {
        let ev = InboundEvent::button(from, self.message_id(), self.clock.now(), id);
        self.engine.handle_event(ev).await.unwrap()
    }

    async fn list(&self, from: &str, id: &str) -> HandledEvent {
        let ev = InboundEvent::list(from, self.message_id(), self.clock.now(), id);
        self.engine.handle_event(ev).await.unwrap()
    }

    /// Let the presentation delays elapse and send what became due.
    async fn settle(&self) {
        self.clock.advance(Duration::seconds(10));
        self.engine.flush_deferred().await;
    }

    async fn onboard(&self, from: &str) {
        self.text(from, "Hi").await;
        self.text(from, "Ali Khan").await;
        self.text(from, "Lahore").await;
        self.text(from, "Cardiologist").await;
        self.settle().await;
    }

    async fn kinds(&self, address: &str) -> Vec<InteractionKind> {
        self.store
            .list_interactions(address, 100)
            .await
            .unwrap()
            .into_iter()
            .map(|f| f.kind)
            .collect()
    }
}

fn start() -> DateTime<Utc> {
    "2025-03-01T09:00:00Z".parse().unwrap()
}

fn last_text(gateway: &RecordingGateway) -> String {
    gateway
        .sent()
        .into_iter()
        .rev()
        .find_map(|c| match c {
            OutboundCommand::SendText { body, .. } => Some(body),
            _ => None,
        })
        .unwrap_or_default()
}

#[tokio::test]
async fn onboarding_collects_profile_then_shows_menu() {
    let h = Harness::new().await;

    let r = h.text(ALI, "Hello").await;
    assert_eq!(r.contact.stage, Stage::CollectingName);
    assert!(last_text(&h.gateway).contains("Full Name"));

    let r = h.text(ALI, "Ali Khan").await;
    assert_eq!(r.contact.stage, Stage::CollectingCity);
    assert!(last_text(&h.gateway).contains("Dr. Ali Khan"));

    let r = h.text(ALI, "Lahore").await;
    assert_eq!(r.contact.stage, Stage::CollectingSpecialty);

    let r = h.text(ALI, "Cardiologist").await;
    assert_eq!(r.contact.stage, Stage::Menu);
    assert!(r.contact.profile.is_complete());
    assert_eq!(r.deferred, 1);
    let confirmation = last_text(&h.gateway);
    assert!(confirmation.contains("Lahore"));
    assert!(confirmation.contains("Cardiologist"));

    // The menu follows after the presentation delay.
    assert!(!matches!(h.gateway.sent().last(), Some(OutboundCommand::SendList { .. })));
    h.settle().await;
    assert!(matches!(h.gateway.sent().last(), Some(OutboundCommand::SendList { .. })));
}

#[tokio::test]
async fn referral_track_issues_a_stable_code() {
    let h = Harness::new().await;
    h.onboard(ALI).await;

    let r = h.list(ALI, Track::Referral.id()).await;
    assert_eq!(r.contact.stage, Stage::InTrack(Track::Referral));
    assert_eq!(r.contact.selected_track, Some(Track::Referral));

    let r = h.button(ALI, buttons::YES_REFERRAL).await;
    let code = r.contact.referral.code.clone().unwrap();
    assert!(code.starts_with("DRALIK"), "unexpected code {code}");
    assert_eq!(code.len(), 10);
    assert_eq!(
        r.contact.referral.link.as_deref(),
        Some(format!("https://angill.pk/join?ref={code}").as_str())
    );
    assert!(r.contact.engagement.referral_link_issued);
    assert!(last_text(&h.gateway).contains(&code));

    let again = h.button(ALI, buttons::YES_REFERRAL).await;
    assert_eq!(again.contact.referral.code.as_deref(), Some(code.as_str()));
    assert!(h.kinds(ALI).await.contains(&InteractionKind::ReferralIssued));
}

#[tokio::test]
async fn cyber_clinic_sends_brochure_then_prompt() {
    let h = Harness::new().await;
    h.onboard(ALI).await;
    h.gateway.clear();

    let r = h.list(ALI, Track::CyberClinic.id()).await;
    assert!(r.contact.engagement.document_downloaded);
    assert_eq!(r.sent_now, 1);
    assert_eq!(r.deferred, 2);

    h.settle().await;
    let sent = h.gateway.sent();
    assert!(matches!(sent[1], OutboundCommand::SendDocument { .. }));
    assert!(matches!(sent[2], OutboundCommand::SendButtons { .. }));
    assert!(h.kinds(ALI).await.contains(&InteractionKind::DocumentSent));
}

#[tokio::test]
async fn booking_a_call_makes_a_warm_lead() {
    let h = Harness::new().await;
    h.onboard(ALI).await;
    h.list(ALI, Track::SmartCalendar.id()).await;

    let r = h.button(ALI, buttons::YES_DEMO).await;
    assert!(r.contact.engagement.call_booked);
    assert_eq!(r.contact.lifecycle.status, ContactStatus::WarmLead);
    assert!(h.kinds(ALI).await.contains(&InteractionKind::CallScheduled));

    // Booking alone does not exempt from the drip.
    h.clock.advance(Duration::hours(24));
    assert_eq!(h.drip.tick().await.unwrap().sent, 1);
}

#[tokio::test]
async fn menu_keyword_returns_from_track() {
    let h = Harness::new().await;
    h.onboard(ALI).await;
    h.list(ALI, Track::OnlineDoctor.id()).await;

    let r = h.text(ALI, "menu").await;
    assert_eq!(r.contact.stage, Stage::Menu);
    assert_eq!(r.contact.selected_track, Some(Track::OnlineDoctor));
    assert!(matches!(h.gateway.sent().last(), Some(OutboundCommand::SendList { .. })));
}

#[tokio::test]
async fn opt_out_keeps_stage_and_stops_drip() {
    let h = Harness::new().await;
    h.onboard(ALI).await;
    h.list(ALI, Track::Referral.id()).await;

    let r = h.text(ALI, "  Unsubscribe ").await;
    assert_eq!(r.contact.stage, Stage::InTrack(Track::Referral));
    assert_eq!(r.contact.lifecycle.status, ContactStatus::OptedOut);
    assert!(r.contact.lifecycle.next_follow_up_at.is_none());

    h.clock.advance(Duration::days(10));
    assert_eq!(h.drip.tick().await.unwrap().sent, 0);
}

#[tokio::test]
async fn drip_runs_four_times_then_gives_up() {
    let h = Harness::new().await;
    h.text(ALI, "Hi").await;
    h.gateway.clear();

    h.clock.advance(Duration::hours(24));
    assert_eq!(h.drip.tick().await.unwrap().sent, 1);

    for expected in 2..=4u32 {
        // Not due yet a day later.
        h.clock.advance(Duration::days(1));
        assert_eq!(h.drip.tick().await.unwrap().sent, 0);

        h.clock.advance(Duration::days(1));
        assert_eq!(h.drip.tick().await.unwrap().sent, 1);
        let c = h.store.get_contact(ALI).await.unwrap().unwrap();
        assert_eq!(c.lifecycle.follow_up_count, expected);
    }

    let c = h.store.get_contact(ALI).await.unwrap().unwrap();
    assert_eq!(c.lifecycle.status, ContactStatus::NonResponsive);
    assert!(c.lifecycle.next_follow_up_at.is_none());

    h.clock.advance(Duration::days(30));
    assert_eq!(h.drip.tick().await.unwrap().sent, 0);

    let history = h.store.list_follow_ups(ALI).await.unwrap();
    let numbers: Vec<u32> = history.iter().map(|r| r.number).collect();
    assert_eq!(numbers, vec![1, 2, 3, 4]);
    assert_eq!(h.gateway.sent().len(), 4);
}

#[tokio::test]
async fn registered_and_booked_contacts_are_exempt() {
    let h = Harness::new().await;
    h.onboard(ALI).await;
    h.list(ALI, Track::SmartCalendar.id()).await;
    h.button(ALI, buttons::YES_DEMO).await;

    let c = h.engine.mark_registered(ALI).await.unwrap();
    assert_eq!(c.lifecycle.status, ContactStatus::Converted);

    h.clock.advance(Duration::days(3));
    assert_eq!(h.drip.tick().await.unwrap().sent, 0);
    assert!(h.kinds(ALI).await.contains(&InteractionKind::RegistrationCompleted));
}

#[tokio::test]
async fn concurrent_first_messages_create_one_contact() {
    let h = Arc::new(Harness::new().await);

    // The same first message delivered ten times at once.
    let tasks: Vec<_> = (0..10)
        .map(|_| {
            let h = Arc::clone(&h);
            tokio::spawn(async move { h.deliver(ALI, "wamid.first", "Hi").await })
        })
        .collect();
    let mut duplicates = 0;
    for task in tasks {
        if task.await.unwrap().duplicate {
            duplicates += 1;
        }
    }
    assert_eq!(duplicates, 9);

    let recent = h.store.recent_contacts(50).await.unwrap();
    assert_eq!(recent.len(), 1);
    assert_eq!(recent[0].stage, Stage::CollectingName);
    assert_eq!(recent[0].profile.name, None);

    let received = h
        .kinds(ALI)
        .await
        .into_iter()
        .filter(|k| *k == InteractionKind::MessageReceived)
        .count();
    assert_eq!(received, 1);
    assert_eq!(h.gateway.sent_to(ALI).len(), 1);
}

#[tokio::test]
async fn redelivery_never_shifts_the_profile() {
    let h = Harness::new().await;

    for id in ["wamid.1", "wamid.1"] {
        h.deliver(ALI, id, "Hi").await;
    }
    for id in ["wamid.2", "wamid.2"] {
        h.deliver(ALI, id, "Dr. Ali Khan").await;
    }
    for id in ["wamid.3", "wamid.3"] {
        h.deliver(ALI, id, "Lahore").await;
    }
    let r = h.deliver(ALI, "wamid.4", "Cardiologist").await;
    assert!(!r.duplicate);
    assert_eq!(r.contact.stage, Stage::Menu);
    assert_eq!(r.contact.profile.name.as_deref(), Some("Dr. Ali Khan"));
    assert_eq!(r.contact.profile.city.as_deref(), Some("Lahore"));
    assert_eq!(r.contact.profile.specialty.as_deref(), Some("Cardiologist"));

    let again = h.deliver(ALI, "wamid.4", "Cardiologist").await;
    assert!(again.duplicate);
    assert_eq!(again.contact.version, r.contact.version);
}

#[tokio::test]
async fn failed_sends_do_not_block_the_stage_machine() {
    let h = Harness::new().await;
    h.gateway.set_failing(true);

    let r = h.text(ALI, "Hi").await;
    assert_eq!(r.send_failures, 1);
    let r = h.text(ALI, "Ali Khan").await;
    assert_eq!(r.contact.stage, Stage::CollectingCity);
    assert_eq!(r.contact.profile.name.as_deref(), Some("Ali Khan"));
}
