//! Conversation stage machine.
//!
//! `transition` is pure: given a contact snapshot, one inbound event and the
//! current time, it returns the updated contact plus the commands and facts
//! the dispatch loop should execute. It performs no I/O. The only work it
//! cannot finish on its own is reserving a fresh referral code, which it
//! signals through [`Transition::referral_requested`].

use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;

use super::command::{InteractionFact, InteractionKind, OutboundCommand, ScheduledCommand};
use super::content::{ContentCatalog, Document, buttons};
use super::event::{EventPayload, InboundEvent};
use crate::contacts::{Contact, Stage, Track};

static OPT_OUT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*(stop|unsubscribe)\s*$").expect("valid opt-out pattern")
});

/// Whole-message opt-out keyword.
pub fn is_opt_out(text: &str) -> bool {
    OPT_OUT.is_match(text)
}

/// "menu" anywhere in the text, or exactly "back".
pub fn is_menu_keyword(text: &str) -> bool {
    let lower = text.trim().to_lowercase();
    lower.contains("menu") || lower == "back"
}

/// Inputs that are not part of the contact or the event.
#[derive(Debug, Clone, Copy)]
pub struct TransitionContext<'a> {
    pub now: DateTime<Utc>,
    pub catalog: &'a ContentCatalog,
}

/// What a button press means inside a track.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ButtonAction {
    BookCall,
    Decline,
    SendDocument(Document),
    IssueReferral,
}

/// Fixed per-track button mapping. `None` for ids the track does not offer.
pub fn button_action(track: Track, id: &str) -> Option<ButtonAction> {
    use buttons::*;
    let action = match (track, id) {
        (Track::OnlineDoctor, YES_CALL) => ButtonAction::BookCall,
        (Track::OnlineDoctor, NO_CALL) => ButtonAction::Decline,
        (Track::CyberClinic, SCHEDULE_CALL) => ButtonAction::BookCall,
        (Track::CyberClinic, ROI_CALC) => ButtonAction::SendDocument(Document::RoiCalculation),
        (Track::CyberClinic, COST_PLAN) => ButtonAction::SendDocument(Document::CostPlan),
        (Track::Referral, YES_REFERRAL) => ButtonAction::IssueReferral,
        (Track::Referral, NO_REFERRAL) => ButtonAction::Decline,
        (Track::SmartCalendar, YES_DEMO) => ButtonAction::BookCall,
        (Track::SmartCalendar, NO_DEMO) => ButtonAction::Decline,
        _ => return None,
    };
    Some(action)
}

/// Result of applying one inbound event.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    /// The contact after the event. Persist this.
    pub contact: Contact,
    pub commands: Vec<ScheduledCommand>,
    pub facts: Vec<InteractionFact>,
    /// A new referral code must be reserved, then passed to
    /// [`Transition::complete_referral`].
    pub referral_requested: bool,
}

impl Transition {
    fn new(contact: Contact) -> Self {
        Self {
            contact,
            commands: Vec::new(),
            facts: Vec::new(),
            referral_requested: false,
        }
    }

    pub fn next_stage(&self) -> Stage {
        self.contact.stage
    }

    fn send_at(&mut self, not_before: DateTime<Utc>, command: OutboundCommand) {
        self.commands.push(ScheduledCommand {
            not_before,
            command,
        });
    }

    fn text_at(&mut self, not_before: DateTime<Utc>, body: String) {
        let to = self.contact.address.clone();
        self.send_at(not_before, OutboundCommand::text(&to, body));
    }

    fn fact(&mut self, kind: InteractionKind, at: DateTime<Utc>, details: serde_json::Value) {
        let fact = InteractionFact::new(&self.contact.address, kind, at, details);
        self.facts.push(fact);
    }

    /// Move to `target` if the stage graph allows it.
    fn advance(&mut self, target: Stage) {
        let current = self.contact.stage;
        if current == target {
            return;
        }
        if current.can_transition_to(target) {
            self.contact.stage = target;
        } else {
            tracing::warn!(
                address = %self.contact.address,
                from = %current,
                to = %target,
                "Ignoring illegal stage move"
            );
        }
    }

    /// Bind a reserved (or existing) referral code and announce it.
    pub fn complete_referral(
        &mut self,
        catalog: &ContentCatalog,
        now: DateTime<Utc>,
        code: &str,
        link: &str,
    ) {
        self.referral_requested = false;
        self.contact.referral.code = Some(code.to_string());
        self.contact.referral.link = Some(link.to_string());
        self.contact.engagement.referral_link_issued = true;

        let body = catalog.referral_issued(self.contact.profile.display_name(), code, link);
        self.text_at(now, body);
        self.fact(
            InteractionKind::ReferralIssued,
            now,
            serde_json::json!({ "code": code, "link": link }),
        );
    }
}

/// Interpret `event` against `contact`'s current stage.
pub fn transition(contact: &Contact, event: &InboundEvent, ctx: &TransitionContext<'_>) -> Transition {
    let now = ctx.now;
    let mut t = Transition::new(contact.clone());
    t.contact.lifecycle.last_interaction_at = now;
    t.contact.updated_at = now;

    let stage = contact.stage;
    let (kind, details) = match &event.payload {
        EventPayload::FreeText(text) => (
            InteractionKind::MessageReceived,
            serde_json::json!({ "message_id": event.message_id, "text": text, "stage": stage }),
        ),
        EventPayload::Button(id) | EventPayload::ListSelection(id) => (
            InteractionKind::OptionSelected,
            serde_json::json!({
                "message_id": event.message_id,
                "option": id,
                "via": event.payload.kind(),
                "stage": stage,
            }),
        ),
    };
    t.fact(kind, now, details);

    let opting_out = match &event.payload {
        EventPayload::FreeText(text) => is_opt_out(text),
        EventPayload::Button(id) => id == buttons::OPT_OUT,
        EventPayload::ListSelection(_) => false,
    };
    if opting_out {
        t.contact.lifecycle.opt_out();
        t.text_at(now, ctx.catalog.opt_out_ack());
        return t;
    }

    match stage {
        Stage::Initial => {
            t.text_at(now, ctx.catalog.welcome());
            t.advance(Stage::CollectingName);
        }
        Stage::CollectingName | Stage::CollectingCity | Stage::CollectingSpecialty => {
            collect_profile(&mut t, stage, &event.payload, ctx);
        }
        Stage::Menu => match &event.payload {
            EventPayload::ListSelection(id) => match Track::from_id(id) {
                Some(track) => enter_track(&mut t, track, ctx),
                None => t.text_at(now, ctx.catalog.menu_nudge()),
            },
            EventPayload::FreeText(text) if is_menu_keyword(text) => {
                let menu = ctx.catalog.menu(&t.contact.address);
                t.send_at(now, menu);
            }
            EventPayload::FreeText(_) => t.text_at(now, ctx.catalog.menu_nudge()),
            // A button from the last track's prompt can still be tapped here.
            EventPayload::Button(id) => match contact.selected_track {
                Some(track) => press_button(&mut t, track, id, ctx),
                None => t.text_at(now, ctx.catalog.general_help()),
            },
        },
        Stage::InTrack(track) => match &event.payload {
            EventPayload::Button(id) => press_button(&mut t, track, id, ctx),
            EventPayload::ListSelection(id) => match Track::from_id(id) {
                Some(other) => enter_track(&mut t, other, ctx),
                None => t.text_at(now, ctx.catalog.menu_nudge()),
            },
            EventPayload::FreeText(text) if is_menu_keyword(text) => {
                t.advance(Stage::Menu);
                let menu = ctx.catalog.menu(&t.contact.address);
                t.send_at(now, menu);
            }
            EventPayload::FreeText(_) => t.text_at(now, ctx.catalog.general_help()),
        },
    }

    t
}

fn collect_profile(t: &mut Transition, stage: Stage, payload: &EventPayload, ctx: &TransitionContext<'_>) {
    let now = ctx.now;
    let answer = match payload {
        EventPayload::FreeText(text) if !text.trim().is_empty() => text.trim().to_string(),
        // Clicks and blanks do not answer the question; ask again.
        _ => {
            let profile = &t.contact.profile;
            let prompt = match stage {
                Stage::CollectingName => ctx.catalog.welcome(),
                Stage::CollectingCity => ctx.catalog.city_prompt(profile.display_name()),
                _ => ctx
                    .catalog
                    .specialty_prompt(profile.city.as_deref().unwrap_or("")),
            };
            t.text_at(now, prompt);
            return;
        }
    };

    match stage {
        Stage::CollectingName => {
            let prompt = ctx.catalog.city_prompt(&answer);
            t.contact.profile.name = Some(answer);
            t.text_at(now, prompt);
            t.advance(Stage::CollectingCity);
        }
        Stage::CollectingCity => {
            let prompt = ctx.catalog.specialty_prompt(&answer);
            t.contact.profile.city = Some(answer);
            t.text_at(now, prompt);
            t.advance(Stage::CollectingSpecialty);
        }
        _ => {
            t.contact.profile.specialty = Some(answer);
            let confirmation = ctx.catalog.profile_confirmation(&t.contact.profile);
            t.text_at(now, confirmation);
            let menu = ctx.catalog.menu(&t.contact.address);
            t.send_at(now + ctx.catalog.presentation_delay(), menu);
            t.advance(Stage::Menu);
        }
    }
}

fn enter_track(t: &mut Transition, track: Track, ctx: &TransitionContext<'_>) {
    let now = ctx.now;
    let delay = ctx.catalog.presentation_delay();
    let to = t.contact.address.clone();

    t.advance(Stage::InTrack(track));
    t.contact.selected_track = Some(track);

    let intro = ctx.catalog.track_intro(track, t.contact.profile.display_name());
    t.text_at(now, intro);

    let prompt_at = if track == Track::CyberClinic {
        let brochure = Document::CyberClinicBrochure;
        t.send_at(now + delay, ctx.catalog.document(&to, brochure));
        t.contact.engagement.document_downloaded = true;
        t.fact(
            InteractionKind::DocumentSent,
            now,
            serde_json::json!({ "document": brochure.filename() }),
        );
        now + delay * 2
    } else {
        now + delay
    };
    t.send_at(prompt_at, ctx.catalog.track_prompt(&to, track));
}

fn press_button(t: &mut Transition, track: Track, id: &str, ctx: &TransitionContext<'_>) {
    let now = ctx.now;
    let Some(action) = button_action(track, id) else {
        t.text_at(now, ctx.catalog.general_help());
        return;
    };

    match action {
        ButtonAction::BookCall => {
            let body = ctx.catalog.book_call(t.contact.profile.display_name());
            t.text_at(now, body);
            t.contact.engagement.call_booked = true;
            t.contact.lifecycle.mark_warm_lead();
            t.fact(
                InteractionKind::CallScheduled,
                now,
                serde_json::json!({ "track": track.id() }),
            );
        }
        ButtonAction::Decline => {
            t.contact.lifecycle.mark_warm_lead();
            t.text_at(now, ctx.catalog.decline_ack(track));
        }
        ButtonAction::SendDocument(doc) => {
            let to = t.contact.address.clone();
            t.send_at(now, ctx.catalog.document(&to, doc));
            t.contact.engagement.document_downloaded = true;
            t.fact(
                InteractionKind::DocumentSent,
                now,
                serde_json::json!({ "document": doc.filename() }),
            );
        }
        ButtonAction::IssueReferral => {
            let existing = t
                .contact
                .referral
                .code
                .clone()
                .zip(t.contact.referral.link.clone());
            match existing {
                Some((code, link)) => t.complete_referral(ctx.catalog, now, &code, &link),
                None => t.referral_requested = true,
            }
        }
    }
}
