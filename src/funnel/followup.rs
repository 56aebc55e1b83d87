//! Drip follow-up planning.
//!
//! Contacts that go quiet get up to four re-engagement messages: the first
//! one a day after signup (scheduled when the contact is created), then one
//! every two days. After the fourth, the contact is `non_responsive` and
//! nothing more is scheduled.
//!
//! This module only decides. Sending and persisting happen in
//! `dispatch::drip`.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::command::{InteractionFact, InteractionKind, OutboundCommand};
use super::content::ContentCatalog;
use crate::contacts::{Contact, ContactStatus};

/// Hard cap on automated follow-ups per contact.
pub const MAX_FOLLOW_UPS: u32 = 4;

/// Gap between consecutive follow-ups after the first.
pub const FOLLOW_UP_INTERVAL_DAYS: i64 = 2;

/// Which message a follow-up carries, chosen by its ordinal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FollowUpKind {
    Reminder,
    SuccessStory,
    BenefitsRecap,
    FinalNotice,
}

impl FollowUpKind {
    /// Kind for the `number`-th follow-up (1-based).
    pub fn for_number(number: u32) -> Option<Self> {
        match number {
            1 => Some(Self::Reminder),
            2 => Some(Self::SuccessStory),
            3 => Some(Self::BenefitsRecap),
            4 => Some(Self::FinalNotice),
            _ => None,
        }
    }

    /// Nominal day since signup this message targets (1, 3, 5, 7).
    pub fn day(&self) -> u32 {
        match self {
            Self::Reminder => 1,
            Self::SuccessStory => 3,
            Self::BenefitsRecap => 5,
            Self::FinalNotice => 7,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Reminder => "reminder",
            Self::SuccessStory => "success_story",
            Self::BenefitsRecap => "benefits_recap",
            Self::FinalNotice => "final_notice",
        }
    }
}

impl std::fmt::Display for FollowUpKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Registered *and* booked a call. Either one alone keeps the drip going.
pub fn is_exempt(contact: &Contact) -> bool {
    contact.engagement.registered && contact.engagement.call_booked
}

/// Eligible for a follow-up, ignoring when it is due.
pub fn is_eligible(contact: &Contact) -> bool {
    contact.lifecycle.status.accepts_follow_ups()
        && contact.lifecycle.follow_up_count < MAX_FOLLOW_UPS
        && !is_exempt(contact)
}

/// Eligible and due at `now`.
pub fn is_due(contact: &Contact, now: DateTime<Utc>) -> bool {
    is_eligible(contact)
        && contact
            .lifecycle
            .next_follow_up_at
            .is_some_and(|due| due <= now)
}

/// One planned follow-up and the contact state it leads to once sent.
#[derive(Debug, Clone, PartialEq)]
pub struct FollowUpStep {
    pub address: String,
    pub number: u32,
    pub kind: FollowUpKind,
    pub command: OutboundCommand,
    pub follow_up_count: u32,
    pub next_follow_up_at: Option<DateTime<Utc>>,
    pub status: ContactStatus,
}

impl FollowUpStep {
    /// Write the post-send lifecycle into `contact`.
    pub fn apply(&self, contact: &mut Contact) {
        contact.lifecycle.follow_up_count = self.follow_up_count;
        contact.lifecycle.next_follow_up_at = self.next_follow_up_at;
        contact.lifecycle.status = self.status;
    }

    /// The `message_sent` fact for this follow-up.
    pub fn fact(&self, at: DateTime<Utc>) -> InteractionFact {
        InteractionFact::new(
            &self.address,
            InteractionKind::MessageSent,
            at,
            serde_json::json!({
                "follow_up": self.number,
                "kind": self.kind.as_str(),
                "day": self.kind.day(),
            }),
        )
    }
}

/// Plan the next follow-up for `contact`, or `None` if it is not eligible.
///
/// Does not check the due time; callers pick contacts with [`is_due`] unless
/// they are forcing a step.
pub fn plan_step(contact: &Contact, now: DateTime<Utc>, catalog: &ContentCatalog) -> Option<FollowUpStep> {
    if !is_eligible(contact) {
        return None;
    }

    let number = contact.lifecycle.follow_up_count + 1;
    let kind = FollowUpKind::for_number(number)?;
    let body = catalog.follow_up(kind, contact.profile.display_name());

    let (next_follow_up_at, status) = if number >= MAX_FOLLOW_UPS {
        (None, ContactStatus::NonResponsive)
    } else {
        (
            Some(now + Duration::days(FOLLOW_UP_INTERVAL_DAYS)),
            contact.lifecycle.status,
        )
    };

    Some(FollowUpStep {
        address: contact.address.clone(),
        number,
        kind,
        command: OutboundCommand::text(&contact.address, body),
        follow_up_count: number,
        next_follow_up_at,
        status,
    })
}

/// Plan one step for every due contact in `contacts`.
pub fn plan_tick(contacts: &[Contact], now: DateTime<Utc>, catalog: &ContentCatalog) -> Vec<FollowUpStep> {
    contacts
        .iter()
        .filter(|c| is_due(c, now))
        .filter_map(|c| plan_step(c, now, catalog))
        .collect()
}
