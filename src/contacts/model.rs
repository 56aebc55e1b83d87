//! Contact record, one row per channel address.

use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::stage::{Stage, Track};

/// Delay between signup and the first drip follow-up.
pub const FIRST_FOLLOW_UP_DELAY_HOURS: i64 = 24;

/// Lead source recorded on every new contact.
pub const DEFAULT_SOURCE: &str = "whatsapp_leaflet";

/// Lifecycle status. Deactivation is a status, never a delete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContactStatus {
    Active,
    WarmLead,
    Converted,
    NonResponsive,
    OptedOut,
}

impl ContactStatus {
    pub const ALL: [ContactStatus; 5] = [
        ContactStatus::Active,
        ContactStatus::WarmLead,
        ContactStatus::Converted,
        ContactStatus::NonResponsive,
        ContactStatus::OptedOut,
    ];

    /// Statuses the drip scheduler may pick up.
    pub fn accepts_follow_ups(&self) -> bool {
        matches!(self, Self::Active | Self::WarmLead)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::WarmLead => "warm_lead",
            Self::Converted => "converted",
            Self::NonResponsive => "non_responsive",
            Self::OptedOut => "opted_out",
        }
    }
}

impl Default for ContactStatus {
    fn default() -> Self {
        Self::Active
    }
}

impl std::fmt::Display for ContactStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContactStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown contact status: {s}"))
    }
}

/// Profile fields, filled progressively during collection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub name: Option<String>,
    pub city: Option<String>,
    pub specialty: Option<String>,
}

impl Profile {
    pub fn is_complete(&self) -> bool {
        self.name.is_some() && self.city.is_some() && self.specialty.is_some()
    }

    /// Name for salutations; empty when not collected yet.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngagementFlags {
    pub video_watched: bool,
    pub document_downloaded: bool,
    pub call_booked: bool,
    pub registered: bool,
    pub referral_link_issued: bool,
}

impl EngagementFlags {
    /// "Engaged" as the funnel counts it.
    pub fn is_engaged(&self) -> bool {
        self.video_watched || self.document_downloaded || self.call_booked
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Referral {
    pub code: Option<String>,
    pub link: Option<String>,
    pub referred_by: Option<String>,
    pub earnings: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lifecycle {
    pub status: ContactStatus,
    pub last_interaction_at: DateTime<Utc>,
    /// 0..=4, never decreases.
    pub follow_up_count: u32,
    /// `None` iff no further automated re-engagement is scheduled.
    pub next_follow_up_at: Option<DateTime<Utc>>,
}

impl Lifecycle {
    /// Move an `active` contact to `warm_lead`. Terminal statuses are left alone.
    pub fn mark_warm_lead(&mut self) {
        if self.status == ContactStatus::Active {
            self.status = ContactStatus::WarmLead;
        }
    }

    /// Stop all automated re-engagement.
    pub fn opt_out(&mut self) {
        self.status = ContactStatus::OptedOut;
        self.next_follow_up_at = None;
    }

    /// Registration completed: converted, drip stops.
    pub fn mark_converted(&mut self) {
        if self.status != ContactStatus::OptedOut {
            self.status = ContactStatus::Converted;
        }
        self.next_follow_up_at = None;
    }
}

/// A contact in the funnel, keyed by phone number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    pub address: String,
    pub stage: Stage,
    pub profile: Profile,
    pub selected_track: Option<Track>,
    pub engagement: EngagementFlags,
    pub referral: Referral,
    pub lifecycle: Lifecycle,
    pub source: String,
    /// Optimistic concurrency token, bumped by the store on every update.
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Contact {
    /// A fresh contact as created on the first inbound event from `address`.
    pub fn new(address: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            address: address.into(),
            stage: Stage::Initial,
            profile: Profile::default(),
            selected_track: None,
            engagement: EngagementFlags::default(),
            referral: Referral::default(),
            lifecycle: Lifecycle {
                status: ContactStatus::Active,
                last_interaction_at: now,
                follow_up_count: 0,
                next_follow_up_at: Some(now + Duration::hours(FIRST_FOLLOW_UP_DELAY_HOURS)),
            },
            source: DEFAULT_SOURCE.to_string(),
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Converted: registered on the platform, or explicitly marked converted.
    pub fn is_converted(&self) -> bool {
        self.engagement.registered || self.lifecycle.status == ContactStatus::Converted
    }
}
