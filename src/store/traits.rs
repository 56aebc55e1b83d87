//! `Database` trait: single async interface for all persistence.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::contacts::{Contact, ContactStatus};
use crate::conversations::{ConversationStats, ConversationSummary, MessageSearch, TranscriptMessage};
use crate::error::DatabaseError;
use crate::funnel::command::InteractionFact;

/// One sent follow-up, as recorded in history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FollowUpRecord {
    pub address: String,
    pub number: u32,
    pub kind: String,
    pub sent_at: DateTime<Utc>,
}

/// A `(value, count)` pair from a GROUP BY.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CountRow {
    pub key: String,
    pub count: i64,
}

/// Interactions of one kind on one day (`YYYY-MM-DD`, UTC).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActivityRow {
    pub day: String,
    pub kind: String,
    pub count: i64,
}

/// Raw counts for the five funnel stages.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FunnelCounts {
    pub total: i64,
    pub profile_complete: i64,
    pub track_selected: i64,
    pub engaged: i64,
    pub converted: i64,
}

/// Counters over boolean engagement columns.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EngagementCounts {
    pub video_watched: i64,
    pub document_downloaded: i64,
    pub call_booked: i64,
    pub registered: i64,
    pub referral_link_issued: i64,
}

/// Columns contacts can be grouped by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContactGrouping {
    Status,
    Stage,
    Track,
    City,
    Specialty,
}

impl ContactGrouping {
    pub(crate) fn column(&self) -> &'static str {
        match self {
            Self::Status => "status",
            Self::Stage => "stage",
            Self::Track => "selected_track",
            Self::City => "city",
            Self::Specialty => "specialty",
        }
    }
}

/// Filter for contact search. Text fields match case-insensitively.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContactFilter {
    /// Matched against name, address and city.
    pub query: Option<String>,
    pub status: Option<ContactStatus>,
    pub city: Option<String>,
    pub specialty: Option<String>,
    pub limit: usize,
}

/// Backend-agnostic persistence for contacts and their history.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    // ── Contacts ────────────────────────────────────────────────────

    async fn get_contact(&self, address: &str) -> Result<Option<Contact>, DatabaseError>;

    /// Insert `contact` unless a record for its address exists.
    ///
    /// Returns `true` if this call created the record. A `false` caller must
    /// re-read and continue with the stored record.
    async fn create_contact_if_absent(&self, contact: &Contact) -> Result<bool, DatabaseError>;

    /// Write `contact` if the stored version still equals `contact.version`.
    ///
    /// Returns the stored record with its bumped version, or
    /// [`DatabaseError::Conflict`] if someone else wrote first.
    async fn update_contact(&self, contact: &Contact) -> Result<Contact, DatabaseError>;

    /// Bind a referral code to a contact that has none yet.
    ///
    /// `Ok(false)` if the contact already holds a code; a code taken by another
    /// contact yields [`DatabaseError::Constraint`]. Does not bump the version.
    async fn reserve_referral_code(
        &self,
        address: &str,
        code: &str,
        link: &str,
    ) -> Result<bool, DatabaseError>;

    /// Contacts whose next follow-up is due at `now`, oldest due first.
    async fn list_due_follow_ups(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Contact>, DatabaseError>;

    // ── History ─────────────────────────────────────────────────────

    async fn record_follow_up(&self, record: &FollowUpRecord) -> Result<(), DatabaseError>;

    async fn list_follow_ups(&self, address: &str) -> Result<Vec<FollowUpRecord>, DatabaseError>;

    /// Append an immutable interaction fact.
    async fn append_interaction(&self, fact: &InteractionFact) -> Result<(), DatabaseError>;

    /// Most recent interactions for a contact, newest first.
    async fn list_interactions(
        &self,
        address: &str,
        limit: usize,
    ) -> Result<Vec<InteractionFact>, DatabaseError>;

    // ── Conversation transcript ─────────────────────────────────────

    /// Whether an incoming message with this provider id is already stored.
    async fn has_inbound_message(&self, address: &str, message_id: &str) -> Result<bool, DatabaseError>;

    /// Append a transcript line.
    ///
    /// Returns `false` if an incoming message with the same provider id was
    /// already stored for the contact.
    async fn record_message(&self, message: &TranscriptMessage) -> Result<bool, DatabaseError>;

    /// The latest `limit` messages of a contact, oldest first.
    async fn list_messages(&self, address: &str, limit: usize) -> Result<Vec<TranscriptMessage>, DatabaseError>;

    async fn get_conversation(&self, address: &str) -> Result<Option<ConversationSummary>, DatabaseError>;

    /// Conversations by latest message, newest first. `search` matches the
    /// contact's name or address.
    async fn list_conversations(
        &self,
        search: Option<&str>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<ConversationSummary>, DatabaseError>;

    async fn count_conversations(&self, search: Option<&str>) -> Result<i64, DatabaseError>;

    /// Conversations containing a matching message, newest first.
    async fn search_conversations(&self, filter: &MessageSearch) -> Result<Vec<ConversationSummary>, DatabaseError>;

    /// Overview counts; `recent_since` bounds the recent-activity count.
    async fn conversation_stats(&self, recent_since: DateTime<Utc>) -> Result<ConversationStats, DatabaseError>;

    // ── Analytics (read-only) ───────────────────────────────────────

    /// Contact counts grouped by `grouping`, largest first. NULL groups are skipped.
    async fn count_contacts_by(
        &self,
        grouping: ContactGrouping,
        limit: Option<usize>,
    ) -> Result<Vec<CountRow>, DatabaseError>;

    async fn engagement_counts(&self) -> Result<EngagementCounts, DatabaseError>;

    async fn funnel_counts(&self) -> Result<FunnelCounts, DatabaseError>;

    /// Interaction counts per day and kind since `since`.
    async fn daily_activity(&self, since: DateTime<Utc>) -> Result<Vec<ActivityRow>, DatabaseError>;

    /// Most recently created contacts.
    async fn recent_contacts(&self, limit: usize) -> Result<Vec<Contact>, DatabaseError>;

    async fn search_contacts(&self, filter: &ContactFilter) -> Result<Vec<Contact>, DatabaseError>;
}
