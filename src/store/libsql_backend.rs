//! libSQL backend: async `Database` trait implementation.
//!
//! Supports local file and in-memory databases. Timestamps are written as
//! RFC 3339 with millisecond precision and a `Z` suffix so that string
//! comparison in SQL matches chronological order.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};
use uuid::Uuid;

use crate::contacts::{
    Contact, ContactStatus, EngagementFlags, Lifecycle, Profile, Referral, Stage, Track,
};
use crate::conversations::{
    ConversationStats, ConversationSummary, DeliveryStatus, Direction, MessageSearch,
    TranscriptMessage,
};
use crate::error::DatabaseError;
use crate::funnel::command::{InteractionFact, InteractionKind};
use crate::funnel::followup::MAX_FOLLOW_UPS;
use crate::store::migrations;
use crate::store::traits::{
    ActivityRow, ContactFilter, ContactGrouping, CountRow, Database, EngagementCounts,
    FollowUpRecord, FunnelCounts,
};

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        Ok(backend)
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }

    async fn query_contacts(
        &self,
        op: &str,
        sql: &str,
        params: impl libsql::params::IntoParams,
    ) -> Result<Vec<Contact>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, params)
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;

        let mut contacts = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?
        {
            match row_to_contact(&row) {
                Ok(contact) => contacts.push(contact),
                Err(e) => tracing::warn!("Skipping contact row: {e}"),
            }
        }
        Ok(contacts)
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Canonical write format for timestamps.
fn fmt_ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: &Option<String>) -> Option<DateTime<Utc>> {
    s.as_ref().map(|s| parse_datetime(s))
}

fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

fn opt_ts(dt: Option<&DateTime<Utc>>) -> libsql::Value {
    opt_text(dt.map(fmt_ts).as_deref())
}

/// SQLite reads a negative LIMIT as "no limit"; saturate instead of wrapping.
fn sql_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

/// `%text%` for LIKE, or `None` for a blank filter.
fn like_pattern(text: Option<&str>) -> Option<String> {
    text.map(str::trim)
        .filter(|t| !t.is_empty())
        .map(|t| format!("%{t}%"))
}

/// Map unique-index violations to `Constraint`, everything else to `Query`.
fn write_error(op: &str, e: libsql::Error) -> DatabaseError {
    let msg = e.to_string();
    if msg.contains("UNIQUE constraint failed") {
        DatabaseError::Constraint(format!("{op}: {msg}"))
    } else {
        DatabaseError::Query(format!("{op}: {msg}"))
    }
}

const CONTACT_COLUMNS: &str = "address, stage, name, city, specialty, selected_track, \
     video_watched, document_downloaded, call_booked, registered, referral_link_issued, \
     referral_code, referral_link, referred_by, referral_earnings, \
     status, last_interaction_at, follow_up_count, next_follow_up_at, \
     source, version, created_at, updated_at";

/// Map a libsql Row to a Contact. Column order matches CONTACT_COLUMNS.
fn row_to_contact(row: &libsql::Row) -> Result<Contact, DatabaseError> {
    let col = |e: libsql::Error| DatabaseError::Serialization(format!("contact row: {e}"));
    let flag = |i: i32| -> Result<bool, DatabaseError> { Ok(row.get::<i64>(i).map_err(col)? != 0) };

    let address: String = row.get(0).map_err(col)?;
    let stage_str: String = row.get(1).map_err(col)?;
    let stage: Stage = stage_str
        .parse()
        .map_err(|e| DatabaseError::Serialization(format!("contact {address}: {e}")))?;
    let selected_track = row
        .get::<String>(5)
        .ok()
        .and_then(|id| Track::from_id(&id));
    let status_str: String = row.get(15).map_err(col)?;
    let status: ContactStatus = status_str
        .parse()
        .map_err(|e| DatabaseError::Serialization(format!("contact {address}: {e}")))?;
    let last_interaction: String = row.get(16).map_err(col)?;
    let next_follow_up: Option<String> = row.get(18).ok();
    let created: String = row.get(21).map_err(col)?;
    let updated: String = row.get(22).map_err(col)?;

    Ok(Contact {
        stage,
        profile: Profile {
            name: row.get(2).ok(),
            city: row.get(3).ok(),
            specialty: row.get(4).ok(),
        },
        selected_track,
        engagement: EngagementFlags {
            video_watched: flag(6)?,
            document_downloaded: flag(7)?,
            call_booked: flag(8)?,
            registered: flag(9)?,
            referral_link_issued: flag(10)?,
        },
        referral: Referral {
            code: row.get(11).ok(),
            link: row.get(12).ok(),
            referred_by: row.get(13).ok(),
            earnings: row.get(14).map_err(col)?,
        },
        lifecycle: Lifecycle {
            status,
            last_interaction_at: parse_datetime(&last_interaction),
            follow_up_count: row.get::<i64>(17).map_err(col)?.clamp(0, i64::from(MAX_FOLLOW_UPS)) as u32,
            next_follow_up_at: parse_optional_datetime(&next_follow_up),
        },
        source: row.get(19).map_err(col)?,
        version: row.get(20).map_err(col)?,
        created_at: parse_datetime(&created),
        updated_at: parse_datetime(&updated),
        address,
    })
}

fn row_to_interaction(row: &libsql::Row) -> Result<InteractionFact, DatabaseError> {
    let col = |e: libsql::Error| DatabaseError::Serialization(format!("interaction row: {e}"));
    let kind_str: String = row.get(1).map_err(col)?;
    let kind = InteractionKind::parse(&kind_str)
        .ok_or_else(|| DatabaseError::Serialization(format!("unknown interaction kind {kind_str}")))?;
    let details_str: String = row.get(2).map_err(col)?;
    let at: String = row.get(3).map_err(col)?;

    Ok(InteractionFact {
        address: row.get(0).map_err(col)?,
        kind,
        at: parse_datetime(&at),
        details: serde_json::from_str(&details_str)
            .map_err(|e| DatabaseError::Serialization(format!("interaction details: {e}")))?,
    })
}

/// Summary columns, grouped per address. Callers append WHERE/GROUP BY.
const SUMMARY_SELECT: &str = "SELECT m.address, c.name, c.city, c.specialty, c.status, c.stage, \
     COUNT(*) AS message_count, MAX(m.created_at) AS last_at \
     FROM messages m LEFT JOIN contacts c ON c.address = m.address";

fn row_to_summary(row: &libsql::Row) -> Result<ConversationSummary, DatabaseError> {
    let col = |e: libsql::Error| DatabaseError::Serialization(format!("conversation row: {e}"));
    let last_at: String = row.get(7).map_err(col)?;
    Ok(ConversationSummary {
        address: row.get(0).map_err(col)?,
        name: row.get(1).ok(),
        city: row.get(2).ok(),
        specialty: row.get(3).ok(),
        status: row.get(4).ok(),
        stage: row.get(5).ok(),
        message_count: row.get(6).map_err(col)?,
        last_message_at: parse_datetime(&last_at),
    })
}

fn row_to_message(row: &libsql::Row) -> Result<TranscriptMessage, DatabaseError> {
    let col = |e: libsql::Error| DatabaseError::Serialization(format!("message row: {e}"));
    let direction: String = row.get(2).map_err(col)?;
    let status: String = row.get(5).map_err(col)?;
    let at: String = row.get(6).map_err(col)?;
    Ok(TranscriptMessage {
        address: row.get(0).map_err(col)?,
        message_id: row.get(1).ok(),
        direction: Direction::parse(&direction)
            .ok_or_else(|| DatabaseError::Serialization(format!("unknown direction {direction}")))?,
        message_type: row.get(3).map_err(col)?,
        content: row.get(4).map_err(col)?,
        status: DeliveryStatus::parse(&status)
            .ok_or_else(|| DatabaseError::Serialization(format!("unknown message status {status}")))?,
        at: parse_datetime(&at),
    })
}

impl LibSqlBackend {
    async fn query_summaries(
        &self,
        op: &str,
        sql: &str,
        params: impl libsql::params::IntoParams,
    ) -> Result<Vec<ConversationSummary>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, params)
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;

        let mut summaries = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?
        {
            match row_to_summary(&row) {
                Ok(summary) => summaries.push(summary),
                Err(e) => tracing::warn!("Skipping conversation row: {e}"),
            }
        }
        Ok(summaries)
    }
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl Database for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    // ── Contacts ────────────────────────────────────────────────────

    async fn get_contact(&self, address: &str) -> Result<Option<Contact>, DatabaseError> {
        let mut contacts = self
            .query_contacts(
                "get_contact",
                &format!("SELECT {CONTACT_COLUMNS} FROM contacts WHERE address = ?1"),
                params![address],
            )
            .await?;
        Ok(contacts.pop())
    }

    async fn create_contact_if_absent(&self, contact: &Contact) -> Result<bool, DatabaseError> {
        let inserted = self
            .conn()
            .execute(
                "INSERT INTO contacts (address, stage, status, last_interaction_at, follow_up_count, \
                 next_follow_up_at, source, version, created_at, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10) \
                 ON CONFLICT(address) DO NOTHING",
                params![
                    contact.address.as_str(),
                    contact.stage.as_str(),
                    contact.lifecycle.status.as_str(),
                    fmt_ts(&contact.lifecycle.last_interaction_at),
                    i64::from(contact.lifecycle.follow_up_count),
                    opt_ts(contact.lifecycle.next_follow_up_at.as_ref()),
                    contact.source.as_str(),
                    contact.version,
                    fmt_ts(&contact.created_at),
                    fmt_ts(&contact.updated_at),
                ],
            )
            .await
            .map_err(|e| write_error("create_contact_if_absent", e))?;

        if inserted > 0 {
            debug!(address = %contact.address, "Contact created");
        }
        Ok(inserted > 0)
    }

    async fn update_contact(&self, contact: &Contact) -> Result<Contact, DatabaseError> {
        let e = &contact.engagement;
        let updated = self
            .conn()
            .execute(
                "UPDATE contacts SET stage = ?2, name = ?3, city = ?4, specialty = ?5, selected_track = ?6, \
                 video_watched = ?7, document_downloaded = ?8, call_booked = ?9, registered = ?10, \
                 referral_link_issued = ?11, \
                 referral_code = COALESCE(referral_code, ?12), referral_link = COALESCE(referral_link, ?13), \
                 referred_by = ?14, referral_earnings = ?15, status = ?16, last_interaction_at = ?17, \
                 follow_up_count = MAX(follow_up_count, ?18), next_follow_up_at = ?19, source = ?20, \
                 updated_at = ?21, version = version + 1 \
                 WHERE address = ?1 AND version = ?22",
                params![
                    contact.address.as_str(),
                    contact.stage.as_str(),
                    opt_text(contact.profile.name.as_deref()),
                    opt_text(contact.profile.city.as_deref()),
                    opt_text(contact.profile.specialty.as_deref()),
                    opt_text(contact.selected_track.map(|t| t.id())),
                    e.video_watched as i64,
                    e.document_downloaded as i64,
                    e.call_booked as i64,
                    e.registered as i64,
                    e.referral_link_issued as i64,
                    opt_text(contact.referral.code.as_deref()),
                    opt_text(contact.referral.link.as_deref()),
                    opt_text(contact.referral.referred_by.as_deref()),
                    contact.referral.earnings,
                    contact.lifecycle.status.as_str(),
                    fmt_ts(&contact.lifecycle.last_interaction_at),
                    i64::from(contact.lifecycle.follow_up_count),
                    opt_ts(contact.lifecycle.next_follow_up_at.as_ref()),
                    contact.source.as_str(),
                    fmt_ts(&contact.updated_at),
                    contact.version,
                ],
            )
            .await
            .map_err(|e| write_error("update_contact", e))?;

        let stored = self.get_contact(&contact.address).await?;
        match (updated, stored) {
            (0, Some(_)) => Err(DatabaseError::Conflict {
                key: contact.address.clone(),
            }),
            (_, None) => Err(DatabaseError::NotFound {
                entity: "contact".into(),
                id: contact.address.clone(),
            }),
            (_, Some(stored)) => {
                debug!(address = %stored.address, version = stored.version, stage = %stored.stage, "Contact updated");
                Ok(stored)
            }
        }
    }

    async fn reserve_referral_code(
        &self,
        address: &str,
        code: &str,
        link: &str,
    ) -> Result<bool, DatabaseError> {
        let updated = self
            .conn()
            .execute(
                "UPDATE contacts SET referral_code = ?2, referral_link = ?3 \
                 WHERE address = ?1 AND referral_code IS NULL",
                params![address, code, link],
            )
            .await
            .map_err(|e| write_error("reserve_referral_code", e))?;
        Ok(updated > 0)
    }

    async fn list_due_follow_ups(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Contact>, DatabaseError> {
        self.query_contacts(
            "list_due_follow_ups",
            &format!(
                "SELECT {CONTACT_COLUMNS} FROM contacts \
                 WHERE status IN ('active', 'warm_lead') \
                 AND next_follow_up_at IS NOT NULL AND next_follow_up_at <= ?1 \
                 AND follow_up_count < {MAX_FOLLOW_UPS} \
                 AND NOT (registered = 1 AND call_booked = 1) \
                 ORDER BY next_follow_up_at ASC, address ASC LIMIT ?2"
            ),
            params![fmt_ts(&now), sql_limit(limit)],
        )
        .await
    }

    // ── History ─────────────────────────────────────────────────────

    async fn record_follow_up(&self, record: &FollowUpRecord) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT OR IGNORE INTO follow_ups (id, address, number, kind, sent_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    Uuid::new_v4().to_string(),
                    record.address.as_str(),
                    i64::from(record.number),
                    record.kind.as_str(),
                    fmt_ts(&record.sent_at),
                ],
            )
            .await
            .map_err(|e| write_error("record_follow_up", e))?;
        Ok(())
    }

    async fn list_follow_ups(&self, address: &str) -> Result<Vec<FollowUpRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT address, number, kind, sent_at FROM follow_ups WHERE address = ?1 ORDER BY number ASC",
                params![address],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_follow_ups: {e}")))?;

        let mut records = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            let sent_at: String = row.get(3).unwrap_or_default();
            records.push(FollowUpRecord {
                address: row.get(0).unwrap_or_default(),
                number: row.get::<i64>(1).unwrap_or(0) as u32,
                kind: row.get(2).unwrap_or_default(),
                sent_at: parse_datetime(&sent_at),
            });
        }
        Ok(records)
    }

    async fn append_interaction(&self, fact: &InteractionFact) -> Result<(), DatabaseError> {
        let details = serde_json::to_string(&fact.details)
            .map_err(|e| DatabaseError::Serialization(format!("interaction details: {e}")))?;
        self.conn()
            .execute(
                "INSERT INTO interactions (id, address, kind, details, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    Uuid::new_v4().to_string(),
                    fact.address.as_str(),
                    fact.kind.as_str(),
                    details,
                    fmt_ts(&fact.at),
                ],
            )
            .await
            .map_err(|e| write_error("append_interaction", e))?;
        Ok(())
    }

    async fn list_interactions(
        &self,
        address: &str,
        limit: usize,
    ) -> Result<Vec<InteractionFact>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT address, kind, details, created_at FROM interactions \
                 WHERE address = ?1 ORDER BY created_at DESC, rowid DESC LIMIT ?2",
                params![address, sql_limit(limit)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_interactions: {e}")))?;

        let mut facts = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_interaction(&row) {
                Ok(fact) => facts.push(fact),
                Err(e) => tracing::warn!("Skipping interaction row: {e}"),
            }
        }
        Ok(facts)
    }

    // ── Conversation transcript ─────────────────────────────────────

    async fn has_inbound_message(&self, address: &str, message_id: &str) -> Result<bool, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT 1 FROM messages WHERE address = ?1 AND message_id = ?2 AND direction = 'incoming' LIMIT 1",
                params![address, message_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("has_inbound_message: {e}")))?;
        let row = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("has_inbound_message: {e}")))?;
        Ok(row.is_some())
    }

    async fn record_message(&self, message: &TranscriptMessage) -> Result<bool, DatabaseError> {
        let inserted = self
            .conn()
            .execute(
                "INSERT OR IGNORE INTO messages \
                 (id, address, message_id, direction, message_type, content, status, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    Uuid::new_v4().to_string(),
                    message.address.as_str(),
                    opt_text(message.message_id.as_deref()),
                    message.direction.as_str(),
                    message.message_type.as_str(),
                    message.content.as_str(),
                    message.status.as_str(),
                    fmt_ts(&message.at),
                ],
            )
            .await
            .map_err(|e| write_error("record_message", e))?;
        Ok(inserted > 0)
    }

    async fn list_messages(&self, address: &str, limit: usize) -> Result<Vec<TranscriptMessage>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT address, message_id, direction, message_type, content, status, created_at FROM ( \
                     SELECT *, rowid AS seq FROM messages WHERE address = ?1 \
                     ORDER BY created_at DESC, seq DESC LIMIT ?2 \
                 ) ORDER BY created_at ASC, seq ASC",
                params![address, sql_limit(limit)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_messages: {e}")))?;

        let mut messages = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_message(&row) {
                Ok(message) => messages.push(message),
                Err(e) => tracing::warn!("Skipping message row: {e}"),
            }
        }
        Ok(messages)
    }

    async fn get_conversation(&self, address: &str) -> Result<Option<ConversationSummary>, DatabaseError> {
        let mut summaries = self
            .query_summaries(
                "get_conversation",
                &format!("{SUMMARY_SELECT} WHERE m.address = ?1 GROUP BY m.address"),
                params![address],
            )
            .await?;
        Ok(summaries.pop())
    }

    async fn list_conversations(
        &self,
        search: Option<&str>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<ConversationSummary>, DatabaseError> {
        self.query_summaries(
            "list_conversations",
            &format!(
                "{SUMMARY_SELECT} \
                 WHERE (?1 IS NULL OR c.name LIKE ?1 COLLATE NOCASE OR m.address LIKE ?1) \
                 GROUP BY m.address ORDER BY last_at DESC, m.address ASC LIMIT ?2 OFFSET ?3"
            ),
            params![
                opt_text(like_pattern(search).as_deref()),
                sql_limit(limit),
                sql_limit(offset),
            ],
        )
        .await
    }

    async fn count_conversations(&self, search: Option<&str>) -> Result<i64, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT COUNT(DISTINCT m.address) FROM messages m \
                 LEFT JOIN contacts c ON c.address = m.address \
                 WHERE (?1 IS NULL OR c.name LIKE ?1 COLLATE NOCASE OR m.address LIKE ?1)",
                params![opt_text(like_pattern(search).as_deref())],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("count_conversations: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(row.get(0).unwrap_or(0)),
            Ok(None) => Ok(0),
            Err(e) => Err(DatabaseError::Query(format!("count_conversations: {e}"))),
        }
    }

    async fn search_conversations(&self, filter: &MessageSearch) -> Result<Vec<ConversationSummary>, DatabaseError> {
        self.query_summaries(
            "search_conversations",
            &format!(
                "{SUMMARY_SELECT} \
                 WHERE m.address IN ( \
                     SELECT address FROM messages WHERE ?1 IS NULL OR content LIKE ?1 COLLATE NOCASE \
                 ) \
                 GROUP BY m.address \
                 HAVING (?2 IS NULL OR last_at >= ?2) AND (?3 IS NULL OR last_at <= ?3) \
                 ORDER BY last_at DESC, m.address ASC LIMIT ?4"
            ),
            params![
                opt_text(like_pattern(filter.text.as_deref()).as_deref()),
                opt_ts(filter.from.as_ref()),
                opt_ts(filter.to.as_ref()),
                sql_limit(filter.limit.max(1)),
            ],
        )
        .await
    }

    async fn conversation_stats(&self, recent_since: DateTime<Utc>) -> Result<ConversationStats, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT COUNT(DISTINCT m.address), \
                 COUNT(DISTINCT CASE WHEN c.status IN ('active', 'warm_lead') THEN m.address END), \
                 COUNT(*), \
                 COUNT(DISTINCT CASE WHEN m.created_at >= ?1 THEN m.address END) \
                 FROM messages m LEFT JOIN contacts c ON c.address = m.address",
                params![fmt_ts(&recent_since)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("conversation_stats: {e}")))?;

        let (total, active, messages, recent_activity) = match rows.next().await {
            Ok(Some(row)) => (
                row.get::<i64>(0).unwrap_or(0),
                row.get::<i64>(1).unwrap_or(0),
                row.get::<i64>(2).unwrap_or(0),
                row.get::<i64>(3).unwrap_or(0),
            ),
            Ok(None) => (0, 0, 0, 0),
            Err(e) => return Err(DatabaseError::Query(format!("conversation_stats: {e}"))),
        };

        let top_active = self
            .query_summaries(
                "conversation_stats",
                &format!(
                    "{SUMMARY_SELECT} GROUP BY m.address \
                     ORDER BY message_count DESC, last_at DESC LIMIT 5"
                ),
                (),
            )
            .await?;

        let average_messages = if total == 0 {
            0.0
        } else {
            (messages as f64 / total as f64 * 10.0).round() / 10.0
        };

        Ok(ConversationStats {
            total,
            active,
            average_messages,
            recent_activity,
            top_active,
        })
    }

    // ── Analytics ───────────────────────────────────────────────────

    async fn count_contacts_by(
        &self,
        grouping: ContactGrouping,
        limit: Option<usize>,
    ) -> Result<Vec<CountRow>, DatabaseError> {
        let column = grouping.column();
        let limit = limit.map(sql_limit).unwrap_or(-1);
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {column}, COUNT(*) AS n FROM contacts \
                     WHERE {column} IS NOT NULL AND {column} != '' \
                     GROUP BY {column} ORDER BY n DESC, {column} ASC LIMIT ?1"
                ),
                params![limit],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("count_contacts_by {column}: {e}")))?;

        let mut counts = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            counts.push(CountRow {
                key: row.get(0).unwrap_or_default(),
                count: row.get(1).unwrap_or(0),
            });
        }
        Ok(counts)
    }

    async fn engagement_counts(&self) -> Result<EngagementCounts, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT COALESCE(SUM(video_watched), 0), COALESCE(SUM(document_downloaded), 0), \
                 COALESCE(SUM(call_booked), 0), COALESCE(SUM(registered), 0), \
                 COALESCE(SUM(referral_link_issued), 0) FROM contacts",
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("engagement_counts: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(EngagementCounts {
                video_watched: row.get(0).unwrap_or(0),
                document_downloaded: row.get(1).unwrap_or(0),
                call_booked: row.get(2).unwrap_or(0),
                registered: row.get(3).unwrap_or(0),
                referral_link_issued: row.get(4).unwrap_or(0),
            }),
            Ok(None) => Ok(EngagementCounts::default()),
            Err(e) => Err(DatabaseError::Query(format!("engagement_counts: {e}"))),
        }
    }

    async fn funnel_counts(&self) -> Result<FunnelCounts, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT COUNT(*), \
                 COALESCE(SUM(CASE WHEN name IS NOT NULL AND city IS NOT NULL AND specialty IS NOT NULL THEN 1 ELSE 0 END), 0), \
                 COALESCE(SUM(CASE WHEN selected_track IS NOT NULL THEN 1 ELSE 0 END), 0), \
                 COALESCE(SUM(CASE WHEN video_watched = 1 OR document_downloaded = 1 OR call_booked = 1 THEN 1 ELSE 0 END), 0), \
                 COALESCE(SUM(CASE WHEN registered = 1 OR status = 'converted' THEN 1 ELSE 0 END), 0) \
                 FROM contacts",
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("funnel_counts: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(FunnelCounts {
                total: row.get(0).unwrap_or(0),
                profile_complete: row.get(1).unwrap_or(0),
                track_selected: row.get(2).unwrap_or(0),
                engaged: row.get(3).unwrap_or(0),
                converted: row.get(4).unwrap_or(0),
            }),
            Ok(None) => Ok(FunnelCounts::default()),
            Err(e) => Err(DatabaseError::Query(format!("funnel_counts: {e}"))),
        }
    }

    async fn daily_activity(&self, since: DateTime<Utc>) -> Result<Vec<ActivityRow>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT substr(created_at, 1, 10) AS day, kind, COUNT(*) FROM interactions \
                 WHERE created_at >= ?1 GROUP BY day, kind ORDER BY day ASC, kind ASC",
                params![fmt_ts(&since)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("daily_activity: {e}")))?;

        let mut activity = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            activity.push(ActivityRow {
                day: row.get(0).unwrap_or_default(),
                kind: row.get(1).unwrap_or_default(),
                count: row.get(2).unwrap_or(0),
            });
        }
        Ok(activity)
    }

    async fn recent_contacts(&self, limit: usize) -> Result<Vec<Contact>, DatabaseError> {
        self.query_contacts(
            "recent_contacts",
            &format!("SELECT {CONTACT_COLUMNS} FROM contacts ORDER BY created_at DESC LIMIT ?1"),
            params![sql_limit(limit)],
        )
        .await
    }

    async fn search_contacts(&self, filter: &ContactFilter) -> Result<Vec<Contact>, DatabaseError> {
        let pattern = like_pattern(filter.query.as_deref());
        let specialty = filter
            .specialty
            .as_deref()
            .map(|s| format!("%{}%", s.trim()));

        self.query_contacts(
            "search_contacts",
            &format!(
                "SELECT {CONTACT_COLUMNS} FROM contacts \
                 WHERE (?1 IS NULL OR name LIKE ?1 COLLATE NOCASE OR address LIKE ?1 OR city LIKE ?1 COLLATE NOCASE) \
                 AND (?2 IS NULL OR status = ?2) \
                 AND (?3 IS NULL OR city = ?3 COLLATE NOCASE) \
                 AND (?4 IS NULL OR specialty LIKE ?4 COLLATE NOCASE) \
                 ORDER BY created_at DESC LIMIT ?5"
            ),
            params![
                opt_text(pattern.as_deref()),
                opt_text(filter.status.map(|s| s.as_str())),
                opt_text(filter.city.as_deref().map(str::trim)),
                opt_text(specialty.as_deref()),
                sql_limit(filter.limit.max(1)),
            ],
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    async fn test_db() -> LibSqlBackend {
        LibSqlBackend::new_memory().await.unwrap()
    }

    fn t0() -> DateTime<Utc> {
        "2026-03-01T10:00:00Z".parse().unwrap()
    }

    // ── Contact tests ───────────────────────────────────────────────

    #[tokio::test]
    async fn create_if_absent_is_first_writer_wins() {
        let db = test_db().await;
        let contact = Contact::new("+920000000001", t0());

        assert!(db.create_contact_if_absent(&contact).await.unwrap());
        assert!(!db.create_contact_if_absent(&contact).await.unwrap());

        let stored = db.get_contact("+920000000001").await.unwrap().unwrap();
        assert_eq!(stored, contact);
    }

    #[tokio::test]
    async fn get_contact_not_found() {
        let db = test_db().await;
        assert!(db.get_contact("+1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn update_round_trips_and_bumps_version() {
        let db = test_db().await;
        let mut contact = Contact::new("+920000000001", t0());
        db.create_contact_if_absent(&contact).await.unwrap();

        contact.stage = Stage::InTrack(Track::CyberClinic);
        contact.selected_track = Some(Track::CyberClinic);
        contact.profile = Profile {
            name: Some("Ali Khan".into()),
            city: Some("Lahore".into()),
            specialty: Some("Cardiologist".into()),
        };
        contact.engagement.document_downloaded = true;
        contact.lifecycle.status = ContactStatus::WarmLead;
        contact.lifecycle.next_follow_up_at = None;

        let stored = db.update_contact(&contact).await.unwrap();
        assert_eq!(stored.version, 1);
        assert_eq!(stored.stage, Stage::InTrack(Track::CyberClinic));
        assert_eq!(stored.profile, contact.profile);
        assert!(stored.engagement.document_downloaded);
        assert_eq!(stored.lifecycle.status, ContactStatus::WarmLead);
        assert!(stored.lifecycle.next_follow_up_at.is_none());
    }

    #[tokio::test]
    async fn stale_version_conflicts() {
        let db = test_db().await;
        let contact = Contact::new("+920000000001", t0());
        db.create_contact_if_absent(&contact).await.unwrap();

        let mut first = contact.clone();
        first.stage = Stage::CollectingName;
        db.update_contact(&first).await.unwrap();

        let mut second = contact.clone();
        second.stage = Stage::CollectingName;
        let err = db.update_contact(&second).await.unwrap_err();
        assert!(matches!(err, DatabaseError::Conflict { .. }));
    }

    #[tokio::test]
    async fn update_missing_contact_is_not_found() {
        let db = test_db().await;
        let err = db
            .update_contact(&Contact::new("+1", t0()))
            .await
            .unwrap_err();
        assert!(matches!(err, DatabaseError::NotFound { .. }));
    }

    #[tokio::test]
    async fn reserved_code_survives_stale_update() {
        let db = test_db().await;
        let contact = Contact::new("+920000000001", t0());
        db.create_contact_if_absent(&contact).await.unwrap();

        assert!(db
            .reserve_referral_code("+920000000001", "DRALIK0001", "https://x?ref=DRALIK0001")
            .await
            .unwrap());
        assert!(!db
            .reserve_referral_code("+920000000001", "DRALIK0002", "https://x?ref=DRALIK0002")
            .await
            .unwrap());

        // Snapshot read before the reservation carries no code.
        let stored = db.update_contact(&contact).await.unwrap();
        assert_eq!(stored.referral.code.as_deref(), Some("DRALIK0001"));
    }

    #[tokio::test]
    async fn duplicate_code_is_constraint_violation() {
        let db = test_db().await;
        for address in ["+1", "+2"] {
            db.create_contact_if_absent(&Contact::new(address, t0()))
                .await
                .unwrap();
        }
        db.reserve_referral_code("+1", "DRDUPE0001", "l").await.unwrap();
        let err = db
            .reserve_referral_code("+2", "DRDUPE0001", "l")
            .await
            .unwrap_err();
        assert!(matches!(err, DatabaseError::Constraint(_)));
    }

    #[tokio::test]
    async fn due_follow_ups_respect_predicate() {
        let db = test_db().await;
        let now = t0() + Duration::days(2);

        let due = Contact::new("+1", t0());
        let not_yet = Contact::new("+2", t0() + Duration::days(3));
        let mut opted_out = Contact::new("+3", t0());
        let mut exempt = Contact::new("+4", t0());
        let mut registered_only = Contact::new("+5", t0());
        for c in [&due, &not_yet, &opted_out, &exempt, &registered_only] {
            db.create_contact_if_absent(c).await.unwrap();
        }

        opted_out.lifecycle.opt_out();
        db.update_contact(&opted_out).await.unwrap();
        exempt.engagement.registered = true;
        exempt.engagement.call_booked = true;
        db.update_contact(&exempt).await.unwrap();
        registered_only.engagement.registered = true;
        db.update_contact(&registered_only).await.unwrap();

        let picked: Vec<String> = db
            .list_due_follow_ups(now, 100)
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.address)
            .collect();
        assert_eq!(picked, ["+1", "+5"]);
    }

    // ── History tests ───────────────────────────────────────────────

    #[tokio::test]
    async fn interactions_newest_first() {
        let db = test_db().await;
        for (i, kind) in [InteractionKind::MessageReceived, InteractionKind::OptionSelected]
            .into_iter()
            .enumerate()
        {
            db.append_interaction(&InteractionFact::new(
                "+1",
                kind,
                t0() + Duration::minutes(i as i64),
                serde_json::json!({ "i": i }),
            ))
            .await
            .unwrap();
        }

        let facts = db.list_interactions("+1", 10).await.unwrap();
        assert_eq!(facts.len(), 2);
        assert_eq!(facts[0].kind, InteractionKind::OptionSelected);
        assert_eq!(facts[1].details["i"], 0);
    }

    #[tokio::test]
    async fn follow_up_history_ignores_duplicates() {
        let db = test_db().await;
        db.create_contact_if_absent(&Contact::new("+1", t0()))
            .await
            .unwrap();
        let record = FollowUpRecord {
            address: "+1".into(),
            number: 1,
            kind: "reminder".into(),
            sent_at: t0(),
        };
        db.record_follow_up(&record).await.unwrap();
        db.record_follow_up(&record).await.unwrap();
        assert_eq!(db.list_follow_ups("+1").await.unwrap(), vec![record]);
    }

    // ── Analytics tests ─────────────────────────────────────────────

    #[tokio::test]
    async fn funnel_and_group_counts() {
        let db = test_db().await;
        let mut a = Contact::new("+1", t0());
        let mut b = Contact::new("+2", t0() + Duration::minutes(1));
        let c = Contact::new("+3", t0() + Duration::minutes(2));
        for x in [&a, &b, &c] {
            db.create_contact_if_absent(x).await.unwrap();
        }

        a.profile = Profile {
            name: Some("Ali".into()),
            city: Some("Lahore".into()),
            specialty: Some("Cardiologist".into()),
        };
        a.selected_track = Some(Track::Referral);
        a.engagement.call_booked = true;
        a.engagement.registered = true;
        db.update_contact(&a).await.unwrap();

        b.profile.city = Some("Lahore".into());
        b.lifecycle.mark_warm_lead();
        db.update_contact(&b).await.unwrap();

        let funnel = db.funnel_counts().await.unwrap();
        assert_eq!(
            funnel,
            FunnelCounts {
                total: 3,
                profile_complete: 1,
                track_selected: 1,
                engaged: 1,
                converted: 1,
            }
        );

        let cities = db
            .count_contacts_by(ContactGrouping::City, Some(10))
            .await
            .unwrap();
        assert_eq!(
            cities,
            vec![CountRow {
                key: "Lahore".into(),
                count: 2
            }]
        );

        let statuses = db
            .count_contacts_by(ContactGrouping::Status, None)
            .await
            .unwrap();
        assert_eq!(statuses.len(), 2);
        assert_eq!(statuses[0].key, "active");

        let engagement = db.engagement_counts().await.unwrap();
        assert_eq!(engagement.call_booked, 1);
        assert_eq!(engagement.video_watched, 0);

        let recent = db.recent_contacts(2).await.unwrap();
        assert_eq!(recent[0].address, "+3");
        assert_eq!(recent.len(), 2);
    }

    #[tokio::test]
    async fn daily_activity_groups_by_day_and_kind() {
        let db = test_db().await;
        let day1 = t0();
        let day2 = t0() + Duration::days(1);
        for (at, kind) in [
            (day1, InteractionKind::MessageReceived),
            (day1, InteractionKind::MessageReceived),
            (day2, InteractionKind::MessageSent),
        ] {
            db.append_interaction(&InteractionFact::new("+1", kind, at, serde_json::json!({})))
                .await
                .unwrap();
        }

        let rows = db.daily_activity(day1 - Duration::hours(1)).await.unwrap();
        assert_eq!(
            rows,
            vec![
                ActivityRow {
                    day: "2026-03-01".into(),
                    kind: "message_received".into(),
                    count: 2
                },
                ActivityRow {
                    day: "2026-03-02".into(),
                    kind: "message_sent".into(),
                    count: 1
                },
            ]
        );
        assert_eq!(db.daily_activity(day2).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn search_matches_name_city_and_status() {
        let db = test_db().await;
        let mut ali = Contact::new("+920001", t0());
        let mut sana = Contact::new("+920002", t0());
        for c in [&ali, &sana] {
            db.create_contact_if_absent(c).await.unwrap();
        }
        ali.profile.name = Some("Ali Khan".into());
        ali.profile.city = Some("Lahore".into());
        ali.profile.specialty = Some("Cardiologist".into());
        db.update_contact(&ali).await.unwrap();
        sana.profile.name = Some("Sana Malik".into());
        sana.profile.city = Some("Karachi".into());
        sana.lifecycle.mark_warm_lead();
        db.update_contact(&sana).await.unwrap();

        let by_name = db
            .search_contacts(&ContactFilter {
                query: Some("ali".into()),
                limit: 10,
                ..Default::default()
            })
            .await
            .unwrap();
        // "ali" also matches "Malik"
        assert_eq!(by_name.len(), 2);

        let by_city = db
            .search_contacts(&ContactFilter {
                city: Some("lahore".into()),
                limit: 10,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(by_city.len(), 1);
        assert_eq!(by_city[0].address, "+920001");

        let warm = db
            .search_contacts(&ContactFilter {
                status: Some(ContactStatus::WarmLead),
                limit: 10,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(warm.len(), 1);
        assert_eq!(warm[0].address, "+920002");

        let cardio = db
            .search_contacts(&ContactFilter {
                specialty: Some("cardio".into()),
                limit: 10,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(cardio.len(), 1);
    }

    // ── Transcript tests ────────────────────────────────────────────

    fn incoming(address: &str, id: &str, text: &str, at: DateTime<Utc>) -> TranscriptMessage {
        TranscriptMessage {
            address: address.into(),
            message_id: Some(id.into()),
            direction: Direction::Incoming,
            message_type: "text".into(),
            content: text.into(),
            status: DeliveryStatus::Received,
            at,
        }
    }

    fn outgoing(address: &str, text: &str, at: DateTime<Utc>) -> TranscriptMessage {
        TranscriptMessage {
            message_id: None,
            direction: Direction::Outgoing,
            status: DeliveryStatus::Sent,
            ..incoming(address, "", text, at)
        }
    }

    #[tokio::test]
    async fn inbound_ids_are_recorded_once() {
        let db = test_db().await;
        assert!(!db.has_inbound_message("+1", "wamid.1").await.unwrap());

        assert!(db.record_message(&incoming("+1", "wamid.1", "Hi", t0())).await.unwrap());
        assert!(!db.record_message(&incoming("+1", "wamid.1", "Hi", t0())).await.unwrap());
        assert!(db.has_inbound_message("+1", "wamid.1").await.unwrap());
        assert!(!db.has_inbound_message("+2", "wamid.1").await.unwrap());

        // Outgoing lines carry no id and never collide.
        assert!(db.record_message(&outgoing("+1", "Welcome", t0())).await.unwrap());
        assert!(db.record_message(&outgoing("+1", "Welcome", t0())).await.unwrap());
        assert_eq!(db.list_messages("+1", 10).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn messages_keep_the_latest_window_in_order() {
        let db = test_db().await;
        for i in 0..5 {
            db.record_message(&outgoing("+1", &format!("m{i}"), t0() + Duration::minutes(i)))
                .await
                .unwrap();
        }
        let window: Vec<String> = db
            .list_messages("+1", 3)
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.content)
            .collect();
        assert_eq!(window, ["m2", "m3", "m4"]);
    }

    #[tokio::test]
    async fn conversations_summarize_and_page() {
        let db = test_db().await;
        let mut ali = Contact::new("+920001", t0());
        db.create_contact_if_absent(&ali).await.unwrap();
        ali.profile.name = Some("Ali Khan".into());
        db.update_contact(&ali).await.unwrap();

        db.record_message(&incoming("+920001", "a1", "Hi", t0())).await.unwrap();
        db.record_message(&outgoing("+920001", "Your name?", t0())).await.unwrap();
        db.record_message(&incoming("+920002", "b1", "Need cost plan", t0() + Duration::hours(1)))
            .await
            .unwrap();

        let all = db.list_conversations(None, 10, 0).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].address, "+920002");
        assert_eq!(all[1].message_count, 2);
        assert_eq!(all[1].name.as_deref(), Some("Ali Khan"));
        assert_eq!(all[0].name, None);

        let second_page = db.list_conversations(None, 1, 1).await.unwrap();
        assert_eq!(second_page[0].address, "+920001");

        assert_eq!(db.count_conversations(Some("khan")).await.unwrap(), 1);
        assert_eq!(db.count_conversations(None).await.unwrap(), 2);

        let one = db.get_conversation("+920001").await.unwrap().unwrap();
        assert_eq!(one.status.as_deref(), Some("active"));
        assert!(db.get_conversation("+404").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn conversation_search_and_stats() {
        let db = test_db().await;
        db.create_contact_if_absent(&Contact::new("+920001", t0()))
            .await
            .unwrap();
        db.record_message(&incoming("+920001", "a1", "Send the COST plan", t0()))
            .await
            .unwrap();
        db.record_message(&outgoing("+920001", "Here it is", t0())).await.unwrap();
        db.record_message(&incoming("+920002", "b1", "Hello", t0() + Duration::days(2)))
            .await
            .unwrap();

        let hits = db
            .search_conversations(&MessageSearch {
                text: Some("cost".into()),
                limit: 10,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].address, "+920001");

        let late = db
            .search_conversations(&MessageSearch {
                from: Some(t0() + Duration::days(1)),
                limit: 10,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(late.len(), 1);
        assert_eq!(late[0].address, "+920002");

        let stats = db.conversation_stats(t0() + Duration::days(1)).await.unwrap();
        assert_eq!(stats.total, 2);
        // +920002 has no contact record.
        assert_eq!(stats.active, 1);
        assert_eq!(stats.average_messages, 1.5);
        assert_eq!(stats.recent_activity, 1);
        assert_eq!(stats.top_active[0].address, "+920001");
    }

    #[tokio::test]
    async fn huge_limits_do_not_wrap() {
        let db = test_db().await;
        for i in 0..3 {
            db.create_contact_if_absent(&Contact::new(format!("+{i}"), t0()))
                .await
                .unwrap();
        }
        assert_eq!(sql_limit(usize::MAX), i64::MAX);
        assert_eq!(db.recent_contacts(usize::MAX).await.unwrap().len(), 3);
        assert_eq!(db.recent_contacts(2).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn file_backed_database_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("funnel.db");
        {
            let db = LibSqlBackend::new_local(&path).await.unwrap();
            db.create_contact_if_absent(&Contact::new("+1", t0()))
                .await
                .unwrap();
        }
        let db = LibSqlBackend::new_local(&path).await.unwrap();
        assert!(db.get_contact("+1").await.unwrap().is_some());
    }
}
