//! Read-only reports over the contact store.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::contacts::{Contact, ContactStatus, Track};
use crate::error::DatabaseError;
use crate::funnel::command::InteractionFact;
use crate::store::{ContactGrouping, CountRow, Database, EngagementCounts};

/// Top-N cut for city and specialty breakdowns.
pub const TOP_GROUPS: usize = 10;

/// Interactions returned with a contact's detail view.
pub const DETAIL_INTERACTIONS: usize = 50;

/// Longest window the daily activity report covers.
pub const MAX_ACTIVITY_DAYS: u32 = 365;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Dashboard {
    pub total: i64,
    /// Every status, zero-filled.
    pub by_status: BTreeMap<String, i64>,
    pub engagement: EngagementCounts,
    /// Every track, zero-filled.
    pub by_track: BTreeMap<String, i64>,
    pub by_city: Vec<CountRow>,
    pub by_specialty: Vec<CountRow>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FunnelStage {
    pub name: &'static str,
    pub count: i64,
    /// Share of all contacts, one decimal place.
    pub percentage: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DailyActivity {
    pub day: String,
    /// Interaction kind to count.
    pub counts: BTreeMap<String, i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContactDetail {
    pub contact: Contact,
    pub interactions: Vec<InteractionFact>,
}

fn zero_filled<'a>(keys: impl Iterator<Item = &'a str>, rows: Vec<CountRow>) -> BTreeMap<String, i64> {
    let mut map: BTreeMap<String, i64> = keys.map(|k| (k.to_string(), 0)).collect();
    for row in rows {
        map.insert(row.key, row.count);
    }
    map
}

pub async fn dashboard(store: &dyn Database) -> Result<Dashboard, DatabaseError> {
    let statuses = store.count_contacts_by(ContactGrouping::Status, None).await?;
    let total = statuses.iter().map(|r| r.count).sum();
    let by_status = zero_filled(ContactStatus::ALL.iter().map(|s| s.as_str()), statuses);

    let tracks = store.count_contacts_by(ContactGrouping::Track, None).await?;
    let by_track = zero_filled(Track::ALL.iter().map(|t| t.id()), tracks);

    Ok(Dashboard {
        total,
        by_status,
        engagement: store.engagement_counts().await?,
        by_track,
        by_city: store
            .count_contacts_by(ContactGrouping::City, Some(TOP_GROUPS))
            .await?,
        by_specialty: store
            .count_contacts_by(ContactGrouping::Specialty, Some(TOP_GROUPS))
            .await?,
    })
}

fn percentage(count: i64, total: i64) -> f64 {
    if total <= 0 {
        return 0.0;
    }
    (count as f64 * 1000.0 / total as f64).round() / 10.0
}

/// The five funnel stages, widest first.
pub async fn funnel(store: &dyn Database) -> Result<Vec<FunnelStage>, DatabaseError> {
    let c = store.funnel_counts().await?;
    let stages = [
        ("Total Contacts", c.total),
        ("Completed Profile", c.profile_complete),
        ("Selected Track", c.track_selected),
        ("Engaged", c.engaged),
        ("Converted", c.converted),
    ];
    Ok(stages
        .into_iter()
        .map(|(name, count)| FunnelStage {
            name,
            count,
            percentage: percentage(count, c.total),
        })
        .collect())
}

/// Per-day interaction counts over the last `days` days, oldest day first.
///
/// `days` is capped at [`MAX_ACTIVITY_DAYS`].
pub async fn daily_activity(
    store: &dyn Database,
    now: DateTime<Utc>,
    days: u32,
) -> Result<Vec<DailyActivity>, DatabaseError> {
    let since = now - Duration::days(i64::from(days.min(MAX_ACTIVITY_DAYS)));
    let rows = store.daily_activity(since).await?;

    let mut by_day: BTreeMap<String, BTreeMap<String, i64>> = BTreeMap::new();
    for row in rows {
        *by_day.entry(row.day).or_default().entry(row.kind).or_default() += row.count;
    }
    Ok(by_day
        .into_iter()
        .map(|(day, counts)| DailyActivity { day, counts })
        .collect())
}

pub async fn contact_detail(
    store: &dyn Database,
    address: &str,
) -> Result<Option<ContactDetail>, DatabaseError> {
    let Some(contact) = store.get_contact(address).await? else {
        return Ok(None);
    };
    let interactions = store.list_interactions(address, DETAIL_INTERACTIONS).await?;
    Ok(Some(ContactDetail {
        contact,
        interactions,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contacts::Stage;
    use crate::funnel::command::InteractionKind;
    use crate::store::LibSqlBackend;

    fn t0() -> DateTime<Utc> {
        "2025-03-01T09:00:00Z".parse().unwrap()
    }

    async fn put(db: &LibSqlBackend, contact: &Contact) {
        db.create_contact_if_absent(contact).await.unwrap();
        db.update_contact(contact).await.unwrap();
    }

    async fn seeded() -> LibSqlBackend {
        let db = LibSqlBackend::new_memory().await.unwrap();

        let mut ali = Contact::new("+1", t0());
        ali.profile.name = Some("Ali Khan".into());
        ali.profile.city = Some("Lahore".into());
        ali.profile.specialty = Some("Cardiologist".into());
        ali.stage = Stage::Menu;
        ali.selected_track = Some(Track::Referral);
        ali.engagement.call_booked = true;
        put(&db, &ali).await;

        let mut sara = Contact::new("+2", t0());
        sara.profile.city = Some("Lahore".into());
        put(&db, &sara).await;

        put(&db, &Contact::new("+3", t0())).await;
        db
    }

    #[tokio::test]
    async fn dashboard_zero_fills_statuses_and_tracks() {
        let db = seeded().await;
        let d = dashboard(&db).await.unwrap();

        assert_eq!(d.total, 3);
        assert_eq!(d.by_status["active"], 3);
        assert_eq!(d.by_status["converted"], 0);
        assert_eq!(d.by_track.len(), Track::ALL.len());
        assert_eq!(d.by_track["referral"], 1);
        assert_eq!(d.by_city[0].key, "Lahore");
        assert_eq!(d.by_city[0].count, 2);
        assert_eq!(d.engagement.call_booked, 1);
    }

    #[tokio::test]
    async fn funnel_percentages() {
        let db = seeded().await;
        let stages = funnel(&db).await.unwrap();

        assert_eq!(stages.len(), 5);
        assert_eq!(stages[0].percentage, 100.0);
        assert_eq!(stages[1].count, 1);
        assert_eq!(stages[1].percentage, 33.3);
        assert_eq!(stages[3].name, "Engaged");
        assert_eq!(stages[3].count, 1);
    }

    #[tokio::test]
    async fn empty_funnel_has_no_division_by_zero() {
        let db = LibSqlBackend::new_memory().await.unwrap();
        let stages = funnel(&db).await.unwrap();
        assert!(stages.iter().all(|s| s.count == 0 && s.percentage == 0.0));
    }

    #[tokio::test]
    async fn activity_groups_by_day() {
        let db = seeded().await;
        for (kind, at) in [
            (InteractionKind::MessageReceived, t0()),
            (InteractionKind::MessageReceived, t0() + Duration::hours(1)),
            (InteractionKind::CallScheduled, t0() + Duration::days(1)),
        ] {
            let fact = InteractionFact::new("+1", kind, at, serde_json::json!({}));
            db.append_interaction(&fact).await.unwrap();
        }

        let activity = daily_activity(&db, t0() + Duration::days(2), 7).await.unwrap();
        assert_eq!(activity.len(), 2);
        assert_eq!(activity[0].day, "2025-03-01");
        assert_eq!(activity[0].counts["message_received"], 2);
        assert_eq!(activity[1].counts["call_scheduled"], 1);
    }

    #[tokio::test]
    async fn activity_window_is_capped() {
        let db = seeded().await;
        let now = t0() + Duration::days(2);
        let old = InteractionFact::new(
            "+1",
            InteractionKind::MessageReceived,
            now - Duration::days(i64::from(MAX_ACTIVITY_DAYS) + 1),
            serde_json::json!({}),
        );
        db.append_interaction(&old).await.unwrap();

        let activity = daily_activity(&db, now, 1_000_000_000).await.unwrap();
        assert!(activity.is_empty());
        assert_eq!(daily_activity(&db, now, u32::MAX).await.unwrap(), activity);
    }

    #[tokio::test]
    async fn detail_for_unknown_contact_is_none() {
        let db = seeded().await;
        assert!(contact_detail(&db, "+404").await.unwrap().is_none());
        let detail = contact_detail(&db, "+1").await.unwrap().unwrap();
        assert_eq!(detail.contact.profile.city.as_deref(), Some("Lahore"));
    }
}
