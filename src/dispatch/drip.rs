//! Drip follow-ups: the periodic tick and the manual single-contact step.
//!
//! A tick lists due contacts, then handles each one under its contact lock
//! with a fresh read, so an inbound reply that lands mid-tick wins. The send
//! happens before any state change: if it fails the contact is left as it
//! was and the next tick tries again.

use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use futures::stream;

use crate::contacts::Contact;
use crate::dispatch::engine::DispatchEngine;
use crate::error::{DatabaseError, FunnelError};
use crate::funnel::followup::{self, plan_step, plan_tick};
use crate::store::FollowUpRecord;

/// Contacts handled concurrently within one tick.
const TICK_CONCURRENCY: usize = 8;

/// Outcome of one follow-up attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum FollowUpOutcome {
    Sent(Contact),
    SendFailed,
    /// Not eligible (or no longer due) once re-read under the lock.
    Skipped,
}

/// Tally for one tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct TickReport {
    pub sent: usize,
    pub failed: usize,
    pub skipped: usize,
}

pub struct DripScheduler {
    engine: Arc<DispatchEngine>,
    batch_limit: usize,
    running: tokio::sync::Mutex<()>,
}

impl DripScheduler {
    pub fn new(engine: Arc<DispatchEngine>, batch_limit: usize) -> Self {
        Self {
            engine,
            batch_limit,
            running: tokio::sync::Mutex::new(()),
        }
    }

    /// Run one tick. Returns `None` if a previous tick is still running.
    pub async fn tick(&self) -> Option<TickReport> {
        let Ok(_running) = self.running.try_lock() else {
            tracing::debug!("Drip tick still running, skipping");
            return None;
        };

        let now = self.engine.now();
        let mut report = TickReport::default();

        let due = match self
            .engine
            .store
            .list_due_follow_ups(now, self.batch_limit)
            .await
        {
            Ok(due) => due,
            Err(e) => {
                tracing::error!(error = %e, "Failed to list due follow-ups");
                return Some(report);
            }
        };

        let planned = plan_tick(&due, now, &self.engine.catalog);
        report.skipped += due.len() - planned.len();

        let outcomes: Vec<_> = stream::iter(planned)
            .map(|step| async move {
                let address = step.address;
                (self.step(&address, now, true).await, address)
            })
            .buffer_unordered(TICK_CONCURRENCY)
            .collect()
            .await;

        for (outcome, address) in outcomes {
            match outcome {
                Ok(FollowUpOutcome::Sent(_)) => report.sent += 1,
                Ok(FollowUpOutcome::SendFailed) => report.failed += 1,
                Ok(FollowUpOutcome::Skipped) => report.skipped += 1,
                Err(e) => {
                    report.failed += 1;
                    tracing::error!(address = %address, error = %e, "Follow-up failed");
                }
            }
        }

        if report.sent + report.failed > 0 {
            tracing::info!(
                sent = report.sent,
                failed = report.failed,
                skipped = report.skipped,
                "Drip tick complete"
            );
        }
        Some(report)
    }

    /// Send the next follow-up to one contact now, ignoring when it is due.
    pub async fn follow_up_now(&self, address: &str) -> Result<FollowUpOutcome, FunnelError> {
        let now = self.engine.now();
        self.step(address, now, false).await
    }

    async fn step(
        &self,
        address: &str,
        now: DateTime<Utc>,
        require_due: bool,
    ) -> Result<FollowUpOutcome, FunnelError> {
        let engine = &self.engine;
        let _guard = engine.locks.acquire(address).await;
        let contact = engine.reload(address).await?;

        if require_due && !followup::is_due(&contact, now) {
            return Ok(FollowUpOutcome::Skipped);
        }
        let Some(step) = plan_step(&contact, now, &engine.catalog) else {
            return Ok(FollowUpOutcome::Skipped);
        };

        if let Err(e) = engine.send(&step.command, now).await {
            tracing::warn!(address, follow_up = step.number, error = %e, "Follow-up send failed");
            return Ok(FollowUpOutcome::SendFailed);
        }

        let mut updated = contact;
        step.apply(&mut updated);
        updated.updated_at = now;

        let stored = match engine.store.update_contact(&updated).await {
            Ok(stored) => stored,
            Err(DatabaseError::Conflict { .. }) => {
                tracing::warn!(address, follow_up = step.number, "Follow-up sent but contact changed underneath");
                return Err(FunnelError::ConcurrentUpdate {
                    address: address.to_string(),
                });
            }
            Err(e) => return Err(e.into()),
        };

        let record = FollowUpRecord {
            address: address.to_string(),
            number: step.number,
            kind: step.kind.as_str().to_string(),
            sent_at: now,
        };
        if let Err(e) = engine.store.record_follow_up(&record).await {
            tracing::error!(address, follow_up = step.number, error = %e, "Failed to record follow-up");
        }
        engine.append_facts(&[step.fact(now)]).await;

        tracing::info!(
            address,
            follow_up = step.number,
            kind = %step.kind,
            status = %stored.lifecycle.status.as_str(),
            "Follow-up sent"
        );
        Ok(FollowUpOutcome::Sent(stored))
    }
}

/// Tick `scheduler` on a cron schedule until the task is aborted.
pub fn spawn_drip_ticker(
    scheduler: Arc<DripScheduler>,
    schedule: &str,
) -> Result<tokio::task::JoinHandle<()>, cron::error::Error> {
    let schedule = cron::Schedule::from_str(schedule)?;
    Ok(tokio::spawn(async move {
        loop {
            let Some(next) = schedule.upcoming(Utc).next() else {
                tracing::warn!("Drip schedule has no upcoming times, stopping");
                return;
            };
            let wait = (next - Utc::now()).to_std().unwrap_or_default();
            tokio::time::sleep(wait).await;
            scheduler.tick().await;
        }
    }))
}
