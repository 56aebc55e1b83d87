//! Not-before queue for commands the stage machine scheduled for later.
//!
//! Entries only ever produce outbound messages. Losing the queue on restart
//! drops some presentation follow-ups and never touches contact state.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::dispatch::engine::DispatchEngine;
use crate::funnel::command::{OutboundCommand, ScheduledCommand};

#[derive(Debug, PartialEq, Eq)]
struct Entry {
    not_before: DateTime<Utc>,
    seq: u64,
    command: OutboundCommand,
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.not_before, self.seq).cmp(&(other.not_before, other.seq))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Default)]
struct Heap {
    entries: BinaryHeap<Reverse<Entry>>,
    next_seq: u64,
}

/// Min-heap of scheduled commands. Equal times drain in insertion order.
#[derive(Default)]
pub struct DeferredQueue {
    heap: Mutex<Heap>,
}

impl DeferredQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn heap(&self) -> std::sync::MutexGuard<'_, Heap> {
        match self.heap.lock() {
            Ok(h) => h,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn push(&self, scheduled: ScheduledCommand) {
        let mut heap = self.heap();
        let seq = heap.next_seq;
        heap.next_seq += 1;
        heap.entries.push(Reverse(Entry {
            not_before: scheduled.not_before,
            seq,
            command: scheduled.command,
        }));
    }

    /// Pop every entry due at `now`, earliest first.
    pub fn drain_due(&self, now: DateTime<Utc>) -> Vec<ScheduledCommand> {
        let mut heap = self.heap();
        let mut due = Vec::new();
        while heap
            .entries
            .peek()
            .is_some_and(|Reverse(e)| e.not_before <= now)
        {
            if let Some(Reverse(e)) = heap.entries.pop() {
                due.push(ScheduledCommand {
                    not_before: e.not_before,
                    command: e.command,
                });
            }
        }
        due
    }

    pub fn len(&self) -> usize {
        self.heap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Flush the engine's deferred queue every `interval`.
pub fn spawn_deferred_loop(engine: Arc<DispatchEngine>, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;

        loop {
            ticker.tick().await;
            engine.flush_deferred().await;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn scheduled(secs: i64, body: &str) -> ScheduledCommand {
        ScheduledCommand {
            not_before: at(secs),
            command: OutboundCommand::text("+1", body),
        }
    }

    #[test]
    fn drains_in_time_then_insertion_order() {
        let queue = DeferredQueue::new();
        queue.push(scheduled(4, "late"));
        queue.push(scheduled(2, "first"));
        queue.push(scheduled(2, "second"));

        assert!(queue.drain_due(at(1)).is_empty());

        let due = queue.drain_due(at(2));
        let bodies: Vec<_> = due
            .iter()
            .map(|s| match &s.command {
                OutboundCommand::SendText { body, .. } => body.as_str(),
                _ => "",
            })
            .collect();
        assert_eq!(bodies, ["first", "second"]);
        assert_eq!(queue.len(), 1);
    }
}
