//! # History and Stats
//!
//! Bounded in-memory record of recent events plus delivery counters. This is
//! introspection only; nothing here is ever replayed to subscribers.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};

use super::event::Event;

/// Ring buffer of the most recent events
pub(crate) struct EventHistory {
    limit: usize,
    events: Mutex<VecDeque<Arc<Event>>>,
}

impl EventHistory {
    pub(crate) fn new(limit: usize) -> Self {
        Self {
            limit,
            events: Mutex::new(VecDeque::with_capacity(limit.min(1024))),
        }
    }

    pub(crate) fn record(&self, event: Arc<Event>) {
        if self.limit == 0 {
            return;
        }
        let mut events = self.events.lock().unwrap_or_else(PoisonError::into_inner);
        if events.len() == self.limit {
            events.pop_front();
        }
        events.push_back(event);
    }

    /// Newest `limit` events (oldest first), optionally for one exact topic
    pub(crate) fn query(&self, topic: Option<&str>, limit: usize) -> Vec<Event> {
        let events = self.events.lock().unwrap_or_else(PoisonError::into_inner);
        let mut selected: Vec<Event> = events
            .iter()
            .rev()
            .filter(|e| topic.map_or(true, |t| e.topic() == t))
            .take(limit)
            .map(|e| Event::clone(e))
            .collect();
        selected.reverse();
        selected
    }
}

/// Live delivery counters
#[derive(Debug, Default)]
pub(crate) struct BusStats {
    pub(crate) published: AtomicU64,
    pub(crate) delivered: AtomicU64,
    pub(crate) failed: AtomicU64,
    pub(crate) timed_out: AtomicU64,
    pub(crate) dropped: AtomicU64,
    pub(crate) rejected: AtomicU64,
}

impl BusStats {
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add(counter: &AtomicU64, n: usize) {
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            published: self.published.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of the bus counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    /// Events accepted by the bus (including `_error` events)
    pub published: u64,
    /// Handler invocations that completed successfully
    pub delivered: u64,
    /// Handler invocations that returned an error or panicked
    pub failed: u64,
    /// Handler invocations that exceeded the handler timeout
    pub timed_out: u64,
    /// Deliveries discarded by overflow policy, unsubscribe or shutdown
    pub dropped: u64,
    /// Deliveries refused back to the publisher
    pub rejected: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::event::EventMetadata;
    use serde_json::json;

    fn event(topic: &str, n: u64) -> Arc<Event> {
        Arc::new(Event::new(topic, json!({ "n": n }), EventMetadata::new()))
    }

    #[test]
    fn test_history_is_bounded_and_ordered() {
        let history = EventHistory::new(3);
        for n in 0..5 {
            history.record(event("price_update", n));
        }
        let numbers: Vec<u64> = history
            .query(None, 10)
            .iter()
            .map(|e| e.payload()["n"].as_u64().unwrap())
            .collect();
        assert_eq!(numbers, vec![2, 3, 4]);
    }

    #[test]
    fn test_history_filter_and_limit() {
        let history = EventHistory::new(10);
        history.record(event("price_update", 1));
        history.record(event("sentiment", 2));
        history.record(event("price_update", 3));
        history.record(event("price_update", 4));

        let recent = history.query(Some("price_update"), 2);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].payload()["n"], 3);
        assert_eq!(recent[1].payload()["n"], 4);
        assert!(history.query(Some("unknown_topic"), 10).is_empty());
    }

    #[test]
    fn test_zero_limit_disables_history() {
        let history = EventHistory::new(0);
        history.record(event("a", 1));
        assert!(history.query(None, 10).is_empty());
    }

    #[test]
    fn test_stats_snapshot() {
        let stats = BusStats::default();
        BusStats::bump(&stats.published);
        BusStats::add(&stats.dropped, 3);
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.published, 1);
        assert_eq!(snapshot.dropped, 3);
        assert_eq!(snapshot.failed, 0);
    }
}
