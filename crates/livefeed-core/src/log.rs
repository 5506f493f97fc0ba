//! Bounded per-subscriber event log.
//!
//! This is the server-side collaborator both transports read from. The
//! in-memory implementation keeps the most recent [`DEFAULT_RETENTION`]
//! events per subscriber and is what tests and local servers use.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use crate::event::{Event, EventDraft};
use crate::registry::lock;

/// Events kept per subscriber before the oldest are discarded.
pub const DEFAULT_RETENTION: usize = 1000;

/// Store of recent events, queried by the streaming and polling endpoints.
pub trait EventLog: Send + Sync {
    /// Events strictly newer than `since_ms`, oldest first.
    fn events_since(&self, subscriber_id: &str, since_ms: u64) -> Vec<Event>;

    /// The `limit` most recent events, newest first.
    fn latest_events(&self, subscriber_id: &str, limit: usize) -> Vec<Event>;

    /// Assign an id and timestamp to `draft` and append it.
    fn add_event(&self, subscriber_id: &str, draft: EventDraft) -> Event;
}

#[derive(Default)]
struct SubscriberLog {
    events: VecDeque<Event>,
    last_timestamp: u64,
    next_seq: u64,
}

/// In-memory event log.
///
/// All data is lost when the process exits.
pub struct MemoryEventLog {
    retention: usize,
    logs: Mutex<HashMap<String, SubscriberLog>>,
}

impl Default for MemoryEventLog {
    fn default() -> Self {
        Self::with_retention(DEFAULT_RETENTION)
    }
}

impl MemoryEventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retention(retention: usize) -> Self {
        Self {
            retention: retention.max(1),
            logs: Mutex::new(HashMap::new()),
        }
    }

    /// Append an already-stamped event (replication, fixtures).
    ///
    /// Timestamps must not go backwards; an older event is dropped and
    /// `false` returned.
    pub fn append(&self, subscriber_id: &str, event: Event) -> bool {
        let mut logs = lock(&self.logs);
        let log = logs.entry(subscriber_id.to_string()).or_default();
        if event.timestamp < log.last_timestamp {
            tracing::debug!(
                subscriber_id,
                timestamp = event.timestamp,
                last = log.last_timestamp,
                "dropping out-of-order event"
            );
            return false;
        }
        log.last_timestamp = event.timestamp;
        Self::push_bounded(log, event, self.retention);
        true
    }

    /// Number of retained events for `subscriber_id`.
    pub fn len(&self, subscriber_id: &str) -> usize {
        lock(&self.logs)
            .get(subscriber_id)
            .map_or(0, |log| log.events.len())
    }

    fn push_bounded(log: &mut SubscriberLog, event: Event, retention: usize) {
        log.events.push_back(event);
        while log.events.len() > retention {
            log.events.pop_front();
        }
    }
}

impl EventLog for MemoryEventLog {
    fn events_since(&self, subscriber_id: &str, since_ms: u64) -> Vec<Event> {
        lock(&self.logs)
            .get(subscriber_id)
            .map(|log| {
                log.events
                    .iter()
                    .filter(|e| e.timestamp > since_ms)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    fn latest_events(&self, subscriber_id: &str, limit: usize) -> Vec<Event> {
        lock(&self.logs)
            .get(subscriber_id)
            .map(|log| log.events.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default()
    }

    fn add_event(&self, subscriber_id: &str, draft: EventDraft) -> Event {
        let now = chrono::Utc::now().timestamp_millis().max(0) as u64;
        let mut logs = lock(&self.logs);
        let log = logs.entry(subscriber_id.to_string()).or_default();
        // strictly increasing, so a `since` query never skips a same-ms event
        let timestamp = now.max(log.last_timestamp + 1);
        log.last_timestamp = timestamp;
        log.next_seq += 1;
        let event = Event {
            id: format!("evt_{timestamp}_{}", log.next_seq),
            kind: draft.kind,
            payload: draft.payload,
            timestamp,
        };
        Self::push_bounded(log, event.clone(), self.retention);
        event
    }
}
