//! Event model, watermark and recent-id window.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Subscription key that receives every event type.
pub const WILDCARD: &str = "*";

/// A server-originated event. Immutable once emitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Server-assigned identifier.
    pub id: String,
    /// Event type used for subscriber routing (e.g. `"staking.reward"`).
    #[serde(rename = "type")]
    pub kind: String,
    /// Opaque payload.
    #[serde(default)]
    pub payload: Value,
    /// Milliseconds since the Unix epoch; the ordering key.
    pub timestamp: u64,
}

impl Event {
    pub fn new(id: impl Into<String>, kind: impl Into<String>, payload: Value, timestamp: u64) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
            payload,
            timestamp,
        }
    }
}

/// An event before the log assigns its id and timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventDraft {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
}

impl EventDraft {
    pub fn new(kind: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: kind.into(),
            payload,
        }
    }
}

/// Highest event timestamp observed, shared between the client handle and
/// its driver task.
///
/// Only ever moves forward: [`observe`](Self::observe) is a `fetch_max`.
#[derive(Debug, Clone, Default)]
pub struct SharedWatermark(Arc<AtomicU64>);

impl SharedWatermark {
    pub fn new(initial: u64) -> Self {
        Self(Arc::new(AtomicU64::new(initial)))
    }

    /// Current watermark in milliseconds.
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }

    /// Fold `timestamp` into the watermark. Returns `true` if it advanced.
    pub fn observe(&self, timestamp: u64) -> bool {
        self.0.fetch_max(timestamp, Ordering::AcqRel) < timestamp
    }
}

/// Bounded window of recently delivered event ids.
///
/// Oldest ids are evicted first once `capacity` is reached. A capacity of 0
/// admits everything.
#[derive(Debug, Clone)]
pub struct DedupWindow {
    capacity: usize,
    order: VecDeque<String>,
    seen: HashSet<String>,
}

impl DedupWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            order: VecDeque::with_capacity(capacity),
            seen: HashSet::with_capacity(capacity),
        }
    }

    /// Record `id`. Returns `false` if it is already in the window.
    pub fn admit(&mut self, id: &str) -> bool {
        if self.capacity == 0 {
            return true;
        }
        if self.seen.contains(id) {
            return false;
        }
        if self.order.len() == self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        self.order.push_back(id.to_string());
        self.seen.insert(id.to_string());
        true
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}
