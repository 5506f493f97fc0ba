//! Subscriber management.
//!
//! Handlers are keyed by event type (plus the [`WILDCARD`] key) and removed
//! through the [`Subscription`] token returned at registration, never by
//! searching for the handler itself.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::event::{Event, WILDCARD};

/// Error a handler may return to signal it could not process an event.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// A subscriber callback.
pub type EventHandler = dyn Fn(&Event) -> Result<(), HandlerError> + Send + Sync;

/// Capability returned by every `on*` registration; consume it to remove
/// the registration.
///
/// Dropping the token leaves the registration in place.
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub(crate) fn new(cancel: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// Remove the registration this token was issued for.
    pub fn unsubscribe(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

/// Lock a mutex, recovering the data if a previous holder panicked.
///
/// Callbacks never run while one of these locks is held, so a poisoned
/// guard still protects consistent data.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct ListenerInner<F: ?Sized> {
    next_id: u64,
    entries: BTreeMap<u64, Arc<F>>,
}

/// Id-keyed set of listeners of one callback shape.
pub(crate) struct ListenerSet<F: ?Sized> {
    inner: Arc<Mutex<ListenerInner<F>>>,
}

impl<F: ?Sized + Send + Sync + 'static> ListenerSet<F> {
    pub(crate) fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(ListenerInner {
                next_id: 0,
                entries: BTreeMap::new(),
            })),
        }
    }

    pub(crate) fn insert(&self, listener: Arc<F>) -> Subscription {
        let id = {
            let mut inner = lock(&self.inner);
            let id = inner.next_id;
            inner.next_id += 1;
            inner.entries.insert(id, listener);
            id
        };
        let weak = Arc::downgrade(&self.inner);
        Subscription::new(move || {
            if let Some(inner) = weak.upgrade() {
                lock(&inner).entries.remove(&id);
            }
        })
    }

    /// Clone out the current listeners, in registration order, so they can be
    /// invoked unlocked.
    pub(crate) fn snapshot(&self) -> Vec<Arc<F>> {
        lock(&self.inner).entries.values().cloned().collect()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        lock(&self.inner).entries.len()
    }
}

impl<F: ?Sized> Clone for ListenerSet<F> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

#[derive(Default)]
struct RegistryInner {
    next_id: u64,
    by_type: HashMap<String, BTreeMap<u64, Arc<EventHandler>>>,
}

/// Event-type → handler registry.
#[derive(Clone, Default)]
pub struct SubscriberRegistry {
    inner: Arc<Mutex<RegistryInner>>,
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `event_type` (`"*"` for every type).
    pub fn register<F>(&self, event_type: &str, handler: F) -> Subscription
    where
        F: Fn(&Event) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        let handler: Arc<EventHandler> = Arc::new(handler);
        let id = {
            let mut inner = lock(&self.inner);
            let id = inner.next_id;
            inner.next_id += 1;
            inner
                .by_type
                .entry(event_type.to_string())
                .or_default()
                .insert(id, handler);
            id
        };
        let weak = Arc::downgrade(&self.inner);
        let event_type = event_type.to_string();
        Subscription::new(move || {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let mut inner = lock(&inner);
            if let Some(handlers) = inner.by_type.get_mut(&event_type) {
                handlers.remove(&id);
                if handlers.is_empty() {
                    inner.by_type.remove(&event_type);
                }
            }
        })
    }

    /// Handlers an event of `event_type` is dispatched to: type-specific
    /// first, then wildcard, each in registration order.
    pub fn handlers_for(&self, event_type: &str) -> Vec<Arc<EventHandler>> {
        let inner = lock(&self.inner);
        let specific = inner.by_type.get(event_type).into_iter().flat_map(|h| h.values());
        let wildcard = inner
            .by_type
            .get(WILDCARD)
            .filter(|_| event_type != WILDCARD)
            .into_iter()
            .flat_map(|h| h.values());
        specific.chain(wildcard).cloned().collect()
    }

    /// Total number of registrations.
    pub fn len(&self) -> usize {
        lock(&self.inner).by_type.values().map(BTreeMap::len).sum()
    }

    /// Returns `true` if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
