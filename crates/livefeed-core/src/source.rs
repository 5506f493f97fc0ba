//! The `EventSource` trait, the contract both transports implement.
//!
//! An adapter never touches client state. It reports everything it observes
//! as [`Signal`]s through the [`SignalSink`] it was opened with; the
//! [`DeliveryClient`](crate::DeliveryClient) drains those signals on a single
//! driver task and drops any that carry a stale generation.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;

use crate::error::DeliveryError;
use crate::event::Event;
use crate::health::Strategy;
use crate::registry::lock;

/// Lifecycle of one adapter.
///
/// ```text
/// Idle → Opening → Open → Closing → Idle
///           │        └──→ Failed ──→ Idle
///           ├──→ Failed
///           └──→ Closing
/// ```
///
/// There is no `Failed → Open` edge: a failed adapter goes back to `Idle`
/// before it may be opened again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterState {
    Idle,
    Opening,
    Open,
    Closing,
    Failed,
}

impl AdapterState {
    /// Returns `true` if `self → next` is an edge of the state machine.
    pub fn can_transition_to(self, next: AdapterState) -> bool {
        use AdapterState::*;
        matches!(
            (self, next),
            (Idle, Opening)
                | (Opening, Open)
                | (Opening, Failed)
                | (Opening, Closing)
                | (Open, Closing)
                | (Open, Failed)
                | (Closing, Idle)
                | (Failed, Idle)
        )
    }
}

impl fmt::Display for AdapterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Opening => write!(f, "opening"),
            Self::Open => write!(f, "open"),
            Self::Closing => write!(f, "closing"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Shared, validated adapter state.
///
/// Cloned into the adapter's background task so both sides see the same
/// state.
#[derive(Debug, Clone)]
pub struct StateCell(Arc<Mutex<AdapterState>>);

impl Default for StateCell {
    fn default() -> Self {
        Self(Arc::new(Mutex::new(AdapterState::Idle)))
    }
}

impl StateCell {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> AdapterState {
        *lock(&self.0)
    }

    /// Move to `next`, rejecting edges the state machine does not have.
    pub fn transition(&self, next: AdapterState) -> Result<(), DeliveryError> {
        let mut state = lock(&self.0);
        let from = *state;
        if !from.can_transition_to(next) {
            return Err(DeliveryError::InvalidTransition { from, to: next });
        }
        tracing::trace!(%from, to = %next, "adapter transition");
        *state = next;
        Ok(())
    }

    /// Return to `Idle` once `close()` has torn the transport down.
    pub fn settle_idle(&self) {
        let mut state = lock(&self.0);
        let from = *state;
        if from != AdapterState::Idle {
            tracing::trace!(%from, "adapter settled idle");
        }
        *state = AdapterState::Idle;
    }
}

/// What an adapter observed.
#[derive(Debug)]
pub enum SignalKind {
    /// The transport is up (`Opening → Open`).
    Opened,
    /// One event, in server order.
    Event(Event),
    /// A keep-alive or acknowledgment frame.
    Heartbeat,
    /// Transport-level connectivity changed or was confirmed.
    Connection(bool),
    /// Round-trip time of a successful exchange.
    Latency(Duration),
    /// A non-fatal failure; the adapter keeps running.
    Error(DeliveryError),
    /// The adapter stopped; the client decides what happens next.
    Failed(DeliveryError),
}

/// A [`SignalKind`] tagged with the adapter that produced it.
#[derive(Debug)]
pub struct Signal {
    pub generation: u64,
    pub strategy: Strategy,
    pub kind: SignalKind,
}

/// The upward channel handed to an adapter on `open`.
#[derive(Debug, Clone)]
pub struct SignalSink {
    generation: u64,
    strategy: Strategy,
    tx: mpsc::UnboundedSender<Signal>,
}

impl SignalSink {
    pub fn new(generation: u64, strategy: Strategy, tx: mpsc::UnboundedSender<Signal>) -> Self {
        Self {
            generation,
            strategy,
            tx,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Returns `true` once the client stopped listening.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    fn send(&self, kind: SignalKind) -> bool {
        self.tx
            .send(Signal {
                generation: self.generation,
                strategy: self.strategy,
                kind,
            })
            .is_ok()
    }

    pub fn opened(&self) -> bool {
        self.send(SignalKind::Opened)
    }

    pub fn event(&self, event: Event) -> bool {
        self.send(SignalKind::Event(event))
    }

    pub fn heartbeat(&self) -> bool {
        self.send(SignalKind::Heartbeat)
    }

    pub fn connection(&self, connected: bool) -> bool {
        self.send(SignalKind::Connection(connected))
    }

    pub fn latency(&self, rtt: Duration) -> bool {
        self.send(SignalKind::Latency(rtt))
    }

    pub fn error(&self, err: DeliveryError) -> bool {
        self.send(SignalKind::Error(err))
    }

    pub fn failed(&self, err: DeliveryError) -> bool {
        self.send(SignalKind::Failed(err))
    }
}

/// A transport that delivers events from the server.
///
/// Exactly two production implementations exist (streaming and polling)
/// and the client holds at most one at a time.
pub trait EventSource: Send {
    /// Which strategy this adapter implements.
    fn strategy(&self) -> Strategy;

    /// Current lifecycle state.
    fn state(&self) -> AdapterState;

    /// Start delivering events newer than `since` (milliseconds).
    ///
    /// Must not block: connection work happens in the background and is
    /// reported through `sink`.
    fn open(&mut self, since: u64, sink: SignalSink) -> Result<(), DeliveryError>;

    /// Stop all background work. Safe to call in any state, repeatedly.
    fn close(&mut self);
}

/// Builds adapters on demand; the client asks for a fresh one on every
/// switch.
pub trait SourceConnector: Send + Sync + 'static {
    fn create(&self, strategy: Strategy) -> Box<dyn EventSource>;
}
