//! livefeed-core — resilient delivery of a server-ordered event stream.
//!
//! # Overview
//!
//! ```text
//! DeliveryClient ─┬─ HealthMonitor     (connectivity, latency, backoff, probes)
//!                 ├─ EventSource       (streaming | polling, one at a time)
//!                 ├─ SubscriberRegistry (per-type + wildcard handlers)
//!                 └─ SharedWatermark   (highest timestamp seen, resume point)
//! ```
//!
//! The core crate defines:
//!
//! - [`DeliveryClient`] — connect / disconnect / subscribe, failover and recovery
//! - [`HealthMonitor`] — single source of truth for connection health
//! - [`EventSource`] — the contract both transports implement
//! - [`DeliveryError`] — structured error type
//! - [`policy`] module — backoff and the failover decision
//! - [`log`] module — the bounded per-subscriber event log collaborator

pub mod client;
pub mod config;
pub mod error;
pub mod event;
pub mod health;
pub mod log;
pub mod policy;
pub mod registry;
pub mod source;

pub use client::DeliveryClient;
pub use config::{ClientConfig, HealthConfig};
pub use error::DeliveryError;
pub use event::{DedupWindow, Event, EventDraft, SharedWatermark, WILDCARD};
pub use health::{ConnectionHealth, HealthMonitor, HealthProbe, Strategy};
pub use log::{EventLog, MemoryEventLog};
pub use policy::{Backoff, FailoverDecision, ReconnectPolicy};
pub use registry::{HandlerError, SubscriberRegistry, Subscription};
pub use source::{AdapterState, EventSource, Signal, SignalKind, SignalSink, SourceConnector, StateCell};
