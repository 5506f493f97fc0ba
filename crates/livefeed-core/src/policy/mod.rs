//! Policy engine — when to retry, when to fall back.
//!
//! ```text
//! stream failure → [should_reconnect?] → [increment] → [fallback?] → poll
//!                                                            └──────→ backoff → stream
//! ```

pub mod backoff;
pub mod failover;

pub use backoff::Backoff;
pub use failover::{decide, FailoverDecision, ReconnectPolicy};
