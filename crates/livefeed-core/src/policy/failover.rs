//! The failover decision taken after a streaming failure.

use std::time::Duration;

/// Questions the failover decision asks about connection health.
///
/// [`HealthMonitor`](crate::HealthMonitor) is the production implementation.
pub trait ReconnectPolicy {
    /// Attempts recorded since the last successful connection.
    fn reconnect_attempts(&self) -> u32;
    /// Record one more failed attempt; returns the new count.
    fn increment_reconnect_attempts(&self) -> u32;
    /// `true` while attempts remain below the ceiling.
    fn should_reconnect(&self) -> bool;
    /// `true` if streaming should be abandoned for polling.
    fn should_fallback_to_polling(&self) -> bool;
    /// Delay before the next streaming attempt.
    fn reconnect_delay(&self) -> Duration;
}

/// What to do after the streaming source failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailoverDecision {
    /// Ceiling reached; stop retrying until the caller reconnects.
    GiveUp { attempts: u32 },
    /// Close streaming and start polling at the current watermark.
    FallBackToPolling,
    /// Wait, then reopen streaming at the current watermark.
    RetryStreaming(Duration),
}

/// Decide the next step after a streaming failure.
///
/// The ceiling is checked before the failure is counted, so with a ceiling
/// of `n` the `n + 1`-th consecutive failure is the one that gives up.
pub fn decide(policy: &dyn ReconnectPolicy) -> FailoverDecision {
    if !policy.should_reconnect() {
        return FailoverDecision::GiveUp {
            attempts: policy.reconnect_attempts(),
        };
    }
    policy.increment_reconnect_attempts();
    if policy.should_fallback_to_polling() {
        FailoverDecision::FallBackToPolling
    } else {
        FailoverDecision::RetryStreaming(policy.reconnect_delay())
    }
}
