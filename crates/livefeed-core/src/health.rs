//! Connection health monitor.
//!
//! Single source of truth for connectivity, latency and reconnect attempts,
//! and for the policy built on them (backoff, fallback). Two background
//! timers keep it honest:
//!
//! - a staleness check that marks the connection down when nothing was heard
//!   for two heartbeat intervals (silent half-open connections);
//! - an active probe, independent of the data transport, that confirms the
//!   server is reachable at all.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};

use crate::config::HealthConfig;
use crate::error::DeliveryError;
use crate::policy::{Backoff, ReconnectPolicy};
use crate::registry::{lock, ListenerSet, Subscription};

/// Which transport is active.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    /// One long-lived connection with server-pushed frames.
    #[default]
    Streaming,
    /// Periodic requests for events since the watermark.
    Polling,
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Streaming => write!(f, "streaming"),
            Self::Polling => write!(f, "polling"),
        }
    }
}

/// Point-in-time view of connection health.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionHealth {
    pub connected: bool,
    /// Wall-clock time of the last heartbeat or connection update.
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub reconnect_attempts: u32,
    /// Round-trip time of the most recent successful exchange.
    pub latency_ms: u64,
    pub strategy: Strategy,
}

impl Default for ConnectionHealth {
    fn default() -> Self {
        Self {
            connected: false,
            last_heartbeat_at: None,
            reconnect_attempts: 0,
            latency_ms: 0,
            strategy: Strategy::Streaming,
        }
    }
}

/// Lightweight reachability check, decoupled from the data transport.
///
/// Returns the round-trip time on success.
#[async_trait]
pub trait HealthProbe: Send + Sync + 'static {
    async fn probe(&self) -> Result<Duration, DeliveryError>;
}

type HealthListener = dyn Fn(&ConnectionHealth) + Send + Sync;

struct MonitorState {
    health: ConnectionHealth,
    /// Monotonic twin of `last_heartbeat_at`, used for staleness.
    last_seen: Option<Instant>,
    /// Bumped by every `start` and `stop`; timers carry the value they were
    /// spawned with and go quiet once it no longer matches.
    generation: u64,
    timers: Vec<JoinHandle<()>>,
}

/// Tracks connection health and answers the reconnect/fallback questions.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct HealthMonitor {
    config: Arc<HealthConfig>,
    max_reconnect_attempts: u32,
    backoff: Backoff,
    probe: Option<Arc<dyn HealthProbe>>,
    state: Arc<Mutex<MonitorState>>,
    listeners: ListenerSet<HealthListener>,
}

impl HealthMonitor {
    /// Create a stopped monitor with `connected = false`.
    pub fn new(
        config: HealthConfig,
        max_reconnect_attempts: u32,
        probe: Option<Arc<dyn HealthProbe>>,
    ) -> Self {
        Self {
            backoff: Backoff::from_config(&config),
            config: Arc::new(config),
            max_reconnect_attempts,
            probe,
            state: Arc::new(Mutex::new(MonitorState {
                health: ConnectionHealth::default(),
                last_seen: None,
                generation: 0,
                timers: Vec::new(),
            })),
            listeners: ListenerSet::new(),
        }
    }

    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    /// Current health.
    pub fn snapshot(&self) -> ConnectionHealth {
        lock(&self.state).health.clone()
    }

    /// Returns `true` between `start()` and `stop()`.
    pub fn is_running(&self) -> bool {
        !lock(&self.state).timers.is_empty()
    }

    /// Spawn the staleness timer and, if a probe is configured, the probe
    /// timer. No-op when already running.
    pub fn start(&self) {
        let mut state = lock(&self.state);
        if !state.timers.is_empty() {
            return;
        }
        state.generation += 1;
        let generation = state.generation;

        let heartbeat = self.config.heartbeat_interval;
        let monitor = self.clone();
        state.timers.push(tokio::spawn(async move {
            let mut ticker = time::interval_at(Instant::now() + heartbeat, heartbeat);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                monitor.mark_if_stale(Some(generation));
            }
        }));

        if let Some(probe) = self.probe.clone() {
            let every = self.config.health_check_interval;
            let monitor = self.clone();
            state.timers.push(tokio::spawn(async move {
                let mut ticker = time::interval(every);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    let result = probe.probe().await;
                    monitor.apply_probe(Some(generation), &result);
                }
            }));
        }

        tracing::debug!(
            heartbeat_ms = heartbeat.as_millis() as u64,
            probing = self.probe.is_some(),
            "health monitor started"
        );
    }

    /// Cancel both timers. No-op when already stopped.
    pub fn stop(&self) {
        let timers = {
            let mut state = lock(&self.state);
            state.generation += 1;
            std::mem::take(&mut state.timers)
        };
        if timers.is_empty() {
            return;
        }
        for timer in timers {
            timer.abort();
        }
        tracing::debug!("health monitor stopped");
    }

    /// Record a transport-reported state. Resets the attempt counter on a
    /// disconnected → connected transition.
    pub fn update_connection(&self, connected: bool, strategy: Strategy) {
        self.mutate(|state| {
            let was_connected = state.health.connected;
            state.health.connected = connected;
            state.health.strategy = strategy;
            Self::touch(state);
            if connected && !was_connected {
                state.health.reconnect_attempts = 0;
            }
        });
    }

    /// A transport just came up. Always a fresh connection, so the attempt
    /// counter resets even if the previous transport was still marked
    /// connected.
    pub fn connection_established(&self, strategy: Strategy) {
        self.mutate(|state| {
            state.health.connected = true;
            state.health.strategy = strategy;
            state.health.reconnect_attempts = 0;
            Self::touch(state);
        });
    }

    /// Record which transport is now active.
    pub fn set_strategy(&self, strategy: Strategy) {
        self.mutate(|state| state.health.strategy = strategy);
    }

    /// Record the round-trip time of the latest successful exchange.
    pub fn record_latency(&self, rtt: Duration) {
        self.mutate(|state| state.health.latency_ms = rtt.as_millis() as u64);
    }

    /// Count one failed (re)connection attempt.
    pub fn increment_reconnect_attempts(&self) -> u32 {
        self.mutate(|state| {
            state.health.reconnect_attempts += 1;
            state.health.reconnect_attempts
        })
    }

    /// Forget attempts counted by an earlier session.
    pub fn reset_attempts(&self) {
        self.mutate(|state| state.health.reconnect_attempts = 0);
    }

    /// Mark the connection down (client shutdown). Silent when already down.
    pub fn mark_disconnected(&self) {
        self.mutate_if(None, |state| {
            let changed = state.health.connected;
            state.health.connected = false;
            changed
        });
    }

    /// `true` while attempts remain below the configured ceiling.
    pub fn should_reconnect(&self) -> bool {
        lock(&self.state).health.reconnect_attempts < self.max_reconnect_attempts
    }

    /// Exponential backoff with jitter for the current attempt count.
    pub fn reconnect_delay(&self) -> Duration {
        let attempts = lock(&self.state).health.reconnect_attempts;
        self.backoff.delay(attempts)
    }

    /// `true` when not connected, latency is above threshold, or enough
    /// attempts failed. Evaluated fresh on every call.
    pub fn should_fallback_to_polling(&self) -> bool {
        let health = self.snapshot();
        !health.connected
            || Duration::from_millis(health.latency_ms) > self.config.latency_threshold
            || health.reconnect_attempts >= self.config.fallback_after_attempts
    }

    /// Register a listener invoked after every mutation.
    ///
    /// Listeners run synchronously on the mutating thread; a panicking
    /// listener is logged and does not affect the others.
    pub fn on_health_change<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&ConnectionHealth) + Send + Sync + 'static,
    {
        self.listeners.insert(Arc::new(listener))
    }

    /// Mark the connection down if nothing was heard for two heartbeat
    /// intervals. Returns `true` if it did.
    pub fn check_staleness(&self) -> bool {
        self.mark_if_stale(None)
    }

    /// Run the configured probe once and apply its outcome.
    pub async fn probe_now(&self) -> Option<Result<Duration, DeliveryError>> {
        let probe = self.probe.clone()?;
        let result = probe.probe().await;
        self.apply_probe(None, &result);
        Some(result)
    }

    fn mark_if_stale(&self, generation: Option<u64>) -> bool {
        let limit = self.config.heartbeat_interval * 2;
        self.mutate_if(generation, |state| {
            let stale = state.health.connected
                && state.last_seen.map_or(true, |seen| seen.elapsed() > limit);
            if stale {
                tracing::warn!(
                    limit_ms = limit.as_millis() as u64,
                    "no heartbeat within limit, marking connection stale"
                );
                state.health.connected = false;
            }
            stale
        })
    }

    fn apply_probe(&self, generation: Option<u64>, result: &Result<Duration, DeliveryError>) {
        match result {
            Ok(rtt) => {
                let rtt = *rtt;
                self.mutate_if(generation, |state| {
                    state.health.latency_ms = rtt.as_millis() as u64;
                    if !state.health.connected {
                        tracing::info!(latency_ms = state.health.latency_ms, "health probe recovered");
                        state.health.connected = true;
                        state.health.reconnect_attempts = 0;
                        Self::touch(state);
                    }
                    true
                });
            }
            Err(e) => {
                self.mutate_if(generation, |state| {
                    let changed = state.health.connected;
                    if changed {
                        tracing::warn!(error = %e, "health probe failed, marking disconnected");
                    }
                    state.health.connected = false;
                    changed
                });
            }
        }
    }

    fn touch(state: &mut MonitorState) {
        state.health.last_heartbeat_at = Some(Utc::now());
        state.last_seen = Some(Instant::now());
    }

    fn mutate<R>(&self, f: impl FnOnce(&mut MonitorState) -> R) -> R {
        let (out, health) = {
            let mut state = lock(&self.state);
            let out = f(&mut state);
            (out, state.health.clone())
        };
        self.notify(&health);
        out
    }

    /// Apply `f` if `generation` is current (or not given); notify only
    /// when `f` reports a change.
    fn mutate_if(
        &self,
        generation: Option<u64>,
        f: impl FnOnce(&mut MonitorState) -> bool,
    ) -> bool {
        let health = {
            let mut state = lock(&self.state);
            if generation.is_some_and(|g| g != state.generation) {
                return false;
            }
            if !f(&mut state) {
                return false;
            }
            state.health.clone()
        };
        self.notify(&health);
        true
    }

    fn notify(&self, health: &ConnectionHealth) {
        for listener in self.listeners.snapshot() {
            if catch_unwind(AssertUnwindSafe(|| listener(health))).is_err() {
                tracing::error!("health listener panicked");
            }
        }
    }
}

impl ReconnectPolicy for HealthMonitor {
    fn reconnect_attempts(&self) -> u32 {
        lock(&self.state).health.reconnect_attempts
    }

    fn increment_reconnect_attempts(&self) -> u32 {
        HealthMonitor::increment_reconnect_attempts(self)
    }

    fn should_reconnect(&self) -> bool {
        HealthMonitor::should_reconnect(self)
    }

    fn should_fallback_to_polling(&self) -> bool {
        HealthMonitor::should_fallback_to_polling(self)
    }

    fn reconnect_delay(&self) -> Duration {
        HealthMonitor::reconnect_delay(self)
    }
}

impl fmt::Debug for HealthMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HealthMonitor")
            .field("health", &self.snapshot())
            .field("running", &self.is_running())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use super::*;

    fn monitor() -> HealthMonitor {
        HealthMonitor::new(HealthConfig::default(), 5, None)
    }

    struct CountingProbe {
        calls: AtomicUsize,
        healthy: AtomicBool,
    }

    #[async_trait]
    impl HealthProbe for CountingProbe {
        async fn probe(&self) -> Result<Duration, DeliveryError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.healthy.load(Ordering::SeqCst) {
                Ok(Duration::from_millis(12))
            } else {
                Err(DeliveryError::Http("connection refused".into()))
            }
        }
    }

    #[test]
    fn starts_disconnected() {
        let m = monitor();
        let health = m.snapshot();
        assert!(!health.connected);
        assert_eq!(health.reconnect_attempts, 0);
        assert!(health.last_heartbeat_at.is_none());
    }

    #[test]
    fn fallback_when_disconnected_after_two_attempts() {
        let m = monitor();
        m.increment_reconnect_attempts();
        m.increment_reconnect_attempts();
        assert!(m.should_fallback_to_polling());
    }

    #[test]
    fn no_fallback_when_healthy() {
        let m = monitor();
        m.update_connection(true, Strategy::Streaming);
        m.record_latency(Duration::ZERO);
        assert!(!m.should_fallback_to_polling());
    }

    #[test]
    fn fallback_on_high_latency() {
        let m = monitor();
        m.update_connection(true, Strategy::Streaming);
        m.record_latency(Duration::from_secs(6));
        assert!(m.should_fallback_to_polling());
    }

    #[test]
    fn fallback_on_attempts_even_if_connected() {
        let m = monitor();
        m.update_connection(true, Strategy::Streaming);
        m.increment_reconnect_attempts();
        assert!(!m.should_fallback_to_polling());
        m.increment_reconnect_attempts();
        assert!(m.should_fallback_to_polling());
    }

    #[test]
    fn reconnect_ceiling() {
        let m = monitor();
        for _ in 0..4 {
            m.increment_reconnect_attempts();
        }
        assert!(m.should_reconnect());
        m.increment_reconnect_attempts();
        assert!(!m.should_reconnect());
    }

    #[test]
    fn reconnect_transition_resets_attempts() {
        let m = monitor();
        m.increment_reconnect_attempts();
        m.increment_reconnect_attempts();
        m.update_connection(true, Strategy::Streaming);
        assert_eq!(m.snapshot().reconnect_attempts, 0);
        assert!(m.snapshot().last_heartbeat_at.is_some());
    }

    #[test]
    fn heartbeat_while_connected_keeps_attempts() {
        let m = monitor();
        m.update_connection(true, Strategy::Streaming);
        m.increment_reconnect_attempts();
        m.update_connection(true, Strategy::Streaming);
        assert_eq!(m.snapshot().reconnect_attempts, 1);
    }

    #[test]
    fn established_always_resets() {
        let m = monitor();
        m.update_connection(true, Strategy::Streaming);
        m.increment_reconnect_attempts();
        m.increment_reconnect_attempts();
        m.connection_established(Strategy::Polling);
        let health = m.snapshot();
        assert_eq!(health.reconnect_attempts, 0);
        assert_eq!(health.strategy, Strategy::Polling);
    }

    #[test]
    fn reset_attempts_reopens_the_ceiling() {
        let m = monitor();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        let _sub = m.on_health_change(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        for _ in 0..5 {
            m.increment_reconnect_attempts();
        }
        assert!(!m.should_reconnect());
        m.reset_attempts();
        assert!(m.should_reconnect());
        assert_eq!(m.snapshot().reconnect_attempts, 0);
        assert_eq!(hits.load(Ordering::SeqCst), 6);
    }

    #[test]
    fn delay_grows_with_attempts() {
        let m = monitor();
        let first = m.reconnect_delay();
        assert!(first >= Duration::from_secs(1) && first <= Duration::from_secs(2));
        for _ in 0..3 {
            m.increment_reconnect_attempts();
        }
        assert!(m.reconnect_delay() >= Duration::from_secs(8));
    }

    #[test]
    fn listeners_see_every_mutation() {
        let m = monitor();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = Arc::clone(&seen);
        let _sub = m.on_health_change(move |h| s.lock().unwrap().push(h.connected));

        m.update_connection(true, Strategy::Streaming);
        m.record_latency(Duration::from_millis(40));
        m.update_connection(false, Strategy::Streaming);
        assert_eq!(*seen.lock().unwrap(), vec![true, true, false]);
    }

    #[test]
    fn panicking_listener_does_not_block_others() {
        let m = monitor();
        let hits = Arc::new(AtomicUsize::new(0));
        let _bad = m.on_health_change(|_| panic!("listener bug"));
        let h = Arc::clone(&hits);
        let _good = m.on_health_change(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });

        m.update_connection(true, Strategy::Streaming);
        m.update_connection(true, Strategy::Streaming);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert!(m.snapshot().connected);
    }

    #[test]
    fn unsubscribed_listener_is_silent() {
        let m = monitor();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        let sub = m.on_health_change(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        m.set_strategy(Strategy::Polling);
        sub.unsubscribe();
        m.set_strategy(Strategy::Streaming);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn mark_disconnected_is_silent_when_down() {
        let m = monitor();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        let _sub = m.on_health_change(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        m.mark_disconnected();
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        m.update_connection(true, Strategy::Streaming);
        m.mark_disconnected();
        m.mark_disconnected();
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn staleness_marks_connection_down() {
        let m = monitor();
        m.update_connection(true, Strategy::Streaming);
        time::advance(Duration::from_secs(59)).await;
        assert!(!m.check_staleness());
        time::advance(Duration::from_secs(2)).await;
        assert!(m.check_staleness());
        assert!(!m.snapshot().connected);
    }

    #[tokio::test(start_paused = true)]
    async fn staleness_timer_runs_while_started() {
        let m = monitor();
        m.start();
        m.update_connection(true, Strategy::Streaming);
        time::sleep(Duration::from_secs(95)).await;
        assert!(!m.snapshot().connected);
        m.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn probe_timer_marks_connected_and_stops_cleanly() {
        let probe = Arc::new(CountingProbe {
            calls: AtomicUsize::new(0),
            healthy: AtomicBool::new(true),
        });
        let m = HealthMonitor::new(HealthConfig::default(), 5, Some(probe.clone()));

        m.start();
        m.start(); // no second set of timers
        time::sleep(Duration::from_secs(61)).await;
        // ticks at 0s, 30s, 60s
        assert_eq!(probe.calls.load(Ordering::SeqCst), 3);
        let health = m.snapshot();
        assert!(health.connected);
        assert_eq!(health.latency_ms, 12);

        m.stop();
        m.stop();
        assert!(!m.is_running());
        time::sleep(Duration::from_secs(120)).await;
        assert_eq!(probe.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn failing_probe_marks_disconnected() {
        let probe = Arc::new(CountingProbe {
            calls: AtomicUsize::new(0),
            healthy: AtomicBool::new(false),
        });
        let m = HealthMonitor::new(HealthConfig::default(), 5, Some(probe));
        m.update_connection(true, Strategy::Streaming);
        let result = m.probe_now().await.unwrap();
        assert!(result.is_err());
        assert!(!m.snapshot().connected);
    }

    #[tokio::test]
    async fn probe_now_without_probe() {
        assert!(monitor().probe_now().await.is_none());
    }
}
