//! The delivery client.
//!
//! Owns the watermark, the subscriber registry and the choice of transport.
//! All state changes happen on one background driver task that drains the
//! signals of the active [`EventSource`] and the health monitor's change
//! notifications:
//!
//! ```text
//! EventSource ──Signal──┐
//!                       ├──► driver ──► watermark / dedup ──► handlers
//! HealthMonitor ──ping──┘        └────► failover / recovery ──► swap source
//! ```
//!
//! Every source is opened with a fresh generation number. Swapping or
//! closing a source bumps the generation, so anything the old source still
//! had in flight is dropped unobserved; since the watermark only moves on
//! delivered events, the next source re-requests it.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};

use crate::config::ClientConfig;
use crate::error::DeliveryError;
use crate::event::{DedupWindow, Event, SharedWatermark};
use crate::health::{ConnectionHealth, HealthMonitor, HealthProbe, Strategy};
use crate::policy::{failover, FailoverDecision};
use crate::registry::{lock, HandlerError, ListenerSet, SubscriberRegistry, Subscription};
use crate::source::{EventSource, Signal, SignalKind, SignalSink, SourceConnector};

type ErrorObserver = dyn Fn(&DeliveryError) + Send + Sync;
type ConnectionObserver = dyn Fn(bool) + Send + Sync;

#[derive(Clone)]
struct Observers {
    errors: ListenerSet<ErrorObserver>,
    connections: ListenerSet<ConnectionObserver>,
}

impl Observers {
    fn new() -> Self {
        Self {
            errors: ListenerSet::new(),
            connections: ListenerSet::new(),
        }
    }

    fn error(&self, err: &DeliveryError) {
        for observer in self.errors.snapshot() {
            if catch_unwind(AssertUnwindSafe(|| observer(err))).is_err() {
                tracing::error!("error observer panicked");
            }
        }
    }

    fn connection(&self, connected: bool) {
        for observer in self.connections.snapshot() {
            if catch_unwind(AssertUnwindSafe(|| observer(connected))).is_err() {
                tracing::error!("connection observer panicked");
            }
        }
    }
}

/// Per-`connect()` bookkeeping shared by the handle and the driver.
#[derive(Default)]
struct Session {
    active: bool,
    driver: Option<JoinHandle<()>>,
    health_sub: Option<Subscription>,
    /// Last connectivity value passed to `on_connection` observers.
    reported_connected: bool,
}

/// Resilient single-subscriber event delivery.
///
/// ```rust,no_run
/// # use std::sync::Arc;
/// # use livefeed_core::{ClientConfig, DeliveryClient, SourceConnector};
/// # async fn demo(connector: Arc<dyn SourceConnector>) -> Result<(), livefeed_core::DeliveryError> {
/// let client = DeliveryClient::new(
///     ClientConfig::new("https://api.example.com", "acct-42"),
///     connector,
///     None,
/// )?;
/// let _sub = client.on("staking.reward", |event| {
///     println!("{}", event.payload);
///     Ok(())
/// });
/// client.connect();
/// // ...
/// client.disconnect().await;
/// # Ok(())
/// # }
/// ```
pub struct DeliveryClient {
    config: Arc<ClientConfig>,
    connector: Arc<dyn SourceConnector>,
    monitor: HealthMonitor,
    registry: SubscriberRegistry,
    observers: Observers,
    watermark: SharedWatermark,
    dedup: Arc<Mutex<DedupWindow>>,
    session: Arc<Mutex<Session>>,
}

impl DeliveryClient {
    /// Build a disconnected client. `probe` drives the monitor's active
    /// health checks; without one only transport signals and staleness count.
    pub fn new(
        config: ClientConfig,
        connector: Arc<dyn SourceConnector>,
        probe: Option<Arc<dyn HealthProbe>>,
    ) -> Result<Self, DeliveryError> {
        config.validate()?;
        let monitor = HealthMonitor::new(config.health.clone(), config.max_reconnect_attempts, probe);
        Ok(Self {
            dedup: Arc::new(Mutex::new(DedupWindow::new(config.dedup_window))),
            config: Arc::new(config),
            connector,
            monitor,
            registry: SubscriberRegistry::new(),
            observers: Observers::new(),
            watermark: SharedWatermark::new(0),
            session: Arc::new(Mutex::new(Session::default())),
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Start from a previously persisted watermark. Never moves it back.
    pub fn resume_from(&self, watermark: u64) {
        self.watermark.observe(watermark);
    }

    /// Highest event timestamp observed so far.
    pub fn watermark(&self) -> u64 {
        self.watermark.get()
    }

    pub fn connection_health(&self) -> ConnectionHealth {
        self.monitor.snapshot()
    }

    pub fn current_strategy(&self) -> Strategy {
        self.monitor.snapshot().strategy
    }

    pub fn health_monitor(&self) -> &HealthMonitor {
        &self.monitor
    }

    /// Returns `true` between `connect()` and `disconnect()` (or a terminal
    /// failure).
    pub fn is_active(&self) -> bool {
        lock(&self.session).active
    }

    /// Register `handler` for `event_type`; `"*"` receives every event after
    /// the type-specific handlers.
    pub fn on<F>(&self, event_type: &str, handler: F) -> Subscription
    where
        F: Fn(&Event) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.registry.register(event_type, handler)
    }

    /// Observe transport errors, handler failures and terminal failures.
    pub fn on_error<F>(&self, observer: F) -> Subscription
    where
        F: Fn(&DeliveryError) + Send + Sync + 'static,
    {
        self.observers.errors.insert(Arc::new(observer))
    }

    /// Observe connectivity transitions.
    pub fn on_connection<F>(&self, observer: F) -> Subscription
    where
        F: Fn(bool) + Send + Sync + 'static,
    {
        self.observers.connections.insert(Arc::new(observer))
    }

    /// Start the monitor and open the streaming source at the current
    /// watermark. No-op while already active.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn connect(&self) {
        let mut session = lock(&self.session);
        if session.active {
            tracing::debug!("connect ignored, client already active");
            return;
        }
        // left behind by a session that ended on a terminal failure
        if let Some(finished) = session.driver.take() {
            finished.abort();
        }
        session.active = true;

        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let (health_tx, health_rx) = watch::channel(());
        session.health_sub = Some(self.monitor.on_health_change(move |_| {
            health_tx.send_replace(());
        }));
        self.monitor.reset_attempts();
        self.monitor.start();

        tracing::info!(
            subscriber_id = %self.config.subscriber_id,
            watermark = self.watermark.get(),
            "connecting"
        );

        let driver = Driver {
            config: Arc::clone(&self.config),
            connector: Arc::clone(&self.connector),
            monitor: self.monitor.clone(),
            registry: self.registry.clone(),
            observers: self.observers.clone(),
            watermark: self.watermark.clone(),
            dedup: Arc::clone(&self.dedup),
            session: Arc::clone(&self.session),
            signal_tx,
            generation: 0,
            source: None,
            strategy: Strategy::Streaming,
            polling_since: None,
            polling_confirmed: false,
            retry: None,
            finished: false,
        };
        session.driver = Some(tokio::spawn(driver.run(signal_rx, health_rx)));
    }

    /// Stop the monitor and the active source.
    ///
    /// Once this returns no handler or observer is invoked again until the
    /// next `connect()`. Subscriptions stay registered. Safe to call at any
    /// point, any number of times.
    pub async fn disconnect(&self) {
        let (driver, health_sub) = {
            let mut session = lock(&self.session);
            if !session.active {
                return;
            }
            session.active = false;
            (session.driver.take(), session.health_sub.take())
        };
        if let Some(sub) = health_sub {
            sub.unsubscribe();
        }
        self.monitor.stop();
        if let Some(driver) = driver {
            driver.abort();
            // wait until the driver (and the source it owns) is dropped
            let _ = driver.await;
        }
        self.monitor.mark_disconnected();

        let was_connected = std::mem::take(&mut lock(&self.session).reported_connected);
        if was_connected {
            self.observers.connection(false);
        }
        tracing::info!(watermark = self.watermark.get(), "disconnected");
    }
}

impl Drop for DeliveryClient {
    fn drop(&mut self) {
        let mut session = lock(&self.session);
        session.active = false;
        if let Some(driver) = session.driver.take() {
            driver.abort();
        }
        if let Some(sub) = session.health_sub.take() {
            sub.unsubscribe();
        }
        drop(session);
        self.monitor.stop();
    }
}

/// The single task that mutates delivery state.
struct Driver {
    config: Arc<ClientConfig>,
    connector: Arc<dyn SourceConnector>,
    monitor: HealthMonitor,
    registry: SubscriberRegistry,
    observers: Observers,
    watermark: SharedWatermark,
    dedup: Arc<Mutex<DedupWindow>>,
    session: Arc<Mutex<Session>>,
    signal_tx: mpsc::UnboundedSender<Signal>,
    generation: u64,
    source: Option<Box<dyn EventSource>>,
    strategy: Strategy,
    polling_since: Option<Instant>,
    /// Set once the current polling source had its first successful poll.
    polling_confirmed: bool,
    retry: Option<(Instant, Strategy)>,
    finished: bool,
}

impl Driver {
    async fn run(
        mut self,
        mut signals: mpsc::UnboundedReceiver<Signal>,
        mut health: watch::Receiver<()>,
    ) {
        self.switch_to(Strategy::Streaming);
        while !self.finished {
            let retry_at = self.retry.map(|(at, _)| at);
            tokio::select! {
                biased;
                Some(signal) = signals.recv() => self.on_signal(signal),
                Ok(()) = health.changed() => self.on_health(),
                _ = time::sleep_until(retry_at.unwrap_or_else(Instant::now)), if retry_at.is_some() => {
                    if let Some((_, strategy)) = self.retry.take() {
                        self.switch_to(strategy);
                    }
                }
                else => break,
            }
        }
    }

    fn on_signal(&mut self, signal: Signal) {
        if signal.generation != self.generation {
            tracing::trace!(
                generation = signal.generation,
                current = self.generation,
                "dropping stale signal"
            );
            return;
        }
        let strategy = signal.strategy;
        match signal.kind {
            SignalKind::Opened => {
                tracing::info!(%strategy, since = self.watermark.get(), "event source open");
                if strategy == Strategy::Streaming {
                    self.monitor.connection_established(strategy);
                }
            }
            SignalKind::Event(event) => self.intake(event),
            SignalKind::Heartbeat => self.monitor.update_connection(true, strategy),
            SignalKind::Connection(true)
                if strategy == Strategy::Polling && !self.polling_confirmed =>
            {
                self.polling_confirmed = true;
                self.monitor.connection_established(strategy);
            }
            SignalKind::Connection(connected) => self.monitor.update_connection(connected, strategy),
            SignalKind::Latency(rtt) => self.monitor.record_latency(rtt),
            SignalKind::Error(err) => {
                tracing::warn!(%strategy, error = %err, "event source error");
                self.observers.error(&err);
            }
            SignalKind::Failed(err) => self.on_failure(strategy, err),
        }
    }

    /// Watermark first, then duplicate check, then type-specific and
    /// wildcard handlers. A failing handler never stops the others.
    fn intake(&mut self, event: Event) {
        self.watermark.observe(event.timestamp);
        if !lock(&self.dedup).admit(&event.id) {
            tracing::debug!(id = %event.id, "dropping duplicate event");
            return;
        }
        for handler in self.registry.handlers_for(&event.kind) {
            let message = match catch_unwind(AssertUnwindSafe(|| handler(&event))) {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => e.to_string(),
                Err(panic) => panic_message(&*panic),
            };
            let err = DeliveryError::Handler {
                event_type: event.kind.clone(),
                message,
            };
            tracing::warn!(id = %event.id, error = %err, "handler failed");
            self.observers.error(&err);
        }
    }

    fn on_failure(&mut self, strategy: Strategy, err: DeliveryError) {
        tracing::warn!(%strategy, error = %err, "event source failed");
        self.close_source();
        self.observers.error(&err);
        if err.is_terminal() {
            self.finish(None);
            return;
        }

        if strategy == Strategy::Polling {
            // nothing to fall back to; reopen polling after a pause
            let delay = self.monitor.reconnect_delay();
            self.retry = Some((Instant::now() + delay, Strategy::Polling));
            return;
        }

        match failover::decide(&self.monitor) {
            FailoverDecision::GiveUp { attempts } => {
                self.finish(Some(DeliveryError::Exhausted { attempts }));
            }
            FailoverDecision::FallBackToPolling => {
                tracing::warn!(
                    attempts = self.monitor.snapshot().reconnect_attempts,
                    watermark = self.watermark.get(),
                    "falling back to polling"
                );
                self.switch_to(Strategy::Polling);
            }
            FailoverDecision::RetryStreaming(delay) => {
                tracing::info!(delay_ms = delay.as_millis() as u64, "retrying stream");
                self.retry = Some((Instant::now() + delay, Strategy::Streaming));
            }
        }
    }

    fn on_health(&mut self) {
        let health = self.monitor.snapshot();
        let changed = {
            let mut session = lock(&self.session);
            if !session.active {
                return;
            }
            let changed = session.reported_connected != health.connected;
            session.reported_connected = health.connected;
            changed
        };
        if changed {
            tracing::info!(
                connected = health.connected,
                strategy = %health.strategy,
                "connectivity changed"
            );
            self.observers.connection(health.connected);
        }

        let dwelled = self
            .polling_since
            .is_some_and(|since| since.elapsed() >= self.config.recovery_dwell);
        if self.strategy == Strategy::Polling
            && self.retry.is_none()
            && dwelled
            && health.connected
            && !self.monitor.should_fallback_to_polling()
        {
            tracing::info!(watermark = self.watermark.get(), "connection healthy, upgrading to streaming");
            self.switch_to(Strategy::Streaming);
        }
    }

    fn switch_to(&mut self, strategy: Strategy) {
        self.close_source();
        self.retry = None;
        self.strategy = strategy;
        match strategy {
            Strategy::Polling => {
                self.polling_since = Some(Instant::now());
                self.polling_confirmed = false;
            }
            Strategy::Streaming => self.polling_since = None,
        }
        self.monitor.set_strategy(strategy);

        let since = self.watermark.get();
        let sink = SignalSink::new(self.generation, strategy, self.signal_tx.clone());
        let mut source = self.connector.create(strategy);
        tracing::info!(%strategy, since, generation = self.generation, "opening event source");
        match source.open(since, sink.clone()) {
            Ok(()) => self.source = Some(source),
            Err(err) => {
                sink.failed(err);
            }
        }
    }

    fn close_source(&mut self) {
        self.generation += 1;
        if let Some(mut source) = self.source.take() {
            source.close();
        }
    }

    /// Terminal stop: the caller must `connect()` again.
    fn finish(&mut self, err: Option<DeliveryError>) {
        if let Some(err) = err {
            tracing::error!(error = %err, "giving up on delivery");
            self.observers.error(&err);
        }
        self.finished = true;
        self.retry = None;
        self.close_source();
        self.monitor.stop();

        let (health_sub, was_connected) = {
            let mut session = lock(&self.session);
            session.active = false;
            (
                session.health_sub.take(),
                std::mem::take(&mut session.reported_connected),
            )
        };
        if let Some(sub) = health_sub {
            sub.unsubscribe();
        }
        self.monitor.mark_disconnected();
        if was_connected {
            self.observers.connection(false);
        }
    }
}

impl Drop for Driver {
    fn drop(&mut self) {
        self.close_source();
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "handler panicked".to_string()
    }
}
