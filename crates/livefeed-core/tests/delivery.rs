//! End-to-end delivery behaviour against a scripted in-process transport.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use livefeed_core::{
    AdapterState, ClientConfig, DeliveryClient, DeliveryError, Event, EventLog, EventSource,
    MemoryEventLog, SignalSink, SourceConnector, StateCell, Strategy,
};
use serde_json::json;

const SUB: &str = "acct-1";

/// How the next streaming open behaves.
enum Script {
    /// The connection attempt fails before any event.
    FailOpen,
    /// The server answers with this HTTP status.
    Reject(u16),
    /// Serve up to `take` logged events newer than `since`, then drop the
    /// connection if `then_drop`.
    Serve { take: usize, then_drop: bool },
    /// Open and push exactly these events.
    Push(Vec<Event>),
}

#[derive(Default)]
struct Fixture {
    log: MemoryEventLog,
    streams: Mutex<VecDeque<Script>>,
    opens: Mutex<Vec<(Strategy, u64)>>,
    sinks: Mutex<Vec<SignalSink>>,
}

impl Fixture {
    fn with_log(timestamps: impl IntoIterator<Item = u64>) -> Arc<Self> {
        let fixture = Self::default();
        for ts in timestamps {
            fixture
                .log
                .append(SUB, Event::new(format!("e{ts}"), "staking", json!({ "n": ts }), ts));
        }
        Arc::new(fixture)
    }

    fn empty() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn script(&self, scripts: impl IntoIterator<Item = Script>) {
        self.streams.lock().unwrap().extend(scripts);
    }

    fn opens(&self) -> Vec<(Strategy, u64)> {
        self.opens.lock().unwrap().clone()
    }

    fn strategies(&self) -> Vec<Strategy> {
        self.opens().into_iter().map(|(s, _)| s).collect()
    }
}

struct ScriptedConnector(Arc<Fixture>);

impl SourceConnector for ScriptedConnector {
    fn create(&self, strategy: Strategy) -> Box<dyn EventSource> {
        Box::new(ScriptedSource {
            fixture: Arc::clone(&self.0),
            strategy,
            state: StateCell::new(),
        })
    }
}

struct ScriptedSource {
    fixture: Arc<Fixture>,
    strategy: Strategy,
    state: StateCell,
}

impl ScriptedSource {
    fn fail(&self, sink: &SignalSink, err: DeliveryError) -> Result<(), DeliveryError> {
        self.state.transition(AdapterState::Failed)?;
        sink.failed(err);
        self.state.transition(AdapterState::Idle)
    }
}

impl EventSource for ScriptedSource {
    fn strategy(&self) -> Strategy {
        self.strategy
    }

    fn state(&self) -> AdapterState {
        self.state.get()
    }

    fn open(&mut self, since: u64, sink: SignalSink) -> Result<(), DeliveryError> {
        self.state.transition(AdapterState::Opening)?;
        self.fixture.opens.lock().unwrap().push((self.strategy, since));
        self.fixture.sinks.lock().unwrap().push(sink.clone());

        if self.strategy == Strategy::Polling {
            self.state.transition(AdapterState::Open)?;
            sink.opened();
            sink.latency(Duration::from_millis(5));
            sink.connection(true);
            for event in self.fixture.log.events_since(SUB, since) {
                sink.event(event);
            }
            return Ok(());
        }

        let script = self
            .fixture
            .streams
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Script::Serve {
                take: usize::MAX,
                then_drop: false,
            });
        match script {
            Script::FailOpen => self.fail(&sink, DeliveryError::Stream("connection refused".into())),
            Script::Reject(status) => self.fail(&sink, DeliveryError::from_status(status, "/realtime/stream")),
            Script::Serve { take, then_drop } => {
                self.state.transition(AdapterState::Open)?;
                sink.opened();
                for event in self.fixture.log.events_since(SUB, since).into_iter().take(take) {
                    sink.event(event);
                }
                if then_drop {
                    sink.connection(false);
                    self.fail(&sink, DeliveryError::Stream("closed by server".into()))?;
                }
                Ok(())
            }
            Script::Push(events) => {
                self.state.transition(AdapterState::Open)?;
                sink.opened();
                for event in events {
                    sink.event(event);
                }
                Ok(())
            }
        }
    }

    fn close(&mut self) {
        self.state.settle_idle();
    }
}

fn config() -> ClientConfig {
    let mut config = ClientConfig::new("http://feed.test", SUB);
    config.health.heartbeat_interval = Duration::from_secs(3600);
    config.recovery_dwell = Duration::from_secs(3600);
    config
}

fn client(fixture: &Arc<Fixture>, config: ClientConfig) -> DeliveryClient {
    DeliveryClient::new(config, Arc::new(ScriptedConnector(Arc::clone(fixture))), None).unwrap()
}

fn collect_timestamps(client: &DeliveryClient) -> Arc<Mutex<Vec<u64>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let s = Arc::clone(&seen);
    client.on("*", move |event: &Event| {
        s.lock().unwrap().push(event.timestamp);
        Ok(())
    });
    seen
}

fn collect_errors(client: &DeliveryClient) -> Arc<Mutex<Vec<String>>> {
    let errors = Arc::new(Mutex::new(Vec::new()));
    let e = Arc::clone(&errors);
    client.on_error(move |err: &DeliveryError| e.lock().unwrap().push(err.to_string()));
    errors
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

#[tokio::test(start_paused = true)]
async fn second_open_failure_falls_back_to_polling() {
    let fixture = Fixture::empty();
    fixture.script([Script::FailOpen, Script::FailOpen, Script::FailOpen]);
    let client = client(&fixture, config());
    // a probe already saw the server reachable
    client.health_monitor().update_connection(true, Strategy::Streaming);

    client.connect();
    tokio::time::sleep(Duration::from_secs(60)).await;

    assert_eq!(
        fixture.strategies(),
        vec![Strategy::Streaming, Strategy::Streaming, Strategy::Polling]
    );
    assert_eq!(client.current_strategy(), Strategy::Polling);
    let health = client.connection_health();
    assert!(health.connected);
    assert_eq!(health.reconnect_attempts, 0);
    client.disconnect().await;
}

#[tokio::test(start_paused = true)]
async fn fallback_resumes_from_watermark_without_gaps() {
    let fixture = Fixture::with_log(1..=6);
    fixture.script([Script::Serve { take: 3, then_drop: true }]);
    let client = client(&fixture, config());
    let seen = collect_timestamps(&client);

    client.connect();
    settle().await;

    assert_eq!(fixture.opens(), vec![(Strategy::Streaming, 0), (Strategy::Polling, 3)]);
    assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3, 4, 5, 6]);
    assert_eq!(client.watermark(), 6);
    client.disconnect().await;
}

#[tokio::test(start_paused = true)]
async fn healthy_polling_upgrades_back_to_streaming() {
    let fixture = Fixture::with_log(1..=4);
    fixture.script([Script::Serve { take: 2, then_drop: true }]);
    let mut config = config();
    config.recovery_dwell = Duration::ZERO;
    let client = client(&fixture, config);
    let seen = collect_timestamps(&client);

    client.connect();
    settle().await;

    assert_eq!(
        fixture.opens(),
        vec![
            (Strategy::Streaming, 0),
            (Strategy::Polling, 2),
            (Strategy::Streaming, 4)
        ]
    );
    assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3, 4]);
    assert_eq!(client.current_strategy(), Strategy::Streaming);
    client.disconnect().await;
}

#[tokio::test(start_paused = true)]
async fn polling_waits_out_recovery_dwell() {
    let fixture = Fixture::empty();
    fixture.script([Script::FailOpen, Script::FailOpen]);
    let client = client(&fixture, config());

    client.connect();
    tokio::time::sleep(Duration::from_secs(120)).await;

    // the single poll confirmed connectivity, but the dwell has not passed
    assert_eq!(fixture.strategies(), vec![Strategy::Streaming, Strategy::Polling]);
    assert_eq!(client.current_strategy(), Strategy::Polling);
    client.disconnect().await;
}

#[tokio::test(start_paused = true)]
async fn connect_and_disconnect_are_idempotent() {
    let fixture = Fixture::empty();
    let client = client(&fixture, config());
    let transitions = Arc::new(Mutex::new(Vec::new()));
    let t = Arc::clone(&transitions);
    client.on_connection(move |connected| t.lock().unwrap().push(connected));

    client.disconnect().await;
    client.connect();
    client.connect();
    settle().await;
    assert!(client.is_active());
    assert_eq!(fixture.opens().len(), 1);

    client.disconnect().await;
    client.disconnect().await;
    assert!(!client.is_active());
    assert!(!client.connection_health().connected);
    assert_eq!(*transitions.lock().unwrap(), vec![true, false]);
}

#[tokio::test(start_paused = true)]
async fn nothing_is_delivered_after_disconnect() {
    let fixture = Fixture::empty();
    let client = client(&fixture, config());
    let seen = collect_timestamps(&client);

    client.connect();
    settle().await;
    client.disconnect().await;

    let stale = fixture.sinks.lock().unwrap()[0].clone();
    assert!(!stale.event(Event::new("late", "staking", json!(null), 99)));
    settle().await;
    assert!(seen.lock().unwrap().is_empty());
    assert_eq!(client.watermark(), 0);

    // registrations survive a reconnect
    client.connect();
    settle().await;
    let fresh = fixture.sinks.lock().unwrap()[1].clone();
    assert!(fresh.event(Event::new("e7", "staking", json!(null), 7)));
    settle().await;
    assert_eq!(*seen.lock().unwrap(), vec![7]);
    client.disconnect().await;
}

#[tokio::test(start_paused = true)]
async fn failing_handler_does_not_block_others() {
    let fixture = Fixture::with_log([1, 2]);
    let client = client(&fixture, config());
    let errors = collect_errors(&client);
    client.on("staking", |_: &Event| -> Result<(), livefeed_core::HandlerError> {
        panic!("handler bug")
    });
    client.on("staking", |_: &Event| Err("rejected".into()));
    let seen = collect_timestamps(&client);

    client.connect();
    settle().await;

    assert_eq!(*seen.lock().unwrap(), vec![1, 2]);
    let errors = errors.lock().unwrap().clone();
    assert_eq!(errors.len(), 4);
    assert!(errors.iter().all(|e| e.starts_with("handler for `staking` failed")));
    assert!(errors.iter().any(|e| e.ends_with("handler bug")));
    assert!(errors.iter().any(|e| e.ends_with("rejected")));
    client.disconnect().await;
}

#[tokio::test(start_paused = true)]
async fn rejected_stream_is_terminal() {
    let fixture = Fixture::empty();
    fixture.script([Script::Reject(401)]);
    let client = client(&fixture, config());
    let errors = collect_errors(&client);

    client.connect();
    tokio::time::sleep(Duration::from_secs(60)).await;

    assert_eq!(fixture.opens().len(), 1);
    assert!(!client.is_active());
    assert_eq!(
        *errors.lock().unwrap(),
        vec!["rejected by /realtime/stream with HTTP 401".to_string()]
    );
}

#[tokio::test(start_paused = true)]
async fn gives_up_after_attempt_ceiling() {
    let fixture = Fixture::empty();
    fixture.script([Script::FailOpen, Script::FailOpen, Script::FailOpen]);
    let mut config = config();
    config.max_reconnect_attempts = 2;
    config.health.fallback_after_attempts = 10;
    let client = client(&fixture, config);
    client.health_monitor().update_connection(true, Strategy::Streaming);
    let errors = collect_errors(&client);

    client.connect();
    tokio::time::sleep(Duration::from_secs(120)).await;

    assert_eq!(fixture.strategies(), vec![Strategy::Streaming; 3]);
    assert!(!client.is_active());
    assert!(!client.connection_health().connected);
    assert_eq!(
        errors.lock().unwrap().last().map(String::as_str),
        Some("gave up after 2 reconnect attempts")
    );

    // a fresh connect starts over
    client.connect();
    settle().await;
    assert_eq!(fixture.opens().len(), 4);
    assert_eq!(client.connection_health().reconnect_attempts, 0);
    client.disconnect().await;
}

#[tokio::test(start_paused = true)]
async fn fresh_session_gets_its_own_attempts() {
    let fixture = Fixture::empty();
    fixture.script([Script::FailOpen, Script::FailOpen, Script::FailOpen]);
    let mut config = config();
    config.max_reconnect_attempts = 2;
    config.health.fallback_after_attempts = 10;
    let client = client(&fixture, config);
    client.health_monitor().update_connection(true, Strategy::Streaming);

    client.connect();
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert!(!client.is_active());
    assert_eq!(client.connection_health().reconnect_attempts, 2);

    // the new session's first open fails too
    fixture.script([Script::FailOpen]);
    client.health_monitor().update_connection(true, Strategy::Streaming);
    client.connect();
    settle().await;
    assert!(client.is_active());
    assert_eq!(fixture.opens().len(), 4);
    assert_eq!(client.connection_health().reconnect_attempts, 1);

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert!(client.is_active());
    assert_eq!(fixture.strategies(), vec![Strategy::Streaming; 5]);
    assert_eq!(client.connection_health().reconnect_attempts, 0);
    client.disconnect().await;
}

#[tokio::test(start_paused = true)]
async fn disconnect_cancels_pending_retry() {
    let fixture = Fixture::empty();
    fixture.script([Script::FailOpen]);
    let client = client(&fixture, config());
    client.health_monitor().update_connection(true, Strategy::Streaming);
    let errors = collect_errors(&client);
    let transitions = Arc::new(Mutex::new(Vec::new()));
    let t = Arc::clone(&transitions);
    client.on_connection(move |connected| t.lock().unwrap().push(connected));

    client.connect();
    settle().await;
    assert_eq!(fixture.opens().len(), 1);
    assert_eq!(client.connection_health().reconnect_attempts, 1);

    client.disconnect().await;
    let errors_at_disconnect = errors.lock().unwrap().len();
    let transitions_at_disconnect = transitions.lock().unwrap().len();

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(fixture.opens().len(), 1);
    assert!(!client.is_active());
    assert_eq!(errors.lock().unwrap().len(), errors_at_disconnect);
    assert_eq!(transitions.lock().unwrap().len(), transitions_at_disconnect);
}

#[tokio::test(start_paused = true)]
async fn watermark_only_moves_forward() {
    let fixture = Fixture::empty();
    fixture.script([Script::Push(vec![
        Event::new("a", "staking", json!(null), 150),
        Event::new("b", "staking", json!(null), 120),
        Event::new("a", "staking", json!(null), 160),
    ])]);
    let client = client(&fixture, config());
    client.resume_from(100);
    client.resume_from(50);
    let seen = collect_timestamps(&client);

    client.connect();
    settle().await;

    assert_eq!(fixture.opens(), vec![(Strategy::Streaming, 100)]);
    // the repeated id is dropped but still advances the watermark
    assert_eq!(*seen.lock().unwrap(), vec![150, 120]);
    assert_eq!(client.watermark(), 160);

    client.disconnect().await;
    assert_eq!(client.watermark(), 160);
}
