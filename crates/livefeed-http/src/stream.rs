//! Streaming event source: one long-lived `GET` whose body carries frames.

use std::time::Duration;

use futures::StreamExt;
use reqwest::header::ACCEPT;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};

use livefeed_core::{AdapterState, DeliveryError, EventSource, SignalSink, StateCell, Strategy};

use crate::frame::{parse_line, Frame, LineDecoder};
use crate::transport_error;

/// Reads events from the streaming endpoint.
///
/// Reports a failure and stops on any transport error; reconnecting is the
/// client's decision.
pub struct StreamingSource {
    http: reqwest::Client,
    url: String,
    subscriber_id: String,
    idle_timeout: Duration,
    state: StateCell,
    task: Option<JoinHandle<()>>,
}

impl StreamingSource {
    /// `idle_timeout` bounds the silence between two chunks; the server
    /// heartbeats well inside it.
    pub fn new(
        http: reqwest::Client,
        url: impl Into<String>,
        subscriber_id: impl Into<String>,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            http,
            url: url.into(),
            subscriber_id: subscriber_id.into(),
            idle_timeout,
            state: StateCell::new(),
            task: None,
        }
    }
}

impl EventSource for StreamingSource {
    fn strategy(&self) -> Strategy {
        Strategy::Streaming
    }

    fn state(&self) -> AdapterState {
        self.state.get()
    }

    fn open(&mut self, since: u64, sink: SignalSink) -> Result<(), DeliveryError> {
        self.state.transition(AdapterState::Opening)?;
        let request = self
            .http
            .get(&self.url)
            .query(&[("subscriberId", self.subscriber_id.clone()), ("since", since.to_string())])
            .header(ACCEPT, "text/event-stream");
        tracing::debug!(url = %self.url, since, "opening stream");
        self.task = Some(tokio::spawn(read_stream(
            request,
            self.url.clone(),
            self.idle_timeout,
            self.state.clone(),
            sink,
        )));
        Ok(())
    }

    fn close(&mut self) {
        if let Some(task) = self.task.take() {
            let _ = self.state.transition(AdapterState::Closing);
            task.abort();
        }
        self.state.settle_idle();
    }
}

impl Drop for StreamingSource {
    fn drop(&mut self) {
        self.close();
    }
}

async fn read_stream(
    request: reqwest::RequestBuilder,
    url: String,
    idle_timeout: Duration,
    state: StateCell,
    sink: SignalSink,
) {
    let started = Instant::now();
    let response = match request.send().await {
        Ok(response) => response,
        Err(e) => return fail(&state, &sink, transport_error(e), false),
    };
    let status = response.status();
    if !status.is_success() {
        return fail(&state, &sink, DeliveryError::from_status(status.as_u16(), url), false);
    }
    if state.transition(AdapterState::Open).is_err() {
        // closed while the request was in flight
        return;
    }
    sink.latency(started.elapsed());
    sink.opened();

    let mut body = response.bytes_stream();
    let mut decoder = LineDecoder::new();
    let err = loop {
        let chunk = match time::timeout(idle_timeout, body.next()).await {
            Ok(Some(Ok(chunk))) => chunk,
            Ok(Some(Err(e))) => break DeliveryError::Stream(e.to_string()),
            Ok(None) => break DeliveryError::Stream("stream ended by server".into()),
            Err(_) => {
                break DeliveryError::Timeout {
                    ms: idle_timeout.as_millis() as u64,
                }
            }
        };
        let lines = match decoder.push(&chunk) {
            Ok(lines) => lines,
            Err(e) => break e,
        };
        for line in lines {
            let delivered = match parse_line(&line) {
                Ok(Some(Frame::Data(event))) => sink.event(event),
                Ok(Some(Frame::Ack | Frame::Heartbeat)) => sink.heartbeat(),
                Ok(None) => true,
                Err(e) => {
                    tracing::debug!(error = %e, "skipping malformed frame");
                    sink.error(e)
                }
            };
            if !delivered {
                return;
            }
        }
    };
    fail(&state, &sink, err, true);
}

fn fail(state: &StateCell, sink: &SignalSink, err: DeliveryError, was_open: bool) {
    if state.transition(AdapterState::Failed).is_err() {
        return;
    }
    tracing::debug!(error = %err, was_open, "stream failed");
    if was_open {
        sink.connection(false);
    }
    sink.failed(err);
    let _ = state.transition(AdapterState::Idle);
}
