//! Polling event source: one `GET` per interval, never more than one in
//! flight.

use std::time::Duration;

use reqwest::header::CACHE_CONTROL;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};

use livefeed_core::{AdapterState, DeliveryError, Event, EventSource, SignalSink, StateCell, Strategy};

use crate::transport_error;

/// Fetch one batch of events newer than `since`, in server order.
pub async fn fetch_events(
    http: &reqwest::Client,
    url: &str,
    subscriber_id: &str,
    since: u64,
    limit: u32,
) -> Result<Vec<Event>, DeliveryError> {
    let response = http
        .get(url)
        .query(&[
            ("subscriberId", subscriber_id.to_string()),
            ("since", since.to_string()),
            ("limit", limit.to_string()),
        ])
        .header(CACHE_CONTROL, "no-cache")
        .send()
        .await
        .map_err(transport_error)?;

    let status = response.status();
    if !status.is_success() {
        return Err(DeliveryError::from_status(status.as_u16(), url));
    }
    let body = response.bytes().await.map_err(transport_error)?;
    Ok(serde_json::from_slice(&body)?)
}

/// Polls the poll endpoint on a fixed interval.
pub struct PollingSource {
    http: reqwest::Client,
    url: String,
    subscriber_id: String,
    interval: Duration,
    limit: u32,
    state: StateCell,
    task: Option<JoinHandle<()>>,
}

impl PollingSource {
    pub fn new(
        http: reqwest::Client,
        url: impl Into<String>,
        subscriber_id: impl Into<String>,
        interval: Duration,
        limit: u32,
    ) -> Self {
        Self {
            http,
            url: url.into(),
            subscriber_id: subscriber_id.into(),
            interval,
            limit,
            state: StateCell::new(),
            task: None,
        }
    }
}

impl EventSource for PollingSource {
    fn strategy(&self) -> Strategy {
        Strategy::Polling
    }

    fn state(&self) -> AdapterState {
        self.state.get()
    }

    fn open(&mut self, since: u64, sink: SignalSink) -> Result<(), DeliveryError> {
        self.state.transition(AdapterState::Opening)?;
        self.state.transition(AdapterState::Open)?;
        sink.opened();
        tracing::debug!(url = %self.url, since, interval_ms = self.interval.as_millis() as u64, "polling started");
        self.task = Some(tokio::spawn(poll_loop(
            self.http.clone(),
            self.url.clone(),
            self.subscriber_id.clone(),
            self.interval,
            self.limit,
            since,
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

impl Drop for PollingSource {
    fn drop(&mut self) {
        self.close();
    }
}

#[allow(clippy::too_many_arguments)]
async fn poll_loop(
    http: reqwest::Client,
    url: String,
    subscriber_id: String,
    interval: Duration,
    limit: u32,
    mut since: u64,
    state: StateCell,
    sink: SignalSink,
) {
    let mut ticker = time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let started = Instant::now();
        match fetch_events(&http, &url, &subscriber_id, since, limit).await {
            Ok(events) => {
                sink.latency(started.elapsed());
                sink.connection(true);
                tracing::trace!(count = events.len(), since, "poll returned");
                for event in events {
                    since = since.max(event.timestamp);
                    if !sink.event(event) {
                        return;
                    }
                }
            }
            Err(err) if err.is_terminal() => {
                if state.transition(AdapterState::Failed).is_ok() {
                    sink.connection(false);
                    sink.failed(err);
                    let _ = state.transition(AdapterState::Idle);
                }
                return;
            }
            Err(err) => {
                tracing::debug!(error = %err, "poll failed");
                sink.connection(false);
                sink.error(err);
            }
        }
        if sink.is_closed() {
            return;
        }
    }
}
