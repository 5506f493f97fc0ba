//! Builds HTTP event sources from a [`ClientConfig`].

use std::sync::Arc;

use livefeed_core::{ClientConfig, DeliveryError, Event, EventSource, SourceConnector, Strategy};

use crate::poll::{fetch_events, PollingSource};
use crate::probe::HttpHealthProbe;
use crate::stream::StreamingSource;

/// [`SourceConnector`] for the HTTP streaming and polling endpoints.
pub struct HttpConnector {
    config: Arc<ClientConfig>,
    /// No overall timeout: the stream is long-lived.
    stream_http: reqwest::Client,
    /// Bounded by `request_timeout`; shared by polling and the probe.
    request_http: reqwest::Client,
}

impl HttpConnector {
    pub fn new(config: &ClientConfig) -> Result<Self, DeliveryError> {
        let stream_http = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|e| DeliveryError::Config(format!("failed to build HTTP client: {e}")))?;
        let request_http = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| DeliveryError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            config: Arc::new(config.clone()),
            stream_http,
            request_http,
        })
    }

    /// Probe for the configured health endpoint.
    pub fn probe(&self) -> HttpHealthProbe {
        HttpHealthProbe::new(self.request_http.clone(), self.config.health_url.clone())
    }

    /// One request against the configured poll endpoint.
    pub async fn poll_once(&self, since: u64, limit: u32) -> Result<Vec<Event>, DeliveryError> {
        fetch_events(
            &self.request_http,
            &self.config.poll_url,
            &self.config.subscriber_id,
            since,
            limit,
        )
        .await
    }
}

impl SourceConnector for HttpConnector {
    fn create(&self, strategy: Strategy) -> Box<dyn EventSource> {
        let config = &self.config;
        match strategy {
            Strategy::Streaming => Box::new(StreamingSource::new(
                self.stream_http.clone(),
                config.stream_url.clone(),
                config.subscriber_id.clone(),
                config.health.heartbeat_interval * 2,
            )),
            Strategy::Polling => Box::new(PollingSource::new(
                self.request_http.clone(),
                config.poll_url.clone(),
                config.subscriber_id.clone(),
                config.poll_interval,
                config.poll_limit,
            )),
        }
    }
}
