//! Client and health-monitor configuration.
//!
//! Durations are written in milliseconds when (de)serialized, under
//! `*_ms` keys:
//!
//! ```json
//! {
//!   "stream_url": "https://api.example.com/realtime/stream",
//!   "poll_url": "https://api.example.com/realtime/poll",
//!   "health_url": "https://api.example.com/health",
//!   "subscriber_id": "acct-42",
//!   "poll_interval_ms": 5000,
//!   "health": { "heartbeat_interval_ms": 30000 }
//! }
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::DeliveryError;

/// Configuration for the [`HealthMonitor`](crate::HealthMonitor).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Expected spacing of transport heartbeats. No update for twice this
    /// long marks the connection stale.
    #[serde(rename = "heartbeat_interval_ms", with = "millis")]
    pub heartbeat_interval: Duration,
    /// Spacing of active `/health` probes.
    #[serde(rename = "health_check_interval_ms", with = "millis")]
    pub health_check_interval: Duration,
    /// Backoff base; the delay before attempt `n` is `base * 2^n`.
    #[serde(rename = "base_reconnect_delay_ms", with = "millis")]
    pub base_reconnect_delay: Duration,
    /// Upper bound on any reconnect delay, jitter included.
    #[serde(rename = "max_reconnect_delay_ms", with = "millis")]
    pub max_reconnect_delay: Duration,
    /// Largest uniform jitter added to a backoff delay.
    #[serde(rename = "max_jitter_ms", with = "millis")]
    pub max_jitter: Duration,
    /// Round-trip latency above which the connection counts as degraded.
    #[serde(rename = "latency_threshold_ms", with = "millis")]
    pub latency_threshold: Duration,
    /// Reconnect attempts after which streaming is abandoned for polling.
    pub fallback_after_attempts: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            health_check_interval: Duration::from_secs(30),
            base_reconnect_delay: Duration::from_secs(1),
            max_reconnect_delay: Duration::from_secs(30),
            max_jitter: Duration::from_secs(1),
            latency_threshold: Duration::from_secs(5),
            fallback_after_attempts: 2,
        }
    }
}

/// Configuration for a [`DeliveryClient`](crate::DeliveryClient).
///
/// Immutable once the client is built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Long-lived streaming endpoint.
    pub stream_url: String,
    /// Polling endpoint.
    pub poll_url: String,
    /// Lightweight probe endpoint.
    pub health_url: String,
    /// Identifies this subscriber to the server.
    pub subscriber_id: String,
    /// Fixed spacing between polling requests.
    #[serde(rename = "poll_interval_ms", with = "millis")]
    pub poll_interval: Duration,
    /// `limit` sent with each polling request.
    pub poll_limit: u32,
    /// Failed streaming attempts tolerated before giving up.
    pub max_reconnect_attempts: u32,
    /// Timeout for polling requests and health probes.
    #[serde(rename = "request_timeout_ms", with = "millis")]
    pub request_timeout: Duration,
    /// Timeout for establishing the streaming connection.
    #[serde(rename = "connect_timeout_ms", with = "millis")]
    pub connect_timeout: Duration,
    /// Minimum time spent polling before an upgrade back to streaming.
    #[serde(rename = "recovery_dwell_ms", with = "millis")]
    pub recovery_dwell: Duration,
    /// Number of recent event ids remembered for duplicate suppression.
    pub dedup_window: usize,
    pub health: HealthConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            stream_url: String::new(),
            poll_url: String::new(),
            health_url: String::new(),
            subscriber_id: String::new(),
            poll_interval: Duration::from_secs(5),
            poll_limit: 100,
            max_reconnect_attempts: 5,
            request_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(10),
            recovery_dwell: Duration::from_secs(30),
            dedup_window: 256,
            health: HealthConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Derive the three endpoints from a base URL.
    pub fn new(base_url: &str, subscriber_id: impl Into<String>) -> Self {
        let base = base_url.trim_end_matches('/');
        Self {
            stream_url: format!("{base}/realtime/stream"),
            poll_url: format!("{base}/realtime/poll"),
            health_url: format!("{base}/health"),
            subscriber_id: subscriber_id.into(),
            ..Self::default()
        }
    }

    /// Parse a JSON document; missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self, DeliveryError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| DeliveryError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the client cannot run with.
    pub fn validate(&self) -> Result<(), DeliveryError> {
        if self.subscriber_id.trim().is_empty() {
            return Err(DeliveryError::Config("subscriber_id is empty".into()));
        }
        for (name, url) in [
            ("stream_url", &self.stream_url),
            ("poll_url", &self.poll_url),
            ("health_url", &self.health_url),
        ] {
            if url.is_empty() {
                return Err(DeliveryError::Config(format!("{name} is empty")));
            }
        }
        if self.poll_interval.is_zero() {
            return Err(DeliveryError::Config("poll_interval must be non-zero".into()));
        }
        if self.poll_limit == 0 {
            return Err(DeliveryError::Config("poll_limit must be non-zero".into()));
        }
        if self.health.heartbeat_interval.is_zero() || self.health.health_check_interval.is_zero() {
            return Err(DeliveryError::Config("health intervals must be non-zero".into()));
        }
        Ok(())
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
