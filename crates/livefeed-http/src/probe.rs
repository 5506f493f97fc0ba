//! Active health probe against the health endpoint.

use async_trait::async_trait;
use reqwest::StatusCode;
use std::time::Duration;
use tokio::time::Instant;

use livefeed_core::{DeliveryError, HealthProbe};

use crate::transport_error;

/// `GET <health_url>`; healthy only on `200 OK`.
#[derive(Debug, Clone)]
pub struct HttpHealthProbe {
    http: reqwest::Client,
    url: String,
}

impl HttpHealthProbe {
    pub fn new(http: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            http,
            url: url.into(),
        }
    }
}

#[async_trait]
impl HealthProbe for HttpHealthProbe {
    async fn probe(&self) -> Result<Duration, DeliveryError> {
        let started = Instant::now();
        let response = self.http.get(&self.url).send().await.map_err(transport_error)?;
        let status = response.status();
        if status != StatusCode::OK {
            return Err(DeliveryError::Http(format!(
                "health check returned HTTP {}",
                status.as_u16()
            )));
        }
        Ok(started.elapsed())
    }
}
