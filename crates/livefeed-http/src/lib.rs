//! livefeed-http — HTTP transports for livefeed.
//!
//! - [`StreamingSource`] — long-lived `GET` on the streaming endpoint,
//!   newline-delimited frames
//! - [`PollingSource`] — interval `GET` on the poll endpoint
//! - [`HttpHealthProbe`] — `GET` on the health endpoint
//! - [`HttpConnector`] — hands the client a fresh source on every switch
//!
//! # Usage
//! ```rust,no_run
//! use livefeed_core::ClientConfig;
//!
//! # async fn demo() -> Result<(), livefeed_core::DeliveryError> {
//! let client = livefeed_http::build_client(ClientConfig::new("https://api.example.com", "acct-42"))?;
//! client.on("*", |event| {
//!     println!("{} {}", event.kind, event.timestamp);
//!     Ok(())
//! });
//! client.connect();
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use livefeed_core::{ClientConfig, DeliveryClient, DeliveryError};

pub mod connector;
pub mod frame;
pub mod poll;
pub mod probe;
pub mod stream;

pub use connector::HttpConnector;
pub use poll::{fetch_events, PollingSource};
pub use probe::HttpHealthProbe;
pub use stream::StreamingSource;

/// A [`DeliveryClient`] wired to the HTTP transports and health probe.
pub fn build_client(config: ClientConfig) -> Result<DeliveryClient, DeliveryError> {
    let connector = HttpConnector::new(&config)?;
    let probe = Arc::new(connector.probe());
    DeliveryClient::new(config, Arc::new(connector), Some(probe))
}

/// Connection, timeout and body-read failures; all retryable.
pub(crate) fn transport_error(e: reqwest::Error) -> DeliveryError {
    DeliveryError::Http(e.to_string())
}
