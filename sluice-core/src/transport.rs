//! Transport adapters for event delivery
//!
//! Each host capability sits behind a narrow trait so the engine and
//! detector stay portable: `NetworkTransport` for request/response HTTP and
//! `FireAndForgetTransport` for the beacon-style handoff whose effect is
//! asynchronous and unobservable. Tests substitute scripted fakes.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use thiserror::Error;

use crate::config::DetectorConfig;
use crate::error::{Error, Result};
use crate::types::AnalyticsEvent;

/// Failure signatures known to indicate client-side blocking
/// (extension blocklists, filtering proxies) rather than server trouble.
const BLOCKED_SIGNATURES: &[&str] = &[
    "ERR_BLOCKED_BY_CLIENT",
    "blocked by client",
    "Failed to fetch",
    "NetworkError when attempting to fetch",
];

/// Classified failure of a single transport attempt.
///
/// The delivery chain only needs *that* a strategy failed; the detector
/// additionally cares *why*, via [`TransportError::is_blocked_signature`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Failure matching a known client-blocked pattern
    #[error("request blocked by client: {0}")]
    Blocked(String),

    /// Request exceeded its timeout / was aborted
    #[error("request timed out")]
    Timeout,

    /// Server answered with a non-2xx status
    #[error("server returned {status}: {message}")]
    Status {
        /// HTTP status code
        status: u16,
        /// Response body, best effort
        message: String,
    },

    /// Any other network-layer failure
    #[error("network error: {0}")]
    Network(String),
}

impl TransportError {
    /// Whether this failure asserts client-side blocking.
    ///
    /// Timeouts/aborts count as blocked; unrecognized network errors do not,
    /// so the detector stays conservative on unrelated failures.
    pub fn is_blocked_signature(&self) -> bool {
        matches!(self, TransportError::Blocked(_) | TransportError::Timeout)
    }
}

/// Match an error message against the known blocked-by-client signatures.
pub(crate) fn matches_blocked_signature(message: &str) -> bool {
    BLOCKED_SIGNATURES.iter().any(|sig| message.contains(sig))
}

/// Request/response HTTP transport.
#[async_trait]
pub trait NetworkTransport: Send + Sync {
    /// POST a serialized event to a collection endpoint.
    ///
    /// Any 2xx response is success; anything else (including network
    /// failure) is a classified `TransportError`.
    async fn post_event(
        &self,
        url: &str,
        event: &AnalyticsEvent,
    ) -> std::result::Result<(), TransportError>;

    /// Issue a time-bounded reachability probe against an endpoint.
    async fn probe(&self, url: &str, timeout: Duration)
        -> std::result::Result<(), TransportError>;
}

/// Fire-and-forget transport (the beacon primitive).
///
/// `send` returns whether the host accepted the payload for background
/// transmission, not whether the server received it.
pub trait FireAndForgetTransport: Send + Sync {
    /// Whether the primitive exists and is callable in this host.
    fn is_available(&self) -> bool;

    /// Hand off a payload for background transmission.
    fn send(&self, url: &str, event: &AnalyticsEvent) -> bool;
}

/// `NetworkTransport` backed by reqwest.
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    /// Build an HTTP transport with the given request timeout.
    pub fn new(timeout: Duration) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()
            .map_err(|e| Error::Config(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self { client })
    }

    /// Build from detector configuration (probe timeout doubles as the
    /// default request timeout).
    pub fn from_config(config: &DetectorConfig) -> Result<Self> {
        Self::new(config.probe_timeout())
    }

    fn classify(err: reqwest::Error) -> TransportError {
        if err.is_timeout() {
            return TransportError::Timeout;
        }
        let message = err.to_string();
        if matches_blocked_signature(&message) {
            TransportError::Blocked(message)
        } else {
            TransportError::Network(message)
        }
    }
}

#[async_trait]
impl NetworkTransport for HttpTransport {
    async fn post_event(
        &self,
        url: &str,
        event: &AnalyticsEvent,
    ) -> std::result::Result<(), TransportError> {
        let response = self
            .client
            .post(url)
            .json(event)
            .send()
            .await
            .map_err(Self::classify)?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            let message = response.text().await.unwrap_or_else(|_| "unknown".to_string());
            Err(TransportError::Status {
                status: status.as_u16(),
                message,
            })
        }
    }

    async fn probe(
        &self,
        url: &str,
        timeout: Duration,
    ) -> std::result::Result<(), TransportError> {
        let response = self
            .client
            .post(url)
            .timeout(timeout)
            .json(&serde_json::json!({ "probe": true }))
            .send()
            .await
            .map_err(Self::classify)?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(TransportError::Status {
                status: status.as_u16(),
                message: String::new(),
            })
        }
    }
}

/// Beacon adapter that detaches the POST onto the runtime and reports only
/// whether the handoff was accepted, mirroring the browser primitive.
pub struct SpawningBeacon {
    client: reqwest::Client,
}

impl SpawningBeacon {
    /// Build a beacon adapter with the given per-request timeout.
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("failed to create HTTP client: {}", e)))?;
        Ok(Self { client })
    }
}

impl FireAndForgetTransport for SpawningBeacon {
    fn is_available(&self) -> bool {
        // Callable whenever a runtime exists to carry the detached request.
        tokio::runtime::Handle::try_current().is_ok()
    }

    fn send(&self, url: &str, event: &AnalyticsEvent) -> bool {
        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => return false,
        };

        let request = self.client.post(url).json(event);
        handle.spawn(async move {
            if let Err(e) = request.send().await {
                tracing::debug!(error = %e, "Beacon transmission failed in background");
            }
        });
        true
    }
}

/// Stand-in for hosts without a fire-and-forget primitive.
pub struct NoBeacon;

impl FireAndForgetTransport for NoBeacon {
    fn is_available(&self) -> bool {
        false
    }

    fn send(&self, _url: &str, _event: &AnalyticsEvent) -> bool {
        false
    }
}
