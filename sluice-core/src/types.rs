//! Domain types for the telemetry delivery pipeline
//!
//! `AnalyticsEvent` is the immutable input the application hands to the
//! coordinator. `StoredEvent` wraps it with retry bookkeeping once it lands
//! in the durable queue; identity (`id`) exists only after persistence.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single analytics event as produced by application code.
///
/// Serialized with camelCase field names to match the collector wire format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyticsEvent {
    /// Event name (e.g., "page_view", "ecommerce")
    pub event: String,
    /// Event category (e.g., "navigation", "shop")
    pub category: String,
    /// Action within the category (e.g., "add_to_cart")
    pub action: String,
    /// Optional label
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// Optional numeric value (order totals, counts)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
    /// Optional user identifier
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Session identifier
    pub session_id: String,
    /// Page path where the event originated
    pub page: String,
    /// User agent of the originating client
    pub user_agent: String,
    /// Open string-keyed metadata
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
}

/// An event persisted in the durable queue, with retry bookkeeping.
///
/// Owned exclusively by the queue: created on `store_event`, mutated only
/// via `increment_retry`, destroyed via `remove_event` or `cleanup`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredEvent {
    /// Generated id, globally unique per store
    pub id: String,
    /// The original event
    pub event: AnalyticsEvent,
    /// Creation time; non-decreasing across inserts
    pub timestamp: DateTime<Utc>,
    /// Number of delivery retries attempted so far
    pub retry_count: u32,
    /// Timestamp of the most recent retry attempt, if any
    pub last_retry: Option<DateTime<Utc>>,
}

/// One concrete transport mechanism in the delivery chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// POST to the alternative collection endpoint
    HttpAlternative,
    /// Fire-and-forget beacon primitive
    Beacon,
    /// POST to the canonical collection endpoint
    HttpPrimary,
    /// Terminal fallback: persist into the durable queue for later retry
    DurableQueue,
}

impl Strategy {
    /// Stable name for logging and stats
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::HttpAlternative => "http-alternative",
            Strategy::Beacon => "beacon",
            Strategy::HttpPrimary => "http-primary",
            Strategy::DurableQueue => "durable-queue",
        }
    }
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a single `send_event` call.
///
/// `delivered = false` with `strategy = DurableQueue` means the event was
/// queued for later retry, not transmitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendOutcome {
    /// Whether a transport accepted the event
    pub delivered: bool,
    /// The strategy that terminated the chain
    pub strategy: Strategy,
}

/// Result of a reachability probe against a collection endpoint.
///
/// Value type; produced fresh or returned from the detector's TTL cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectionResult {
    /// Whether the endpoint looks blocked by a client-side filter
    pub is_blocked: bool,
    /// Which transport was probed
    pub method: &'static str,
    /// Human-readable classification of the probe outcome
    pub reason: String,
}

/// Process-wide retry configuration, owned by the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryConfig {
    /// Retry budget before an event is excluded from automatic delivery
    pub max_retries: u32,
    /// Backoff seed between retry passes
    pub initial_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_delay: Duration::from_millis(1000),
        }
    }
}

/// Partial update for `RetryConfig`; unset fields keep their previous value.
#[derive(Debug, Clone, Copy, Default)]
pub struct RetryConfigPatch {
    /// New retry budget, if changing
    pub max_retries: Option<u32>,
    /// New backoff seed, if changing
    pub initial_delay: Option<Duration>,
}

impl RetryConfig {
    /// Shallow-merge a partial update into this config.
    pub fn apply(&mut self, patch: RetryConfigPatch) {
        if let Some(max_retries) = patch.max_retries {
            self.max_retries = max_retries;
        }
        if let Some(initial_delay) = patch.initial_delay {
            self.initial_delay = initial_delay;
        }
    }
}
