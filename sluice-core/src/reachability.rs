//! Transport-reachability and ad-blocker detection
//!
//! Probes whether a collection endpoint is reachable or silently blocked by
//! a client-side filter, memoizing results per endpoint for a bounded time
//! window so repeated sends do not re-probe on every call.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;

use crate::transport::{FireAndForgetTransport, NetworkTransport};
use crate::types::DetectionResult;

/// Probe method reported in `DetectionResult`
const METHOD_HTTP: &str = "http";

/// How long a cached detection result stays valid.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(300);

/// Default bound on the probe request.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Markup-layer bait surface supplied by the host.
///
/// A browser host synthesizes a bait element with attributes targeted by
/// blocklists and reports whether a filter hid it. Hosts without a rendering
/// context return `None`.
pub trait BaitSurface: Send + Sync {
    /// `Some(true)` if the bait element was hidden/zero-sized by a filter,
    /// `Some(false)` if it rendered normally, `None` without a surface.
    fn bait_hidden(&self) -> Option<bool>;
}

/// Host without any rendering context.
pub struct NoSurface;

impl BaitSurface for NoSurface {
    fn bait_hidden(&self) -> Option<bool> {
        None
    }
}

struct CacheEntry {
    result: DetectionResult,
    expires_at: Instant,
}

/// Detects endpoint blocking and host transmit capabilities.
///
/// Results are cached per endpoint key; an entry is reusable iff
/// `now < expires_at` with `expires_at = created_at + TTL`.
pub struct ReachabilityDetector {
    transport: Arc<dyn NetworkTransport>,
    beacon: Arc<dyn FireAndForgetTransport>,
    bait: Box<dyn BaitSurface>,
    cache: Mutex<HashMap<String, CacheEntry>>,
    cache_ttl: Duration,
    probe_timeout: Duration,
}

impl ReachabilityDetector {
    /// Create a detector with default TTL and probe timeout.
    pub fn new(
        transport: Arc<dyn NetworkTransport>,
        beacon: Arc<dyn FireAndForgetTransport>,
    ) -> Self {
        Self::with_settings(
            transport,
            beacon,
            Box::new(NoSurface),
            DEFAULT_CACHE_TTL,
            DEFAULT_PROBE_TIMEOUT,
        )
    }

    /// Create a detector with explicit bait surface and timing settings.
    pub fn with_settings(
        transport: Arc<dyn NetworkTransport>,
        beacon: Arc<dyn FireAndForgetTransport>,
        bait: Box<dyn BaitSurface>,
        cache_ttl: Duration,
        probe_timeout: Duration,
    ) -> Self {
        Self {
            transport,
            beacon,
            bait,
            cache: Mutex::new(HashMap::new()),
            cache_ttl,
            probe_timeout,
        }
    }

    /// Probe whether the given endpoint is blocked, consulting the cache
    /// first. A valid cache hit issues no network activity.
    pub async fn detect_blocking(&self, endpoint: &str) -> DetectionResult {
        if let Some(cached) = self.cached_result(endpoint) {
            tracing::debug!(endpoint = %endpoint, "Reachability served from cache");
            return cached;
        }

        let result = match self.transport.probe(endpoint, self.probe_timeout).await {
            Ok(()) => DetectionResult {
                is_blocked: false,
                method: METHOD_HTTP,
                reason: "probe succeeded".to_string(),
            },
            Err(e) if e.is_blocked_signature() => {
                tracing::warn!(endpoint = %endpoint, error = %e, "Endpoint looks blocked by client");
                DetectionResult {
                    is_blocked: true,
                    method: METHOD_HTTP,
                    reason: e.to_string(),
                }
            }
            // Unrecognized failure shape: probe inconclusive, assume not
            // blocked so callers do not over-trigger fallback.
            Err(e) => DetectionResult {
                is_blocked: false,
                method: METHOD_HTTP,
                reason: format!("probe inconclusive: {}", e),
            },
        };

        let mut cache = self.cache.lock().unwrap();
        cache.insert(
            endpoint.to_string(),
            CacheEntry {
                result: result.clone(),
                expires_at: Instant::now() + self.cache_ttl,
            },
        );

        result
    }

    fn cached_result(&self, endpoint: &str) -> Option<DetectionResult> {
        let cache = self.cache.lock().unwrap();
        cache
            .get(endpoint)
            .filter(|entry| Instant::now() < entry.expires_at)
            .map(|entry| entry.result.clone())
    }

    /// Whether the fire-and-forget beacon primitive exists and is callable.
    pub fn is_send_beacon_available(&self) -> bool {
        self.beacon.is_available()
    }

    /// Markup-layer heuristic, independent of the network probe.
    ///
    /// Returns `false` deterministically when the host supplies no
    /// rendering surface rather than erroring.
    pub fn detect_ad_markers(&self) -> bool {
        self.bait.bait_hidden().unwrap_or(false)
    }

    /// Drop all cached entries; the next `detect_blocking` always re-probes.
    pub fn clear_cache(&self) {
        self.cache.lock().unwrap().clear();
    }
}
