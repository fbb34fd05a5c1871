//! Ordered multi-strategy delivery engine
//!
//! Tries transports for a single event strictly in order, cheapest and
//! least-intrusive first, falling back to the durable queue as the terminal
//! step. Separately drains the queue in batches through the same chain.
//!
//! The chain never raises to its caller: the worst case is
//! "persisted for later retry", and even that swallows its own storage
//! errors.

use std::sync::{Arc, Mutex};

use crate::config::EndpointConfig;
use crate::queue::DurableQueue;
use crate::reachability::ReachabilityDetector;
use crate::transport::{FireAndForgetTransport, NetworkTransport};
use crate::types::{AnalyticsEvent, SendOutcome, Strategy};

/// Delivery statistics, for reporting
#[derive(Debug, Default, Clone)]
pub struct DeliveryStats {
    /// Events accepted by a transport via `send_event`
    pub events_sent: u64,
    /// Events that fell through to the durable queue
    pub events_queued: u64,
    /// Events delivered by flush passes
    pub flush_deliveries: u64,
    /// Individual transport attempts that failed
    pub transport_failures: u64,
}

/// Attempts an ordered sequence of transport strategies per event and
/// drains the durable queue through the same sequence.
pub struct DeliveryStrategyEngine {
    transport: Arc<dyn NetworkTransport>,
    beacon: Arc<dyn FireAndForgetTransport>,
    detector: Arc<ReachabilityDetector>,
    queue: Arc<dyn DurableQueue>,
    endpoints: EndpointConfig,
    /// Last strategy that succeeded; advisory only, never reorders the chain
    preferred: Mutex<Option<Strategy>>,
    stats: Mutex<DeliveryStats>,
}

impl DeliveryStrategyEngine {
    /// Wire up an engine over the given transports, detector, and queue.
    pub fn new(
        transport: Arc<dyn NetworkTransport>,
        beacon: Arc<dyn FireAndForgetTransport>,
        detector: Arc<ReachabilityDetector>,
        queue: Arc<dyn DurableQueue>,
        endpoints: EndpointConfig,
    ) -> Self {
        Self {
            transport,
            beacon,
            detector,
            queue,
            endpoints,
            preferred: Mutex::new(None),
            stats: Mutex::new(DeliveryStats::default()),
        }
    }

    /// Deliver one event, stopping at the first strategy that succeeds.
    ///
    /// Order: alternative endpoint, beacon (if available), primary
    /// endpoint, then persist into the durable queue. The terminal persist
    /// reports `delivered = false` — the event was queued, not sent.
    pub async fn send_event(&self, event: &AnalyticsEvent) -> SendOutcome {
        if let Some(strategy) = self.try_transports(event).await {
            self.record_success(strategy);
            self.stats.lock().unwrap().events_sent += 1;
            return SendOutcome {
                delivered: true,
                strategy,
            };
        }

        tracing::debug!(event = %event.event, "All transports failed, queueing for retry");
        self.queue.store_event(event).await;
        self.stats.lock().unwrap().events_queued += 1;
        SendOutcome {
            delivered: false,
            strategy: Strategy::DurableQueue,
        }
    }

    /// Drain up to `limit` pending events, oldest first, through the
    /// transport chain. Delivered events are removed; failures get their
    /// retry counter bumped and stay persisted for the next pass.
    ///
    /// Returns the number delivered. Does not purge over-budget events —
    /// that is the coordinator's (or an explicit caller's) job.
    pub async fn flush_pending_events(&self, limit: usize) -> usize {
        let pending = self.queue.pending_events(limit).await;
        if pending.is_empty() {
            return 0;
        }

        let mut delivered = 0;
        for stored in &pending {
            match self.try_transports(&stored.event).await {
                Some(strategy) => {
                    self.queue.remove_event(&stored.id).await;
                    self.record_success(strategy);
                    delivered += 1;
                }
                None => {
                    self.queue.increment_retry(&stored.id).await;
                }
            }
        }

        self.stats.lock().unwrap().flush_deliveries += delivered as u64;
        tracing::debug!(
            attempted = pending.len(),
            delivered,
            "Flushed pending events"
        );
        delivered
    }

    /// Attempt the transmit strategies (not the queue fallback) in order.
    async fn try_transports(&self, event: &AnalyticsEvent) -> Option<Strategy> {
        match self
            .transport
            .post_event(&self.endpoints.alternative_url, event)
            .await
        {
            Ok(()) => return Some(Strategy::HttpAlternative),
            Err(e) => self.note_failure(Strategy::HttpAlternative, &e),
        }

        if self.detector.is_send_beacon_available() {
            if self.beacon.send(&self.endpoints.primary_url, event) {
                return Some(Strategy::Beacon);
            }
            self.stats.lock().unwrap().transport_failures += 1;
            tracing::debug!(strategy = %Strategy::Beacon, "Beacon rejected the handoff");
        }

        match self
            .transport
            .post_event(&self.endpoints.primary_url, event)
            .await
        {
            Ok(()) => return Some(Strategy::HttpPrimary),
            Err(e) => self.note_failure(Strategy::HttpPrimary, &e),
        }

        None
    }

    fn note_failure(&self, strategy: Strategy, error: &crate::transport::TransportError) {
        self.stats.lock().unwrap().transport_failures += 1;
        tracing::debug!(strategy = %strategy, error = %error, "Transport attempt failed");
    }

    fn record_success(&self, strategy: Strategy) {
        *self.preferred.lock().unwrap() = Some(strategy);
    }

    /// The last strategy that succeeded, if any. Advisory; the next
    /// `send_event` still restarts the full ordered chain.
    pub fn preferred_strategy(&self) -> Option<Strategy> {
        *self.preferred.lock().unwrap()
    }

    /// Clear the sticky-preference hint.
    pub fn reset_preferred_strategy(&self) {
        *self.preferred.lock().unwrap() = None;
    }

    /// Current delivery statistics.
    pub fn stats(&self) -> DeliveryStats {
        self.stats.lock().unwrap().clone()
    }
}
