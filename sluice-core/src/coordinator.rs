//! Delivery coordinator
//!
//! Owns the moving parts of the pipeline: the strategy engine, the durable
//! queue, the reachability detector, and the retry configuration they
//! share. Schedules periodic flush passes, reacts to host lifecycle events,
//! and guarantees at most one flush is in flight at a time.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::config::{Config, FlushConfig};
use crate::delivery::{DeliveryStats, DeliveryStrategyEngine};
use crate::error::Result;
use crate::lifecycle::{LifecycleEvent, LifecycleSource, SignalLifecycle};
use crate::queue::{DurableQueue, SqliteEventQueue};
use crate::reachability::{NoSurface, ReachabilityDetector};
use crate::transport::{HttpTransport, SpawningBeacon};
use crate::types::{AnalyticsEvent, RetryConfig, RetryConfigPatch, SendOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CoordinatorState {
    Uninitialized,
    Initializing,
    Ready,
}

/// Clears the in-flight flag even if the flush future is dropped mid-await.
struct FlushGuard<'a>(&'a AtomicBool);

impl Drop for FlushGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Top-level pipeline handle the application talks to.
///
/// Construction is cheap and touches no storage or network; `init` arms the
/// durable queue and the periodic flush. All delivery entry points are safe
/// to call before `init` — the queue opens lazily and the engine needs no
/// setup.
pub struct DeliveryCoordinator {
    engine: Arc<DeliveryStrategyEngine>,
    queue: Arc<dyn DurableQueue>,
    detector: Arc<ReachabilityDetector>,
    retry_config: Arc<RwLock<RetryConfig>>,
    flush: FlushConfig,
    state: Mutex<CoordinatorState>,
    flush_in_flight: AtomicBool,
    periodic: Mutex<Option<JoinHandle<()>>>,
    lifecycle_task: Mutex<Option<JoinHandle<()>>>,
    /// Source staged at construction, consumed by `init`
    pending_lifecycle: Mutex<Option<Box<dyn LifecycleSource + 'static>>>,
    /// Handed to background tasks so they never keep the coordinator alive
    self_ref: Weak<Self>,
}

impl DeliveryCoordinator {
    /// Assemble a coordinator from pre-built parts.
    ///
    /// `retry_config` must be the same handle the queue reads its budget
    /// from, so `set_retry_config` reaches both sides. A staged
    /// `lifecycle` source is attached when `init` arms the pipeline.
    pub fn new(
        engine: Arc<DeliveryStrategyEngine>,
        queue: Arc<dyn DurableQueue>,
        detector: Arc<ReachabilityDetector>,
        retry_config: Arc<RwLock<RetryConfig>>,
        flush: FlushConfig,
        lifecycle: Option<Box<dyn LifecycleSource + 'static>>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            engine,
            queue,
            detector,
            retry_config,
            flush,
            state: Mutex::new(CoordinatorState::Uninitialized),
            flush_in_flight: AtomicBool::new(false),
            periodic: Mutex::new(None),
            lifecycle_task: Mutex::new(None),
            pending_lifecycle: Mutex::new(lifecycle),
            self_ref: self_ref.clone(),
        })
    }

    /// Build the full production pipeline from configuration: reqwest
    /// transports, reachability detector, and a file-backed queue at
    /// [`Config::queue_path`].
    pub fn from_config(config: &Config) -> Result<Arc<Self>> {
        let retry_config = Arc::new(RwLock::new(RetryConfig {
            max_retries: config.retry.max_retries,
            initial_delay: Duration::from_millis(config.retry.initial_delay_ms),
        }));

        let transport = Arc::new(HttpTransport::from_config(&config.detector)?);
        let beacon = Arc::new(SpawningBeacon::new(config.detector.probe_timeout())?);
        let detector = Arc::new(ReachabilityDetector::with_settings(
            transport.clone(),
            beacon.clone(),
            Box::new(NoSurface),
            config.detector.cache_ttl(),
            config.detector.probe_timeout(),
        ));
        let queue = Arc::new(SqliteEventQueue::with_capacity(
            config.queue_path(),
            config.queue.max_events,
            retry_config.clone(),
        ));
        let engine = Arc::new(DeliveryStrategyEngine::new(
            transport,
            beacon,
            detector.clone(),
            queue.clone(),
            config.endpoints.clone(),
        ));

        Ok(Self::new(
            engine,
            queue,
            detector,
            retry_config,
            config.flush.clone(),
            Some(Box::new(SignalLifecycle::new())),
        ))
    }

    /// Arm the pipeline: establish the durable queue, register the staged
    /// lifecycle source, and start the periodic flush. Idempotent;
    /// concurrent callers race to a single arming.
    ///
    /// A queue that cannot be established is logged and tolerated — the
    /// pipeline runs without persistence rather than refusing to start.
    pub async fn init(&self) {
        {
            let mut state = self.state.lock().unwrap();
            if *state != CoordinatorState::Uninitialized {
                return;
            }
            *state = CoordinatorState::Initializing;
        }

        if let Err(e) = self.queue.init().await {
            tracing::warn!(error = %e, "Durable queue unavailable, continuing without persistence");
        }

        self.start_periodic_flush();
        if let Some(source) = self.pending_lifecycle.lock().unwrap().take() {
            self.attach_lifecycle(source);
        }
        *self.state.lock().unwrap() = CoordinatorState::Ready;
        tracing::info!(
            interval_secs = self.flush.interval_secs,
            batch_size = self.flush.batch_size,
            "Delivery coordinator ready"
        );
    }

    /// Deliver one event through the strategy chain. Never raises; the
    /// worst outcome is "queued for retry".
    pub async fn send_event(&self, event: &AnalyticsEvent) -> SendOutcome {
        self.engine.send_event(event).await
    }

    /// Persist an event straight into the durable queue, bypassing the
    /// transport chain.
    pub async fn store_for_retry(&self, event: &AnalyticsEvent) {
        self.queue.store_event(event).await;
    }

    /// Drain one batch of pending events through the transport chain.
    ///
    /// At most one flush runs at a time; a call that finds another flush in
    /// flight returns 0 immediately rather than queueing behind it.
    pub async fn flush_pending_events(&self) -> usize {
        if self
            .flush_in_flight
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            tracing::debug!("Flush already in flight, skipping");
            return 0;
        }
        let _guard = FlushGuard(&self.flush_in_flight);
        self.engine.flush_pending_events(self.flush.batch_size).await
    }

    /// Total number of stored events, unfiltered by retry budget.
    pub async fn pending_count(&self) -> usize {
        self.queue.pending_count().await
    }

    /// Purge stored events past the retry budget.
    pub async fn cleanup(&self) {
        self.queue.cleanup().await;
    }

    /// Apply a partial retry-configuration update. The queue reads the same
    /// handle, so a new budget takes effect on its next read.
    pub fn set_retry_config(&self, patch: RetryConfigPatch) {
        let mut config = self.retry_config.write().unwrap();
        config.apply(patch);
        tracing::info!(
            max_retries = config.max_retries,
            initial_delay_ms = config.initial_delay.as_millis() as u64,
            "Retry configuration updated"
        );
    }

    /// Current retry configuration.
    pub fn retry_config(&self) -> RetryConfig {
        *self.retry_config.read().unwrap()
    }

    /// The shared reachability detector.
    pub fn detector(&self) -> &ReachabilityDetector {
        &self.detector
    }

    /// Delivery statistics from the engine.
    pub fn stats(&self) -> DeliveryStats {
        self.engine.stats()
    }

    /// Start the periodic flush task at the configured interval.
    pub fn start_periodic_flush(&self) {
        self.start_periodic_flush_every(Duration::from_secs(self.flush.interval_secs.max(1)));
    }

    /// Start the periodic flush task with an explicit period, replacing any
    /// existing timer. There is exactly one active timer afterwards, at the
    /// newest period.
    pub fn start_periodic_flush_every(&self, period: Duration) {
        let mut slot = self.periodic.lock().unwrap();
        if let Some(previous) = slot.take() {
            previous.abort();
        }

        let weak = self.self_ref.clone();
        *slot = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // interval fires immediately; the first flush belongs to the
            // lifecycle startup hook, not the timer
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(coordinator) = weak.upgrade() else {
                    break;
                };
                let delivered = coordinator.flush_pending_events().await;
                if delivered > 0 {
                    tracing::info!(delivered, "Periodic flush delivered queued events");
                }
            }
        }));
    }

    /// Stop the periodic flush task; no-op if none is running.
    pub fn stop_periodic_flush(&self) {
        if let Some(handle) = self.periodic.lock().unwrap().take() {
            handle.abort();
        }
    }

    /// React to host lifecycle events: flush on startup, flush and stop the
    /// periodic task on shutdown. Replaces any previously attached source.
    pub fn attach_lifecycle(&self, mut source: impl LifecycleSource + 'static) {
        let weak = self.self_ref.clone();
        let handle = tokio::spawn(async move {
            while let Some(event) = source.next_event().await {
                let Some(coordinator) = weak.upgrade() else {
                    break;
                };
                match event {
                    LifecycleEvent::Startup => {
                        tracing::debug!("Host startup, draining leftover events");
                        coordinator.flush_pending_events().await;
                    }
                    LifecycleEvent::Shutdown => {
                        tracing::info!("Host shutdown, final flush");
                        coordinator.flush_pending_events().await;
                        coordinator.stop_periodic_flush();
                    }
                }
            }
        });

        if let Some(previous) = self.lifecycle_task.lock().unwrap().replace(handle) {
            previous.abort();
        }
    }

    /// Tear down background tasks. The coordinator can be re-armed with
    /// `init` afterwards.
    pub fn dispose(&self) {
        self.stop_periodic_flush();
        if let Some(handle) = self.lifecycle_task.lock().unwrap().take() {
            handle.abort();
        }
        *self.state.lock().unwrap() = CoordinatorState::Uninitialized;
    }
}

impl Drop for DeliveryCoordinator {
    fn drop(&mut self) {
        if let Some(handle) = self.periodic.lock().unwrap().take() {
            handle.abort();
        }
        if let Some(handle) = self.lifecycle_task.lock().unwrap().take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EndpointConfig;
    use crate::lifecycle::ChannelLifecycle;
    use crate::transport::{FireAndForgetTransport, NetworkTransport, TransportError};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Notify;

    /// Transport that succeeds, optionally parking each post on a gate.
    struct GatedTransport {
        ok: bool,
        gate: Option<Arc<Notify>>,
        posts: AtomicUsize,
    }

    impl GatedTransport {
        fn ok() -> Arc<Self> {
            Arc::new(Self {
                ok: true,
                gate: None,
                posts: AtomicUsize::new(0),
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                ok: false,
                gate: None,
                posts: AtomicUsize::new(0),
            })
        }

        fn gated(gate: Arc<Notify>) -> Arc<Self> {
            Arc::new(Self {
                ok: true,
                gate: Some(gate),
                posts: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl NetworkTransport for GatedTransport {
        async fn post_event(
            &self,
            _url: &str,
            _event: &AnalyticsEvent,
        ) -> std::result::Result<(), TransportError> {
            self.posts.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            if self.ok {
                Ok(())
            } else {
                Err(TransportError::Blocked("net::ERR_BLOCKED_BY_CLIENT".into()))
            }
        }

        async fn probe(
            &self,
            _url: &str,
            _timeout: Duration,
        ) -> std::result::Result<(), TransportError> {
            Ok(())
        }
    }

    struct NoBeaconEver;

    impl FireAndForgetTransport for NoBeaconEver {
        fn is_available(&self) -> bool {
            false
        }

        fn send(&self, _url: &str, _event: &AnalyticsEvent) -> bool {
            false
        }
    }

    fn make_test_event() -> AnalyticsEvent {
        AnalyticsEvent {
            event: "purchase".to_string(),
            category: "shop".to_string(),
            action: "checkout".to_string(),
            label: None,
            value: Some(59.90),
            user_id: None,
            session_id: "session_1".to_string(),
            page: "/checkout".to_string(),
            user_agent: "test-agent".to_string(),
            metadata: HashMap::new(),
        }
    }

    fn make_coordinator(
        transport: Arc<GatedTransport>,
        flush: FlushConfig,
    ) -> Arc<DeliveryCoordinator> {
        make_coordinator_with(transport, flush, None)
    }

    fn make_coordinator_with(
        transport: Arc<GatedTransport>,
        flush: FlushConfig,
        lifecycle: Option<Box<dyn LifecycleSource + 'static>>,
    ) -> Arc<DeliveryCoordinator> {
        let retry_config = Arc::new(RwLock::new(RetryConfig::default()));
        let queue = Arc::new(SqliteEventQueue::open_in_memory(retry_config.clone()).unwrap());
        let beacon = Arc::new(NoBeaconEver);
        let detector = Arc::new(ReachabilityDetector::new(transport.clone(), beacon.clone()));
        let engine = Arc::new(DeliveryStrategyEngine::new(
            transport,
            beacon,
            detector.clone(),
            queue.clone(),
            EndpointConfig::default(),
        ));
        DeliveryCoordinator::new(engine, queue, detector, retry_config, flush, lifecycle)
    }

    #[tokio::test]
    async fn test_init_is_idempotent() {
        let coordinator = make_coordinator(GatedTransport::ok(), FlushConfig::default());
        coordinator.init().await;
        coordinator.init().await;

        coordinator.store_for_retry(&make_test_event()).await;
        assert_eq!(coordinator.flush_pending_events().await, 1);
        assert_eq!(coordinator.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_init_tolerates_unavailable_storage() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"not a directory").unwrap();

        let retry_config = Arc::new(RwLock::new(RetryConfig::default()));
        let queue = Arc::new(SqliteEventQueue::new(
            blocker.join("sub").join("events.db"),
            retry_config.clone(),
        ));
        let transport = GatedTransport::failing();
        let beacon = Arc::new(NoBeaconEver);
        let detector = Arc::new(ReachabilityDetector::new(transport.clone(), beacon.clone()));
        let engine = Arc::new(DeliveryStrategyEngine::new(
            transport,
            beacon,
            detector.clone(),
            queue.clone(),
            EndpointConfig::default(),
        ));
        let coordinator = DeliveryCoordinator::new(
            engine,
            queue,
            detector,
            retry_config,
            FlushConfig::default(),
            None,
        );

        // Neither init nor delivery may panic or error outward
        coordinator.init().await;
        let outcome = coordinator.send_event(&make_test_event()).await;
        assert!(!outcome.delivered);
        assert_eq!(coordinator.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_flush_guard_rejects_while_busy() {
        let coordinator = make_coordinator(GatedTransport::ok(), FlushConfig::default());
        coordinator.store_for_retry(&make_test_event()).await;

        coordinator.flush_in_flight.store(true, Ordering::SeqCst);
        assert_eq!(coordinator.flush_pending_events().await, 0);
        assert_eq!(coordinator.pending_count().await, 1);

        coordinator.flush_in_flight.store(false, Ordering::SeqCst);
        assert_eq!(coordinator.flush_pending_events().await, 1);
    }

    #[tokio::test]
    async fn test_concurrent_flushes_drain_once() {
        let gate = Arc::new(Notify::new());
        let coordinator = make_coordinator(GatedTransport::gated(gate.clone()), FlushConfig::default());
        coordinator.store_for_retry(&make_test_event()).await;

        let first = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.flush_pending_events().await })
        };
        // Let the first flush take the guard and park on the transport
        tokio::task::yield_now().await;

        let second = coordinator.flush_pending_events().await;
        assert_eq!(second, 0);

        gate.notify_waiters();
        assert_eq!(first.await.unwrap(), 1);
        assert_eq!(coordinator.pending_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_flush_drains_queue() {
        let flush = FlushConfig {
            interval_secs: 1,
            batch_size: 50,
        };
        let coordinator = make_coordinator(GatedTransport::ok(), flush);
        coordinator.store_for_retry(&make_test_event()).await;
        coordinator.store_for_retry(&make_test_event()).await;
        coordinator.init().await;

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(coordinator.pending_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restarting_timer_keeps_only_newest_interval() {
        let coordinator = make_coordinator(GatedTransport::ok(), FlushConfig::default());
        coordinator.start_periodic_flush_every(Duration::from_secs(600));
        coordinator.start_periodic_flush_every(Duration::from_secs(1));

        coordinator.store_for_retry(&make_test_event()).await;
        // Drains at the newest (1s) period, not the replaced 600s one
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(coordinator.pending_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispose_stops_periodic_flush() {
        let flush = FlushConfig {
            interval_secs: 1,
            batch_size: 50,
        };
        let coordinator = make_coordinator(GatedTransport::ok(), flush);
        coordinator.init().await;
        coordinator.dispose();

        coordinator.store_for_retry(&make_test_event()).await;
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(coordinator.pending_count().await, 1);
    }

    #[tokio::test]
    async fn test_init_registers_staged_lifecycle_source() {
        let (handle, source) = ChannelLifecycle::channel();
        let coordinator = make_coordinator_with(
            GatedTransport::ok(),
            FlushConfig::default(),
            Some(Box::new(source)),
        );
        coordinator.store_for_retry(&make_test_event()).await;
        coordinator.init().await;

        // No attach_lifecycle call needed; init wired the staged source
        handle.emit(LifecycleEvent::Startup);
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(coordinator.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_lifecycle_startup_flushes() {
        let coordinator = make_coordinator(GatedTransport::ok(), FlushConfig::default());
        coordinator.store_for_retry(&make_test_event()).await;

        let (handle, source) = ChannelLifecycle::channel();
        coordinator.attach_lifecycle(source);
        handle.emit(LifecycleEvent::Startup);

        // Give the lifecycle task a chance to run
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(coordinator.pending_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lifecycle_shutdown_flushes_and_stops_timer() {
        let flush = FlushConfig {
            interval_secs: 1,
            batch_size: 50,
        };
        let coordinator = make_coordinator(GatedTransport::ok(), flush);
        coordinator.init().await;
        coordinator.store_for_retry(&make_test_event()).await;

        let (handle, source) = ChannelLifecycle::channel();
        coordinator.attach_lifecycle(source);
        handle.emit(LifecycleEvent::Shutdown);

        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(coordinator.pending_count().await, 0);
        assert!(coordinator.periodic.lock().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_set_retry_config_reaches_queue() {
        let transport = GatedTransport::failing();
        let coordinator = make_coordinator(transport, FlushConfig::default());
        coordinator.store_for_retry(&make_test_event()).await;

        // Three failed passes, then a budget of 2 hides the event
        for _ in 0..3 {
            coordinator.flush_pending_events().await;
        }
        coordinator.set_retry_config(RetryConfigPatch {
            max_retries: Some(2),
            initial_delay: None,
        });
        assert_eq!(coordinator.retry_config().max_retries, 2);

        assert_eq!(coordinator.flush_pending_events().await, 0);
        // Hidden from delivery but still stored until cleanup
        assert_eq!(coordinator.pending_count().await, 1);
        coordinator.cleanup().await;
        assert_eq!(coordinator.pending_count().await, 0);
    }
}
