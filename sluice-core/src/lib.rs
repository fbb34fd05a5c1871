//! # sluice-core
//!
//! Core library for sluice - a resilient client-side telemetry delivery
//! pipeline.
//!
//! This library provides:
//! - An ordered multi-strategy delivery engine with graceful fallback
//! - A reachability detector that recognizes ad-blocker interference
//! - A durable SQLite-backed queue for undeliverable events
//! - A coordinator tying delivery, retry, and host lifecycle together
//!
//! ## Architecture
//!
//! Events flow through three layers:
//! - **Transports:** HTTP request/response and fire-and-forget beacon
//!   adapters behind narrow traits
//! - **Engine:** tries each transport in a fixed order per event, falling
//!   back to durable storage instead of losing data
//! - **Coordinator:** periodic and lifecycle-driven flushes drain the
//!   stored backlog once connectivity returns
//!
//! ## Example
//!
//! ```rust,no_run
//! use sluice_core::{Config, DeliveryCoordinator};
//!
//! # async fn run() -> sluice_core::Result<()> {
//! let config = Config::load()?;
//! let coordinator = DeliveryCoordinator::from_config(&config)?;
//! coordinator.init().await;
//! # Ok(())
//! # }
//! ```

// Re-export commonly used items at the crate root
pub use config::Config;
pub use coordinator::DeliveryCoordinator;
pub use delivery::{DeliveryStats, DeliveryStrategyEngine};
pub use error::{Error, Result};
pub use lifecycle::{ChannelLifecycle, LifecycleEvent, LifecycleSource, SignalLifecycle};
pub use queue::{DurableQueue, SqliteEventQueue};
pub use reachability::ReachabilityDetector;
pub use transport::{FireAndForgetTransport, HttpTransport, NetworkTransport, SpawningBeacon};
pub use types::*;

// Public modules
pub mod config;
pub mod coordinator;
pub mod delivery;
pub mod error;
pub mod lifecycle;
pub mod logging;
pub mod queue;
pub mod reachability;
pub mod transport;
pub mod types;
