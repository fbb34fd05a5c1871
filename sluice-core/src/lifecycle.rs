//! Host lifecycle signals
//!
//! The coordinator reacts to two moments in the host's life: startup (drain
//! whatever the previous run left behind) and shutdown (last chance to get
//! pending events out). `LifecycleSource` abstracts where those moments come
//! from; a long-running process maps them to process start and SIGINT, tests
//! drive them through a channel.

use async_trait::async_trait;
use tokio::sync::mpsc;

/// A moment in the host's life the coordinator reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// Host finished loading; previous-run leftovers can be drained
    Startup,
    /// Host is about to terminate; final flush opportunity
    Shutdown,
}

/// Stream of lifecycle events.
///
/// `next_event` returning `None` means the source is exhausted and no
/// further events will arrive.
#[async_trait]
pub trait LifecycleSource: Send {
    /// Wait for the next lifecycle event.
    async fn next_event(&mut self) -> Option<LifecycleEvent>;
}

#[async_trait]
impl LifecycleSource for Box<dyn LifecycleSource + 'static> {
    async fn next_event(&mut self) -> Option<LifecycleEvent> {
        (**self).next_event().await
    }
}

/// Channel-fed lifecycle source, for tests and embedding hosts that
/// already know their own lifecycle.
pub struct ChannelLifecycle {
    rx: mpsc::UnboundedReceiver<LifecycleEvent>,
}

/// Sender half paired with a [`ChannelLifecycle`].
#[derive(Clone)]
pub struct LifecycleHandle {
    tx: mpsc::UnboundedSender<LifecycleEvent>,
}

impl LifecycleHandle {
    /// Emit a lifecycle event; ignored if the source side is gone.
    pub fn emit(&self, event: LifecycleEvent) {
        let _ = self.tx.send(event);
    }
}

impl ChannelLifecycle {
    /// Create a connected handle/source pair.
    pub fn channel() -> (LifecycleHandle, ChannelLifecycle) {
        let (tx, rx) = mpsc::unbounded_channel();
        (LifecycleHandle { tx }, ChannelLifecycle { rx })
    }
}

#[async_trait]
impl LifecycleSource for ChannelLifecycle {
    async fn next_event(&mut self) -> Option<LifecycleEvent> {
        self.rx.recv().await
    }
}

/// OS-signal lifecycle for a long-running process: emits `Startup`
/// immediately, then `Shutdown` once on Ctrl-C.
pub struct SignalLifecycle {
    started: bool,
    finished: bool,
}

impl SignalLifecycle {
    /// Create a fresh signal-driven source.
    pub fn new() -> Self {
        Self {
            started: false,
            finished: false,
        }
    }
}

impl Default for SignalLifecycle {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LifecycleSource for SignalLifecycle {
    async fn next_event(&mut self) -> Option<LifecycleEvent> {
        if !self.started {
            self.started = true;
            return Some(LifecycleEvent::Startup);
        }
        if self.finished {
            return None;
        }
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "Cannot listen for shutdown signal");
            self.finished = true;
            return None;
        }
        self.finished = true;
        Some(LifecycleEvent::Shutdown)
    }
}
