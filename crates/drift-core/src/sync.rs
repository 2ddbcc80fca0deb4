//! Task-control primitives.
//!
//! Every blocking wait in a connection handler or transfer loop goes through
//! one of these two types, so shutdown and pause/stop delivery are bounded in
//! time and never race the waiter.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{watch, Notify};

/// Interruptible stop-or-wake signal for a long-lived worker
///
/// A worker sleeps through [`StopSignal::sleep`] or [`StopSignal::wait`];
/// both return immediately once [`StopSignal::trigger`] has been called, and
/// [`StopSignal::wake`] interrupts the current wait without stopping the
/// worker (used when a peer is re-announced by discovery).
#[derive(Debug, Default)]
pub struct StopSignal {
    stopped: AtomicBool,
    notify: Notify,
}

impl StopSignal {
    /// Create a fresh signal
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a permanent stop and wake all waiters
    pub fn trigger(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    /// Wake the current waiter without stopping it
    pub fn wake(&self) {
        self.notify.notify_waiters();
    }

    /// True once [`StopSignal::trigger`] has been called
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Sleep for `duration` unless woken first
    ///
    /// Returns `true` when the sleep was interrupted (stop or wake), `false`
    /// when the full duration elapsed. Callers must re-check
    /// [`StopSignal::is_stopped`] after every wait.
    pub async fn sleep(&self, duration: Duration) -> bool {
        let notified = self.notify.notified();
        tokio::pin!(notified);
        if self.is_stopped() {
            return true;
        }
        tokio::select! {
            _ = &mut notified => true,
            _ = tokio::time::sleep(duration) => false,
        }
    }

    /// Block until woken or stopped
    pub async fn wait(&self) {
        let notified = self.notify.notified();
        tokio::pin!(notified);
        if self.is_stopped() {
            return;
        }
        notified.await;
    }
}

/// Gate state, observed by the chunk-producing/consuming loops
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GateState {
    Running,
    Paused,
    Cancelled,
}

/// Outcome of waiting on a paused gate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateResolution {
    /// The transfer may continue
    Resumed,
    /// The transfer was stopped while paused
    Cancelled,
}

/// Pause-or-cancel gate for one active transfer
///
/// A single primitive replaces separate pause and stop condition variables:
/// the active loop calls [`PauseGate::checkpoint`] before every chunk, and
/// pause/resume/stop delivery never blocks on the transferring task.
#[derive(Debug)]
pub struct PauseGate {
    state: watch::Sender<GateState>,
}

impl Default for PauseGate {
    fn default() -> Self {
        Self::new()
    }
}

impl PauseGate {
    /// Create a running gate
    #[must_use]
    pub fn new() -> Self {
        let (state, _) = watch::channel(GateState::Running);
        Self { state }
    }

    /// Request a pause; no-op once cancelled
    pub fn pause(&self) {
        self.state.send_if_modified(|s| {
            if *s == GateState::Running {
                *s = GateState::Paused;
                true
            } else {
                false
            }
        });
    }

    /// Resume a paused gate; no-op once cancelled
    pub fn resume(&self) {
        self.state.send_if_modified(|s| {
            if *s == GateState::Paused {
                *s = GateState::Running;
                true
            } else {
                false
            }
        });
    }

    /// Cancel the gate permanently, unblocking any checkpoint wait
    pub fn cancel(&self) {
        self.state.send_if_modified(|s| {
            if *s != GateState::Cancelled {
                *s = GateState::Cancelled;
                true
            } else {
                false
            }
        });
    }

    /// True while a pause is requested
    #[must_use]
    pub fn is_paused(&self) -> bool {
        *self.state.borrow() == GateState::Paused
    }

    /// True once cancelled
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.state.borrow() == GateState::Cancelled
    }

    /// Block while paused; resolve on resume or cancellation
    ///
    /// Returns immediately when the gate is running or cancelled.
    pub async fn checkpoint(&self) -> GateResolution {
        let mut rx = self.state.subscribe();
        loop {
            let current = *rx.borrow_and_update();
            match current {
                GateState::Running => return GateResolution::Resumed,
                GateState::Cancelled => return GateResolution::Cancelled,
                GateState::Paused => {
                    if rx.changed().await.is_err() {
                        return GateResolution::Cancelled;
                    }
                }
            }
        }
    }
}
