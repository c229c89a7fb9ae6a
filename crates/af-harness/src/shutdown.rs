use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// ShutdownReason
// ---------------------------------------------------------------------------

/// Why the daemon is stopping. Recorded by the first trigger only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    /// SIGINT / SIGTERM / Ctrl-C.
    Signal(&'static str),
    /// A fatal coordinator error; the process exits non-zero.
    Fatal(String),
    /// Programmatic request (tests, embedders).
    Requested,
}

impl ShutdownReason {
    pub fn is_fatal(&self) -> bool {
        matches!(self, ShutdownReason::Fatal(_))
    }
}

// ---------------------------------------------------------------------------
// ShutdownSignal
// ---------------------------------------------------------------------------

/// Cooperative stop flag shared by the coordinator loop, the role runners
/// and the supervisor watchdog.
///
/// Loops either `select!` on [`subscribe`](Self::subscribe) or await
/// [`cancelled`](Self::cancelled). Triggering is idempotent: a second signal
/// while already stopping is logged and otherwise ignored, so the stop
/// sequence runs exactly once.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    notify: broadcast::Sender<()>,
    stopping: Arc<AtomicBool>,
    reason: Arc<Mutex<Option<ShutdownReason>>>,
    drained_tx: Arc<watch::Sender<usize>>,
    drained_rx: watch::Receiver<usize>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (notify, _) = broadcast::channel(1);
        let (drained_tx, drained_rx) = watch::channel(0);
        Self {
            notify,
            stopping: Arc::new(AtomicBool::new(false)),
            reason: Arc::new(Mutex::new(None)),
            drained_tx: Arc::new(drained_tx),
            drained_rx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.notify.subscribe()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }

    /// Start the stop sequence. Returns `true` only for the call that
    /// actually flipped the flag.
    pub fn trigger(&self, reason: ShutdownReason) -> bool {
        if self
            .stopping
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            info!(reason = ?reason, "shutdown triggered");
            *self.reason.lock() = Some(reason);
            let _ = self.notify.send(());
            true
        } else {
            warn!(reason = ?reason, "shutdown already in progress, ignoring");
            false
        }
    }

    /// The reason recorded by the first trigger.
    pub fn reason(&self) -> Option<ShutdownReason> {
        self.reason.lock().clone()
    }

    /// Resolve once shutdown has been triggered. Returns immediately if it
    /// already was.
    pub async fn cancelled(&self) {
        let mut rx = self.subscribe();
        if self.is_shutting_down() {
            return;
        }
        let _ = rx.recv().await;
    }

    /// Hand out a guard that reports this participant drained when dropped.
    pub fn guard(&self) -> ShutdownGuard {
        ShutdownGuard {
            signal: self.clone(),
        }
    }

    fn confirm_drained(&self) {
        self.drained_tx.send_modify(|count| *count += 1);
    }

    /// Wait until `expected` guards have been dropped, or `timeout` passes.
    pub async fn wait_for_drain(&self, expected: usize, timeout: Duration) -> DrainResult {
        let mut rx = self.drained_rx.clone();
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let drained = *rx.borrow_and_update();
            if drained >= expected {
                info!(drained, "all participants drained");
                return DrainResult::Complete(drained);
            }

            match tokio::time::timeout_at(deadline, rx.changed()).await {
                Ok(Ok(())) => continue,
                Ok(Err(_)) => return DrainResult::Complete(*rx.borrow()),
                Err(_) => {
                    let drained = *rx.borrow();
                    warn!(drained, expected, "drain timed out");
                    return DrainResult::Timeout { drained, expected };
                }
            }
        }
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainResult {
    Complete(usize),
    Timeout { drained: usize, expected: usize },
}

impl DrainResult {
    pub fn is_complete(&self) -> bool {
        matches!(self, DrainResult::Complete(_))
    }
}

/// Held by each draining participant; dropping it confirms the drain.
pub struct ShutdownGuard {
    signal: ShutdownSignal,
}

impl ShutdownGuard {
    pub fn signal(&self) -> &ShutdownSignal {
        &self.signal
    }
}

impl Drop for ShutdownGuard {
    fn drop(&mut self) {
        self.signal.confirm_drained();
    }
}
