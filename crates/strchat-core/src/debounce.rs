use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::updates::{CoreMsg, InternalEvent};

/// Single-slot trigger for the subscription recompute. The first call in a
/// window arms it; calls while armed are absorbed. When the window elapses
/// one `RecomputeSubscriptions` is delivered to the actor.
#[derive(Clone)]
pub struct Debouncer {
    pending: Arc<AtomicBool>,
    window: Duration,
    core_tx: flume::Sender<CoreMsg>,
    tracker: TaskTracker,
    cancel: CancellationToken,
}

impl Debouncer {
    pub fn new(
        window: Duration,
        core_tx: flume::Sender<CoreMsg>,
        tracker: TaskTracker,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            pending: Arc::new(AtomicBool::new(false)),
            window,
            core_tx,
            tracker,
            cancel,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::SeqCst)
    }

    /// Returns whether this call armed the trigger.
    pub fn trigger(&self) -> bool {
        if self
            .pending
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }
        let pending = self.pending.clone();
        let core_tx = self.core_tx.clone();
        let cancel = self.cancel.clone();
        let window = self.window;
        self.tracker.spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(window) => {
                    pending.store(false, Ordering::SeqCst);
                    tracing::debug!("debounced recompute fired");
                    let _ = core_tx.send(CoreMsg::Internal(Box::new(
                        InternalEvent::RecomputeSubscriptions,
                    )));
                }
            }
        });
        true
    }
}
