//! Cancellation, stage state tracking, and queue release.
//!
//! [`Lifecycle`] is shared by the [`Pipeline`](super::Pipeline), every
//! [`PipelineHandle`](super::PipelineHandle), and (through its token) every
//! stage. It guarantees that the cancellation broadcast and the queue
//! shutdown each happen at most once no matter how many callers race to
//! trigger them.

use crate::queue::Queue;
use parking_lot::Mutex;
use portable_atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Per-stage state. Transitions only move forward:
/// `Running → Draining → Closed`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum StageState {
    /// Consuming upstream and emitting downstream.
    Running = 0,
    /// Upstream closed or cancellation observed; any final flush is pending.
    Draining = 1,
    /// Terminal. The stage's downstream hand-off is dropped.
    Closed = 2,
}

impl StageState {
    const fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Running,
            1 => Self::Draining,
            _ => Self::Closed,
        }
    }
}

/// Owned by a stage task. Dropping it marks the stage closed, which also
/// covers panics and aborted tasks.
#[derive(Debug)]
pub(crate) struct StageMonitor {
    state: Arc<AtomicU8>,
}

impl StageMonitor {
    /// Moves the stage to [`StageState::Draining`] unless it is already there.
    pub(crate) fn drain(&self) {
        let prev = self
            .state
            .fetch_max(StageState::Draining as u8, Ordering::AcqRel);
        if prev == StageState::Running as u8 {
            tracing::debug!("Stage draining");
        }
    }

    #[cfg(test)]
    pub(crate) fn detached() -> Self {
        Self {
            state: Arc::new(AtomicU8::new(StageState::Running as u8)),
        }
    }
}

impl Drop for StageMonitor {
    fn drop(&mut self) {
        self.state
            .store(StageState::Closed as u8, Ordering::Release);
        tracing::debug!("Stage closed");
    }
}

pub(crate) struct Lifecycle<Q> {
    cancel: CancellationToken,
    queue: Arc<Q>,
    queue_released: AtomicBool,
    tidied: AtomicBool,
    stages: Mutex<Vec<(String, Arc<AtomicU8>)>>,
}

impl<Q: Queue> Lifecycle<Q> {
    pub(crate) fn new(queue: Arc<Q>) -> Self {
        Self {
            cancel: CancellationToken::new(),
            queue,
            queue_released: AtomicBool::new(false),
            tidied: AtomicBool::new(false),
            stages: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub(crate) fn queue(&self) -> &Arc<Q> {
        &self.queue
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Fires the cancellation broadcast. Repeated calls are no-ops.
    pub(crate) fn cancel(&self) {
        if !self.cancel.is_cancelled() {
            tracing::info!("Cancelling pipeline");
        }
        self.cancel.cancel();
    }

    pub(crate) fn register(&self, name: &str) -> StageMonitor {
        let state = Arc::new(AtomicU8::new(StageState::Running as u8));
        self.stages.lock().push((name.to_owned(), Arc::clone(&state)));
        StageMonitor { state }
    }

    pub(crate) fn stage_states(&self) -> Vec<(String, StageState)> {
        self.stages
            .lock()
            .iter()
            .map(|(name, state)| {
                (
                    name.clone(),
                    StageState::from_u8(state.load(Ordering::Acquire)),
                )
            })
            .collect()
    }

    /// Closes the queue connection exactly once across `wait` and `tidy`.
    pub(crate) async fn release_queue(&self) {
        if self.queue_released.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::debug!("Closing queue connection");
        self.queue.close().await;
    }

    /// Cancels, releases the queue, and forgets stage bookkeeping.
    ///
    /// Only the first call does anything.
    pub(crate) async fn tidy(&self) {
        if self.tidied.swap(true, Ordering::AcqRel) {
            tracing::trace!("Pipeline already tidied");
            return;
        }
        self.cancel();
        self.release_queue().await;
        self.stages.lock().clear();
        tracing::info!("Pipeline tidied");
    }
}
