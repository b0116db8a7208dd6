//! Admission-controlled delivery to the queue.
//!
//! One [`AdmissionSink`] runs per topic. Before every push it probes the
//! topic's outstanding depth and holds the unit back while the depth is at or
//! above the watermark, re-checking every `admission_poll_interval`. Holding
//! back stops the sink from draining its hand-off, which blocks the fan-out,
//! which blocks the splitters, and so on up to the source.
//!
//! The probe and the push are separate calls, so concurrent producers on the
//! same topic can overshoot the watermark by a few units. That margin is
//! accepted; there is no atomic check-and-push.
//!
//! Failed probes and pushes are retried under the configured [`RetryPolicy`].
//! When the budget is spent the sink fires the pipeline's cancellation token,
//! so upstream stops producing work nobody can absorb, and reports
//! [`Error::PushFailed`].

use super::{StageOutput, handoff::recv, lifecycle::StageMonitor};
use crate::{
    config::{PipelineConfig, RetryPolicy},
    error::{Error, QueueError, Result},
    queue::Queue,
    types::WorkUnit,
};
use core::time::Duration;
use std::sync::Arc;
use tokio::{sync::mpsc, time::sleep};
use tokio_util::sync::CancellationToken;

/// What happened to a unit handed to [`AdmissionSink::deliver`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Delivery {
    Pushed,
    Cancelled,
}

pub(crate) struct AdmissionSink<Q> {
    topic: String,
    queue: Arc<Q>,
    watermark: usize,
    poll_interval: Duration,
    retry: RetryPolicy,
    cancel: CancellationToken,
}

impl<Q: Queue> AdmissionSink<Q> {
    pub(crate) fn new(
        topic: &str,
        queue: Arc<Q>,
        config: &PipelineConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            topic: topic.to_owned(),
            queue,
            watermark: config.watermark,
            poll_interval: config.admission_poll_interval,
            retry: config.retry.clone(),
            cancel,
        }
    }

    pub(crate) async fn run(
        self,
        mut rx: mpsc::Receiver<WorkUnit>,
        monitor: StageMonitor,
    ) -> Result<StageOutput> {
        let mut delivered = 0_u64;

        while let Some(unit) = recv(&mut rx, &self.cancel).await {
            match self.deliver(&unit).await {
                Ok(Delivery::Pushed) => delivered += 1,
                Ok(Delivery::Cancelled) => break,
                Err(e) => {
                    tracing::error!(topic = %self.topic, delivered, "Giving up on topic: {e}");
                    self.cancel.cancel();
                    monitor.drain();
                    return Err(e);
                }
            }
        }

        monitor.drain();
        tracing::debug!(topic = %self.topic, delivered, "Sink drained");
        Ok(StageOutput::Delivered(delivered))
    }

    /// Waits for admission and pushes `unit`, retrying failures.
    async fn deliver(&self, unit: &WorkUnit) -> Result<Delivery> {
        let mut attempt = 0;

        loop {
            attempt += 1;

            let err = match self.admit().await {
                Ok(false) => return Ok(Delivery::Cancelled),
                Ok(true) if self.cancel.is_cancelled() => return Ok(Delivery::Cancelled),
                Ok(true) => match self.queue.push(&self.topic, unit).await {
                    Ok(()) => {
                        tracing::trace!(
                            topic = %self.topic,
                            targets = unit.targets.len(),
                            "Pushed work unit"
                        );
                        return Ok(Delivery::Pushed);
                    }
                    Err(e) => e,
                },
                Err(e) => e,
            };

            // Failures caused by a concurrent tidy are not worth reporting.
            if self.cancel.is_cancelled() {
                return Ok(Delivery::Cancelled);
            }

            if attempt >= self.retry.max_attempts {
                return Err(Error::PushFailed {
                    topic: self.topic.clone(),
                    attempts: attempt,
                    source: err,
                });
            }

            let delay = self.retry.backoff(attempt);
            tracing::warn!(
                topic = %self.topic,
                attempt,
                max_attempts = self.retry.max_attempts,
                ?delay,
                "Queue operation failed, retrying: {err}"
            );

            tokio::select! {
                biased;
                () = self.cancel.cancelled() => return Ok(Delivery::Cancelled),
                () = sleep(delay) => {}
            }
        }
    }

    /// Blocks until the topic's depth is below the watermark.
    ///
    /// Returns `Ok(false)` if cancellation was observed while waiting,
    /// including while a depth probe is in flight.
    async fn admit(&self) -> core::result::Result<bool, QueueError> {
        loop {
            if self.cancel.is_cancelled() {
                return Ok(false);
            }

            // Probes are side-effect free and may be dropped mid-flight.
            let depth = tokio::select! {
                biased;
                () = self.cancel.cancelled() => return Ok(false),
                depth = self.queue.depth(&self.topic) => depth?,
            };
            if depth < self.watermark {
                return Ok(true);
            }

            tracing::trace!(
                topic = %self.topic,
                depth,
                watermark = self.watermark,
                "Topic at watermark, holding"
            );

            tokio::select! {
                biased;
                () = self.cancel.cancelled() => return Ok(false),
                () = sleep(self.poll_interval) => {}
            }
        }
    }
}
