//! The staged decomposition pipeline.
//!
//! A [`Pipeline`] is a fixed chain of Tokio tasks connected by bounded
//! `mpsc` hand-offs:
//!
//! ```text
//! Source ─▶ Chunk(targets) ─▶ FanOut(port-less) ─▶ Sink per port-less topic
//!                                   │
//!                                   ▼
//!                            Chunk(ports) ─▶ FanOut(port-scoped) ─▶ Sink per topic
//! ```
//!
//! ## Responsibilities
//!
//! - Start every stage eagerly when the pipeline is spawned.
//! - Share one [`CancellationToken`] with every stage; each stage observes it
//!   at every receive, send, and admission wait.
//! - Let closure propagate: when the source runs dry it drops its sender,
//!   every stage drains in order, and [`Pipeline::wait`] returns once the last
//!   sink has exited.
//! - Release the queue connection exactly once, from whichever of
//!   [`Pipeline::wait`] or [`PipelineHandle::tidy`] gets there first.
//!
//! Nothing is persisted. Work still inside the stages when the process dies
//! is lost.

mod chunk;
mod fanout;
mod handoff;
mod lifecycle;
mod sink;
mod source;
mod split;
#[cfg(test)]
mod tests;

pub use chunk::Chunker;
pub use lifecycle::StageState;
pub use source::Source;

use crate::{
    config::PipelineConfig,
    error::{Error, Result},
    queue::Queue,
    types::{Batch, Port, Target},
};
use chunk::ChunkStage;
use core::{fmt, future::Future, num::NonZeroUsize};
use fanout::{FanOut, Route};
use lifecycle::{Lifecycle, StageMonitor};
use sink::AdmissionSink;
use std::{collections::BTreeMap, sync::Arc};
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::Instrument;

/// A target batch paired with one chunk of ports.
pub(crate) struct PortedBatch {
    pub(crate) targets: Arc<Batch<Target>>,
    pub(crate) ports: Batch<Port>,
}

/// What a stage reports when it exits cleanly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StageOutput {
    Done,
    Batches(u64),
    Units(u64),
    Delivered(u64),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum StageKind {
    Source,
    TargetChunker,
    TargetFanOut,
    PortSplitter,
    PortFanOut,
    Sink(String),
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Source => f.write_str("source"),
            Self::TargetChunker => f.write_str("target-chunker"),
            Self::TargetFanOut => f.write_str("target-fanout"),
            Self::PortSplitter => f.write_str("port-splitter"),
            Self::PortFanOut => f.write_str("port-fanout"),
            Self::Sink(topic) => write!(f, "sink:{topic}"),
        }
    }
}

/// Summary of a finished run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineReport {
    /// Batches emitted by the target chunker.
    pub target_batches: u64,
    /// (target batch, port batch) pairs emitted by the port splitter.
    pub port_batches: u64,
    /// Work units handed to sinks by both fan-outs.
    pub units_emitted: u64,
    /// Units the queue accepted, per topic.
    pub delivered: BTreeMap<String, u64>,
    /// `true` if the run was cut short by cancellation.
    pub cancelled: bool,
}

impl PipelineReport {
    pub fn total_delivered(&self) -> u64 {
        self.delivered.values().sum()
    }

    fn record(&mut self, kind: StageKind, output: StageOutput) {
        match (kind, output) {
            (StageKind::TargetChunker, StageOutput::Batches(n)) => self.target_batches = n,
            (StageKind::PortSplitter, StageOutput::Batches(n)) => self.port_batches = n,
            (StageKind::TargetFanOut | StageKind::PortFanOut, StageOutput::Units(n)) => {
                self.units_emitted += n;
            }
            (StageKind::Sink(topic), StageOutput::Delivered(n)) => {
                self.delivered.insert(topic, n);
            }
            _ => {}
        }
    }
}

/// A running decomposition of one target list.
///
/// Created with [`Pipeline::spawn`], which must be called from within a Tokio
/// runtime. [`Pipeline::wait`] consumes the pipeline, so it can only be awaited
/// once; use [`Pipeline::handle`] to cancel from elsewhere while waiting.
pub struct Pipeline<Q: Queue> {
    lifecycle: Arc<Lifecycle<Q>>,
    tasks: Vec<(StageKind, JoinHandle<Result<StageOutput>>)>,
}

impl<Q: Queue> Pipeline<Q> {
    /// Validates `config` and starts every stage.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if `targets` is empty or
    /// [`PipelineConfig::validate`] rejects `config`. No task is spawned in
    /// that case.
    pub fn spawn(targets: Vec<Target>, config: PipelineConfig, queue: Arc<Q>) -> Result<Self> {
        config.validate()?;
        if targets.is_empty() {
            return Err(Error::invalid("target list must not be empty"));
        }
        let (Some(target_chunk), Some(port_chunk)) = (
            NonZeroUsize::new(config.target_chunk_size),
            NonZeroUsize::new(config.port_chunk_size),
        ) else {
            return Err(Error::invalid("chunk sizes must be greater than 0"));
        };

        tracing::info!(
            targets = targets.len(),
            protocols = config.protocols.len(),
            ports = config.ports.len(),
            target_chunk = config.target_chunk_size,
            port_chunk = config.port_chunk_size,
            watermark = config.watermark,
            "Starting pipeline"
        );

        let mut pipeline = Self {
            lifecycle: Arc::new(Lifecycle::new(queue)),
            tasks: Vec::with_capacity(5 + config.protocols.len()),
        };
        let cancel = pipeline.lifecycle.token();
        let capacity = config.handoff_capacity;

        let (source_tx, source_rx) = mpsc::channel(capacity);
        let (chunk_tx, chunk_rx) = mpsc::channel(capacity);

        let source = Source::new(targets, cancel.clone());
        pipeline.start(StageKind::Source, |m| source.run(source_tx, m));

        let chunker = ChunkStage::new(target_chunk, |batch: Batch<Target>| batch, cancel.clone());
        pipeline.start(StageKind::TargetChunker, |m| chunker.run(source_rx, chunk_tx, m));

        let mut portless = Vec::new();
        let mut port_scoped = Vec::new();
        for protocol in &config.protocols {
            let (tx, rx) = mpsc::channel(capacity);
            let sink = AdmissionSink::new(
                protocol.topic(),
                Arc::clone(pipeline.lifecycle.queue()),
                &config,
                cancel.clone(),
            );
            let route = Route {
                protocol: protocol.clone(),
                tx,
            };
            if protocol.is_port_scoped() {
                port_scoped.push(route);
            } else {
                portless.push(route);
            }
            pipeline.start(StageKind::Sink(protocol.topic().to_owned()), |m| {
                sink.run(rx, m)
            });
        }

        let forward = if port_scoped.is_empty() {
            None
        } else {
            let (split_tx, split_rx) = mpsc::channel(capacity);
            let (ported_tx, ported_rx) = mpsc::channel(capacity);

            let splitter = split::PortSplitter::new(port_chunk, config.ports.clone(), cancel.clone());
            pipeline.start(StageKind::PortSplitter, |m| splitter.run(split_rx, ported_tx, m));

            let fanout = FanOut::new(port_scoped, cancel.clone());
            pipeline.start(StageKind::PortFanOut, |m| fanout.run_ports(ported_rx, m));

            Some(split_tx)
        };

        let fanout = FanOut::new(portless, cancel);
        pipeline.start(StageKind::TargetFanOut, |m| {
            fanout.run_targets(chunk_rx, forward, m)
        });

        Ok(pipeline)
    }

    /// Spawns a pipeline and waits for it to drain.
    pub async fn run(
        targets: Vec<Target>,
        config: PipelineConfig,
        queue: Arc<Q>,
    ) -> Result<PipelineReport> {
        Self::spawn(targets, config, queue)?.wait().await
    }

    fn start<F, Fut>(&mut self, kind: StageKind, stage: F)
    where
        F: FnOnce(StageMonitor) -> Fut,
        Fut: Future<Output = Result<StageOutput>> + Send + 'static,
    {
        let name = kind.to_string();
        let monitor = self.lifecycle.register(&name);
        let span = tracing::info_span!("stage", stage = %name);
        let handle = tokio::spawn(stage(monitor).instrument(span));
        self.tasks.push((kind, handle));
    }

    /// A cloneable handle for cancelling and inspecting this pipeline.
    pub fn handle(&self) -> PipelineHandle<Q> {
        PipelineHandle {
            lifecycle: Arc::clone(&self.lifecycle),
        }
    }

    /// Cancels the run and releases the queue. Idempotent.
    pub async fn tidy(&self) {
        self.lifecycle.tidy().await;
    }

    /// Waits until every stage has exited, then closes the queue connection.
    ///
    /// Stages exit either because the source ran dry and closure propagated
    /// through the chain, or because cancellation was observed. A cancelled run
    /// is not an error: the report has `cancelled` set.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PushFailed`] if a sink exhausted its retries, or
    /// [`Error::StageFailed`] / [`Error::ChannelError`] if a stage died. A
    /// push failure takes precedence when several stages fail.
    pub async fn wait(self) -> Result<PipelineReport> {
        let (kinds, handles): (Vec<_>, Vec<_>) = self.tasks.into_iter().unzip();
        let results = futures::future::join_all(handles).await;

        let mut report = PipelineReport::default();
        let mut errors = Vec::new();

        for (kind, result) in kinds.into_iter().zip(results) {
            match result {
                Ok(Ok(output)) => report.record(kind, output),
                Ok(Err(e)) => errors.push(e),
                Err(join_err) => errors.push(Error::StageFailed {
                    stage: kind.to_string(),
                    reason: join_err.to_string(),
                }),
            }
        }

        self.lifecycle.release_queue().await;
        report.cancelled = self.lifecycle.is_cancelled();

        if let Some(pos) = errors
            .iter()
            .position(|e| matches!(e, Error::PushFailed { .. }))
        {
            return Err(errors.swap_remove(pos));
        }
        if let Some(e) = errors.into_iter().next() {
            return Err(e);
        }

        tracing::info!(
            target_batches = report.target_batches,
            delivered = report.total_delivered(),
            cancelled = report.cancelled,
            "Pipeline drained"
        );
        Ok(report)
    }
}

/// Cancels and inspects a [`Pipeline`] from another task.
pub struct PipelineHandle<Q: Queue> {
    lifecycle: Arc<Lifecycle<Q>>,
}

impl<Q: Queue> Clone for PipelineHandle<Q> {
    fn clone(&self) -> Self {
        Self {
            lifecycle: Arc::clone(&self.lifecycle),
        }
    }
}

impl<Q: Queue> PipelineHandle<Q> {
    /// Fires cancellation, releases the queue connection, and discards stage
    /// bookkeeping.
    ///
    /// Safe to call any number of times, from any task, before or after
    /// [`Pipeline::wait`] returns; only the first call has an effect.
    pub async fn tidy(&self) {
        self.lifecycle.tidy().await;
    }

    /// Fires the cancellation broadcast without releasing the queue.
    ///
    /// Stages stop promptly; [`Pipeline::wait`] then returns and releases the
    /// queue itself.
    pub fn cancel(&self) {
        self.lifecycle.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.lifecycle.is_cancelled()
    }

    /// Current state of every stage, in start order. Empty after
    /// [`tidy`](Self::tidy).
    pub fn stage_states(&self) -> Vec<(String, StageState)> {
        self.lifecycle.stage_states()
    }
}
