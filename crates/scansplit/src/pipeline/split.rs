use super::{
    PortedBatch, StageOutput,
    chunk::Chunker,
    handoff::{Sent, recv, send},
    lifecycle::StageMonitor,
};
use crate::{
    error::{Error, Result},
    ports::PortSet,
    types::{Batch, Port, Target},
};
use core::num::NonZeroUsize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Pairs every target batch with each port chunk of the configured port set.
///
/// Ports are streamed from the [`PortSet`] through a [`Chunker`] per target
/// batch, so neither the port list nor the target × port product is ever held
/// in memory. The last port chunk of each pass may be short.
pub(crate) struct PortSplitter {
    chunker: Chunker<Port>,
    ports: PortSet,
    cancel: CancellationToken,
}

impl PortSplitter {
    pub(crate) fn new(chunk_size: NonZeroUsize, ports: PortSet, cancel: CancellationToken) -> Self {
        Self {
            chunker: Chunker::new(chunk_size),
            ports,
            cancel,
        }
    }

    pub(crate) async fn run(
        mut self,
        mut rx: mpsc::Receiver<Arc<Batch<Target>>>,
        tx: mpsc::Sender<PortedBatch>,
        monitor: StageMonitor,
    ) -> Result<StageOutput> {
        let cancel = self.cancel.clone();
        let mut emitted = 0_u64;

        'targets: while let Some(targets) = recv(&mut rx, &cancel).await {
            for ports in self.chunker.extend(self.ports.iter()) {
                let batch = PortedBatch {
                    targets: Arc::clone(&targets),
                    ports,
                };
                if !forward(&tx, batch, &cancel).await? {
                    break 'targets;
                }
                emitted += 1;
            }

            if let Some(ports) = self.chunker.finish() {
                let batch = PortedBatch { targets, ports };
                if !forward(&tx, batch, &cancel).await? {
                    break 'targets;
                }
                emitted += 1;
            }
        }

        monitor.drain();
        if cancel.is_cancelled() {
            let dropped = self.chunker.discard();
            tracing::debug!(emitted, dropped, "Port splitter cancelled");
        } else {
            tracing::debug!(emitted, "Port splitter drained");
        }
        Ok(StageOutput::Batches(emitted))
    }
}

/// `Ok(false)` means cancellation was observed.
async fn forward(
    tx: &mpsc::Sender<PortedBatch>,
    batch: PortedBatch,
    cancel: &CancellationToken,
) -> Result<bool> {
    tracing::trace!(
        targets = batch.targets.len(),
        ports = batch.ports.len(),
        "Emitting port batch"
    );
    match send(tx, batch, cancel).await {
        Sent::Delivered => Ok(true),
        Sent::Cancelled => Ok(false),
        Sent::Closed => Err(Error::ChannelError {
            context: "port fan-out hand-off closed".to_owned(),
        }),
    }
}
