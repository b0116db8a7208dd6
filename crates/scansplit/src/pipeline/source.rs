use super::{
    StageOutput,
    handoff::{Sent, send},
    lifecycle::StageMonitor,
};
use crate::{
    error::{Error, Result},
    types::{Batch, Target},
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Head of the pipeline: yields each target as a single-item batch.
///
/// The source owns its input and is consumed as it runs, so a finished (or
/// cancelled) source cannot be restarted. Cancellation is checked before every
/// emission.
#[derive(Debug)]
pub struct Source {
    targets: std::vec::IntoIter<Target>,
    cancel: CancellationToken,
}

impl Source {
    pub fn new(targets: Vec<Target>, cancel: CancellationToken) -> Self {
        Self {
            targets: targets.into_iter(),
            cancel,
        }
    }

    /// Targets not yet emitted.
    pub fn remaining(&self) -> usize {
        self.targets.len()
    }

    pub(crate) async fn run(
        mut self,
        tx: mpsc::Sender<Batch<Target>>,
        monitor: StageMonitor,
    ) -> Result<StageOutput> {
        tracing::debug!(targets = self.remaining(), "Source started");
        let cancel = self.cancel.clone();
        let mut emitted = 0_u64;

        while let Some(batch) = self.next() {
            match send(&tx, batch, &cancel).await {
                Sent::Delivered => emitted += 1,
                Sent::Cancelled => break,
                Sent::Closed => {
                    return Err(Error::ChannelError {
                        context: "target chunker hand-off closed".to_owned(),
                    });
                }
            }
        }

        monitor.drain();
        if cancel.is_cancelled() {
            tracing::debug!(
                emitted,
                skipped = self.remaining(),
                "Source cancelled"
            );
        } else {
            tracing::debug!(emitted, "Source exhausted");
        }
        Ok(StageOutput::Done)
    }
}

impl Iterator for Source {
    type Item = Batch<Target>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cancel.is_cancelled() {
            return None;
        }
        self.targets.next().map(|target| vec![target])
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(self.targets.len()))
    }
}
