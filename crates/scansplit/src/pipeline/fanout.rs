use super::{
    PortedBatch, StageOutput,
    handoff::{Sent, recv, send},
    lifecycle::StageMonitor,
};
use crate::{
    error::{Error, Result},
    types::{Batch, Port, Protocol, Target, WorkUnit},
};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// A protocol and the hand-off to the sink that owns its topic.
pub(crate) struct Route {
    pub(crate) protocol: Protocol,
    pub(crate) tx: mpsc::Sender<WorkUnit>,
}

/// Turns batches into one [`WorkUnit`] per routed protocol.
///
/// Two instances run per pipeline. The target fan-out sees every target batch
/// once and serves port-less protocols (`ports: None`) before forwarding the
/// batch to port splitting; the port fan-out serves port-scoped protocols for
/// each (target batch, port batch) pair. Port-less work therefore scales with
/// target batches only, never with port chunks.
pub(crate) struct FanOut {
    routes: Vec<Route>,
    cancel: CancellationToken,
    emitted: u64,
}

impl FanOut {
    pub(crate) fn new(routes: Vec<Route>, cancel: CancellationToken) -> Self {
        Self {
            routes,
            cancel,
            emitted: 0,
        }
    }

    /// Emits one unit per route. `Ok(false)` means cancellation was observed.
    async fn emit(&mut self, targets: &[Target], ports: Option<&[Port]>) -> Result<bool> {
        for route in &self.routes {
            let unit = WorkUnit {
                targets: targets.to_vec(),
                ports: ports.map(<[Port]>::to_vec),
                protocol: route.protocol.tag().to_owned(),
            };
            match send(&route.tx, unit, &self.cancel).await {
                Sent::Delivered => self.emitted += 1,
                Sent::Cancelled => return Ok(false),
                Sent::Closed => {
                    return Err(Error::ChannelError {
                        context: format!("sink for topic `{}` closed", route.protocol.topic()),
                    });
                }
            }
        }
        Ok(true)
    }

    /// Runs the target fan-out, forwarding each batch to port splitting when
    /// `forward` is set.
    pub(crate) async fn run_targets(
        mut self,
        mut rx: mpsc::Receiver<Batch<Target>>,
        forward: Option<mpsc::Sender<Arc<Batch<Target>>>>,
        monitor: StageMonitor,
    ) -> Result<StageOutput> {
        let cancel = self.cancel.clone();

        while let Some(targets) = recv(&mut rx, &cancel).await {
            if !self.emit(&targets, None).await? {
                break;
            }

            if let Some(forward) = &forward {
                match send(forward, Arc::new(targets), &cancel).await {
                    Sent::Delivered => {}
                    Sent::Cancelled => break,
                    Sent::Closed => {
                        return Err(Error::ChannelError {
                            context: "port splitter hand-off closed".to_owned(),
                        });
                    }
                }
            }
        }

        monitor.drain();
        tracing::debug!(emitted = self.emitted, "Target fan-out drained");
        Ok(StageOutput::Units(self.emitted))
    }

    /// Runs the port fan-out.
    pub(crate) async fn run_ports(
        mut self,
        mut rx: mpsc::Receiver<PortedBatch>,
        monitor: StageMonitor,
    ) -> Result<StageOutput> {
        let cancel = self.cancel.clone();

        while let Some(batch) = recv(&mut rx, &cancel).await {
            if !self.emit(&batch.targets, Some(&batch.ports)).await? {
                break;
            }
        }

        monitor.drain();
        tracing::debug!(emitted = self.emitted, "Port fan-out drained");
        Ok(StageOutput::Units(self.emitted))
    }
}
