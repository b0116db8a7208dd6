//! Simulated scan engines.
//!
//! An [`Engine`] stands in for a scanner subscribed to one topic: it pops
//! work units from the [`MemoryQueue`], optionally throttled to a fixed rate,
//! and writes each one as a JSON line. Engines exit when the queue is closed
//! and their topic is drained, or immediately when told to stop.

use anyhow::Context;
use core::time::Duration;
use scansplit::MemoryQueue;
use std::{io::Write, sync::Arc};
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;

pub struct Engine<W> {
    id: usize,
    topic: String,
    queue: Arc<MemoryQueue>,
    pace: Option<Duration>,
    stop: CancellationToken,
    out: W,
}

impl<W: Write> Engine<W> {
    pub fn new(
        id: usize,
        topic: impl Into<String>,
        queue: Arc<MemoryQueue>,
        pace: Option<Duration>,
        stop: CancellationToken,
        out: W,
    ) -> Self {
        Self {
            id,
            topic: topic.into(),
            queue,
            pace,
            stop,
            out,
        }
    }

    /// Consumes units until the topic is closed and drained or `stop` fires.
    /// Returns the number of units consumed.
    pub async fn run(mut self) -> anyhow::Result<u64> {
        let mut ticker = self.pace.map(|period| {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker
        });
        let mut consumed = 0_u64;

        loop {
            if let Some(ticker) = ticker.as_mut() {
                tokio::select! {
                    biased;
                    () = self.stop.cancelled() => break,
                    _ = ticker.tick() => {}
                }
            }

            let unit = tokio::select! {
                biased;
                () = self.stop.cancelled() => break,
                unit = self.queue.recv(&self.topic) => match unit {
                    Some(unit) => unit,
                    None => break,
                },
            };

            // One write per line so concurrent engines never interleave.
            let mut line = serde_json::to_vec(&unit).context("Failed to encode work unit")?;
            line.push(b'\n');
            self.out
                .write_all(&line)
                .context("Failed to write work unit")?;
            consumed += 1;

            tracing::trace!(
                topic = %self.topic,
                engine = self.id,
                probes = unit.probes(),
                "Consumed work unit"
            );
        }

        self.out.flush()?;
        tracing::debug!(topic = %self.topic, engine = self.id, consumed, "Engine stopped");
        Ok(consumed)
    }
}
