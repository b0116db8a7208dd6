//! The chunking operator.
//!
//! [`Chunker`] is the accumulator: items go in one at a time (or as an
//! iterator of any length) and full batches of exactly `chunk_size` come out.
//! [`ChunkStage`] wraps it in a stage task that pulls arbitrary-sized inputs
//! from upstream, runs them through an item-extraction function, and forwards
//! every full batch downstream.
//!
//! Target splitting runs as a [`ChunkStage`] fed by the single-item source.
//! Port splitting shares only the [`Chunker`] accumulator: the port splitter
//! feeds it a lazy [`PortSet`](crate::PortSet) iterator per target batch.

use super::{
    StageOutput,
    handoff::{Sent, recv, send},
    lifecycle::StageMonitor,
};
use crate::{
    error::{Error, Result},
    types::Batch,
};
use core::{marker::PhantomData, num::NonZeroUsize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Accumulates items into batches of a fixed size.
///
/// The buffer is owned by the chunker and never handed out; full batches are
/// moved out and replaced with a fresh allocation.
#[derive(Debug, Clone)]
pub struct Chunker<T> {
    chunk_size: NonZeroUsize,
    buf: Vec<T>,
}

impl<T> Chunker<T> {
    pub fn new(chunk_size: NonZeroUsize) -> Self {
        Self {
            chunk_size,
            buf: Vec::with_capacity(chunk_size.get()),
        }
    }

    pub const fn chunk_size(&self) -> usize {
        self.chunk_size.get()
    }

    /// Items accumulated but not yet emitted.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Adds one item, returning a full batch if this item completed one.
    pub fn push(&mut self, item: T) -> Option<Batch<T>> {
        self.buf.push(item);
        if self.buf.len() == self.chunk_size.get() {
            Some(self.take())
        } else {
            None
        }
    }

    /// Lazily feeds `items` through [`push`](Self::push), yielding each full
    /// batch as it completes. Items the returned iterator hasn't reached yet
    /// are not consumed.
    pub fn extend<'a, I>(&'a mut self, items: I) -> impl Iterator<Item = Batch<T>> + 'a
    where
        I: IntoIterator<Item = T>,
        I::IntoIter: 'a,
    {
        items.into_iter().filter_map(move |item| self.push(item))
    }

    /// Emits the remainder as a final, possibly short, batch.
    pub fn finish(&mut self) -> Option<Batch<T>> {
        if self.buf.is_empty() {
            None
        } else {
            Some(self.take())
        }
    }

    /// Drops the remainder without emitting it, returning how many items were
    /// discarded.
    pub fn discard(&mut self) -> usize {
        let dropped = self.buf.len();
        self.buf.clear();
        dropped
    }

    fn take(&mut self) -> Batch<T> {
        core::mem::replace(&mut self.buf, Vec::with_capacity(self.chunk_size.get()))
    }
}

/// A stage task that re-chunks whatever upstream sends.
///
/// `extract` turns one upstream value into the items to accumulate; for
/// target splitting it is the identity on single-item batches.
pub(crate) struct ChunkStage<In, T, F> {
    chunker: Chunker<T>,
    extract: F,
    cancel: CancellationToken,
    _in: PhantomData<fn(In)>,
}

impl<In, T, F, It> ChunkStage<In, T, F>
where
    In: Send,
    T: Send,
    F: FnMut(In) -> It + Send,
    It: IntoIterator<Item = T>,
    It::IntoIter: Send,
{
    pub(crate) fn new(chunk_size: NonZeroUsize, extract: F, cancel: CancellationToken) -> Self {
        Self {
            chunker: Chunker::new(chunk_size),
            extract,
            cancel,
            _in: PhantomData,
        }
    }

    pub(crate) async fn run(
        mut self,
        mut rx: mpsc::Receiver<In>,
        tx: mpsc::Sender<Batch<T>>,
        monitor: StageMonitor,
    ) -> Result<StageOutput> {
        let cancel = self.cancel;
        let mut emitted = 0_u64;

        'inputs: while let Some(input) = recv(&mut rx, &cancel).await {
            for batch in self.chunker.extend((self.extract)(input)) {
                tracing::trace!(len = batch.len(), "Emitting batch");
                match send(&tx, batch, &cancel).await {
                    Sent::Delivered => emitted += 1,
                    Sent::Cancelled => break 'inputs,
                    Sent::Closed => {
                        return Err(Error::ChannelError {
                            context: "chunk stage downstream closed".to_owned(),
                        });
                    }
                }
            }
        }

        monitor.drain();

        if cancel.is_cancelled() {
            let dropped = self.chunker.discard();
            tracing::debug!(emitted, dropped, "Chunk stage cancelled, remainder discarded");
            return Ok(StageOutput::Batches(emitted));
        }

        if let Some(batch) = self.chunker.finish() {
            tracing::trace!(len = batch.len(), "Flushing final batch");
            match send(&tx, batch, &cancel).await {
                Sent::Delivered => emitted += 1,
                Sent::Cancelled => {}
                Sent::Closed => {
                    return Err(Error::ChannelError {
                        context: "chunk stage downstream closed before flush".to_owned(),
                    });
                }
            }
        }

        tracing::debug!(emitted, "Chunk stage drained");
        Ok(StageOutput::Batches(emitted))
    }
}
