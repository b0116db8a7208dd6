//! Cancellation-aware hand-offs between stages.
//!
//! Every blocking receive and send in the pipeline goes through these two
//! helpers so that a stage parked on a full or empty channel still notices the
//! shared [`CancellationToken`]. Both use a `biased` select so cancellation
//! always wins over a ready channel.

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Outcome of a downstream send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Sent {
    Delivered,
    /// Cancellation was observed; the item was dropped.
    Cancelled,
    /// The downstream stage is gone.
    Closed,
}

/// Receives the next item, or `None` if upstream closed or cancellation was
/// observed. Callers distinguish the two with [`CancellationToken::is_cancelled`].
pub(crate) async fn recv<T>(rx: &mut mpsc::Receiver<T>, cancel: &CancellationToken) -> Option<T> {
    tokio::select! {
        biased;
        () = cancel.cancelled() => None,
        item = rx.recv() => item,
    }
}

/// Sends `item` downstream, waiting for capacity unless cancelled first.
pub(crate) async fn send<T>(tx: &mpsc::Sender<T>, item: T, cancel: &CancellationToken) -> Sent {
    if cancel.is_cancelled() {
        return Sent::Cancelled;
    }

    tokio::select! {
        biased;
        () = cancel.cancelled() => Sent::Cancelled,
        res = tx.send(item) => match res {
            Ok(()) => Sent::Delivered,
            Err(_) => Sent::Closed,
        },
    }
}
