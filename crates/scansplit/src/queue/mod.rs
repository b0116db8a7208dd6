//! The broker seam.
//!
//! The pipeline never talks to a broker directly; it goes through [`Queue`],
//! which a deployment implements on top of its client library. Each method is
//! called independently from several sink tasks at once, so implementations
//! must be safe under concurrent use, but no call spans more than one
//! operation.
//!
//! [`MemoryQueue`] is an in-process implementation used by tests and the CLI
//! dry run.

mod memory;

pub use memory::MemoryQueue;

use crate::{error::QueueError, types::WorkUnit};
use core::future::Future;

/// A topic-addressed work queue with a depth probe.
pub trait Queue: Send + Sync + 'static {
    /// Pushes one work unit onto `topic`.
    ///
    /// A returned error means the unit was not accepted; the pipeline may
    /// retry it. An `Ok` counts the unit as delivered.
    fn push(
        &self,
        topic: &str,
        unit: &WorkUnit,
    ) -> impl Future<Output = Result<(), QueueError>> + Send;

    /// Current outstanding (not yet acknowledged) count for `topic`.
    fn depth(&self, topic: &str) -> impl Future<Output = Result<usize, QueueError>> + Send;

    /// Releases connection resources. Called at most once per pipeline.
    fn close(&self) -> impl Future<Output = ()> + Send;
}
