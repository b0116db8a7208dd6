//! Error types for the decomposition pipeline.
//!
//! This module defines the central [`Error`] enum, which captures every fatal
//! or reportable condition a [`Pipeline`](crate::Pipeline) can surface, and
//! [`QueueError`], which is what a [`Queue`](crate::Queue) implementation
//! returns when the broker misbehaves.
//!
//! ## Error Cases
//! - `InvalidConfig`: The pipeline was constructed with unusable settings.
//! - `PushFailed`: A work unit could not be delivered after every retry.
//! - `ChannelError`: A hand-off between stages closed unexpectedly.
//! - `StageFailed`: A stage task panicked or was aborted.
//!
//! A [`QueueError`] only reaches the caller as the source of `PushFailed`.
//!
//! Cancellation is deliberately absent: a cancelled run is a truncated but
//! clean run and is reported through
//! [`PipelineReport::cancelled`](crate::PipelineReport::cancelled).

pub type Result<T> = core::result::Result<T, Error>;

/// Unified error type for the decomposition pipeline.
#[derive(Clone, thiserror::Error, Debug)]
pub enum Error {
    /// The pipeline configuration or input was rejected at construction.
    #[error("Invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    /// A push kept failing until the retry budget was exhausted.
    #[error("Push to topic `{topic}` failed after {attempts} attempts: {source}")]
    PushFailed {
        topic: String,
        attempts: u32,
        #[source]
        source: QueueError,
    },

    /// Internal channel send/receive failure between stages.
    #[error("Channel error: {context}")]
    ChannelError { context: String },

    /// A stage task terminated abnormally.
    #[error("Stage `{stage}` failed: {reason}")]
    StageFailed { stage: String, reason: String },
}

/// Failure reported by a [`Queue`](crate::Queue) collaborator.
#[derive(Clone, thiserror::Error, Debug, PartialEq, Eq)]
pub enum QueueError {
    /// The broker could not be reached. Retried.
    #[error("queue unavailable: {0}")]
    Unavailable(String),

    /// The broker refused the payload. Retried.
    #[error("push rejected: {0}")]
    Rejected(String),

    /// The connection was closed locally.
    #[error("queue connection closed")]
    Closed,
}

impl Error {
    pub(crate) fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }
}
