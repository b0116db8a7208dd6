//! Pipeline configuration.
//!
//! [`PipelineConfig`] carries every tunable the stages need. The defaults are
//! suitable for a single broker fed by a modest consumer fleet; all values are
//! plain scalars so a binary can map CLI flags onto them directly.

use crate::{
    error::{Error, Result},
    ports::PortSet,
    types::Protocol,
};
use core::time::Duration;

/// Default number of targets per work unit.
pub const DEFAULT_TARGET_CHUNK_SIZE: usize = 256;
/// Default number of ports per work unit.
pub const DEFAULT_PORT_CHUNK_SIZE: usize = 1024;
/// Default outstanding depth above which pushes are held back.
pub const DEFAULT_WATERMARK: usize = 500;
/// Default capacity of each bounded hand-off between stages.
pub const DEFAULT_HANDOFF_CAPACITY: usize = 4;
/// Default delay between admission re-checks.
pub const DEFAULT_ADMISSION_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Bounded exponential backoff applied to failed pushes and depth probes.
///
/// Attempt `n` (1-based) that fails sleeps `base_backoff * 2^(n-1)`, capped at
/// `max_backoff`, before attempt `n + 1`. After `max_attempts` failures the
/// error is surfaced.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Delay to sleep after the given failed attempt (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(31);
        self.base_backoff
            .checked_mul(1_u32 << shift)
            .map_or(self.max_backoff, |d| d.min(self.max_backoff))
    }
}

/// Settings for a single [`Pipeline`](crate::Pipeline) run.
#[derive(Clone, Debug)]
pub struct PipelineConfig {
    /// Targets per work unit.
    pub target_chunk_size: usize,
    /// Ports per work unit for port-scoped protocols.
    pub port_chunk_size: usize,
    /// Ports every port-scoped protocol is expanded over.
    pub ports: PortSet,
    /// Protocols to fan out to. Each protocol tag is a queue topic.
    pub protocols: Vec<Protocol>,
    /// Outstanding depth per topic at which the sink stops pushing.
    pub watermark: usize,
    /// Capacity of every bounded hand-off between stages.
    pub handoff_capacity: usize,
    /// How long a sink sleeps before re-probing a topic at the watermark.
    pub admission_poll_interval: Duration,
    pub retry: RetryPolicy,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            target_chunk_size: DEFAULT_TARGET_CHUNK_SIZE,
            port_chunk_size: DEFAULT_PORT_CHUNK_SIZE,
            ports: PortSet::new(),
            protocols: Vec::new(),
            watermark: DEFAULT_WATERMARK,
            handoff_capacity: DEFAULT_HANDOFF_CAPACITY,
            admission_poll_interval: DEFAULT_ADMISSION_POLL_INTERVAL,
            retry: RetryPolicy::default(),
        }
    }
}

impl PipelineConfig {
    /// Returns `true` if any configured protocol needs the port dimension.
    pub fn has_port_scoped(&self) -> bool {
        self.protocols.iter().any(Protocol::is_port_scoped)
    }

    /// Checks the configuration for values the pipeline cannot run with.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if:
    /// - Any chunk size, the watermark, the hand-off capacity, or the attempt
    ///   limit is zero.
    /// - No protocols are configured, or a topic is configured twice.
    /// - A port-scoped protocol is configured with an empty port set.
    pub fn validate(&self) -> Result<()> {
        if self.target_chunk_size == 0 {
            return Err(Error::invalid("target_chunk_size must be greater than 0"));
        }
        if self.port_chunk_size == 0 {
            return Err(Error::invalid("port_chunk_size must be greater than 0"));
        }
        if self.watermark == 0 {
            return Err(Error::invalid("watermark must be greater than 0"));
        }
        if self.handoff_capacity == 0 {
            return Err(Error::invalid("handoff_capacity must be greater than 0"));
        }
        if self.retry.max_attempts == 0 {
            return Err(Error::invalid("retry.max_attempts must be greater than 0"));
        }
        if self.protocols.is_empty() {
            return Err(Error::invalid("at least one protocol is required"));
        }

        for (i, protocol) in self.protocols.iter().enumerate() {
            if self.protocols[..i]
                .iter()
                .any(|p| p.topic() == protocol.topic())
            {
                return Err(Error::invalid(format!(
                    "protocol `{}` is configured more than once",
                    protocol.tag()
                )));
            }
        }

        if self.has_port_scoped() && self.ports.is_empty() {
            return Err(Error::invalid(
                "port-scoped protocols require a non-empty port set",
            ));
        }

        Ok(())
    }
}
