use anyhow::{Context, bail};
use clap::{Parser, ValueEnum};
use core::time::Duration;
use scansplit::{
    DEFAULT_HANDOFF_CAPACITY, DEFAULT_PORT_CHUNK_SIZE, DEFAULT_TARGET_CHUNK_SIZE,
    DEFAULT_WATERMARK, PipelineConfig, PortSet, Protocol, RetryPolicy, Target,
};
use std::path::PathBuf;

/// Output format for log lines written to stderr.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Multi-line, human-readable output with file and thread metadata.
    #[default]
    Pretty,
    /// Single-line, human-readable output.
    Compact,
    /// One JSON object per event, for log shippers.
    Json,
}

/// Runtime configuration for the `scansplit` binary.
///
/// Every value can come from a CLI flag or its environment variable; flags
/// win. Defaults mirror [`PipelineConfig::default`].
#[derive(Parser, Debug, Clone)]
#[command(
    name = "scansplit",
    version,
    about = "Decompose a network scan into bounded work units and drain them with simulated engines"
)]
pub struct CliArgs {
    /// Target to scan. Repeat the flag or pass a comma-separated list.
    ///
    /// Environment variable: `TARGETS`
    #[arg(short, long = "target", env = "TARGETS", value_delimiter = ',')]
    pub targets: Vec<String>,

    /// File with one target per line. Blank lines and `#` comments are
    /// skipped. Targets from the file follow those given with `--target`.
    ///
    /// Environment variable: `TARGETS_FILE`
    #[arg(short = 'f', long, env = "TARGETS_FILE")]
    pub targets_file: Option<PathBuf>,

    /// Ports to probe for port-scoped protocols, e.g. `22,80,8000-8100`.
    ///
    /// Environment variable: `PORTS`
    #[arg(short, long, env = "PORTS", default_value_t = String::from("1-1024"))]
    pub ports: String,

    /// Protocols to emit work for. `icmp`, `icmpv6`, `arp` and `ping` are
    /// port-less; append `:noports` to force any other tag port-less.
    ///
    /// Environment variable: `PROTOCOLS`
    #[arg(long, env = "PROTOCOLS", value_delimiter = ',', default_value = "tcp,icmp")]
    pub protocols: Vec<String>,

    /// Maximum number of targets per work unit.
    ///
    /// Environment variable: `TARGET_CHUNK_SIZE`
    #[arg(long, env = "TARGET_CHUNK_SIZE", default_value_t = DEFAULT_TARGET_CHUNK_SIZE)]
    pub target_chunk_size: usize,

    /// Maximum number of ports per work unit.
    ///
    /// Environment variable: `PORT_CHUNK_SIZE`
    #[arg(long, env = "PORT_CHUNK_SIZE", default_value_t = DEFAULT_PORT_CHUNK_SIZE)]
    pub port_chunk_size: usize,

    /// Outstanding units per topic at which pushes are held back.
    ///
    /// Environment variable: `WATERMARK`
    #[arg(long, env = "WATERMARK", default_value_t = DEFAULT_WATERMARK)]
    pub watermark: usize,

    /// Capacity of each bounded hand-off between pipeline stages. Lower
    /// values make backpressure bite sooner.
    ///
    /// Environment variable: `HANDOFF_CAPACITY`
    #[arg(long, env = "HANDOFF_CAPACITY", default_value_t = DEFAULT_HANDOFF_CAPACITY)]
    pub handoff_capacity: usize,

    /// Milliseconds between depth re-checks while a topic is at its
    /// watermark.
    ///
    /// Environment variable: `ADMISSION_POLL_MS`
    #[arg(long, env = "ADMISSION_POLL_MS", default_value_t = 250)]
    pub admission_poll_ms: u64,

    /// Attempts per push before the run fails.
    ///
    /// Environment variable: `RETRY_ATTEMPTS`
    #[arg(long, env = "RETRY_ATTEMPTS", default_value_t = 5)]
    pub retry_attempts: u32,

    /// Backoff before the second attempt, in milliseconds. Doubles per
    /// attempt.
    ///
    /// Environment variable: `RETRY_BASE_MS`
    #[arg(long, env = "RETRY_BASE_MS", default_value_t = 100)]
    pub retry_base_ms: u64,

    /// Upper bound on a single backoff, in milliseconds.
    ///
    /// Environment variable: `RETRY_MAX_MS`
    #[arg(long, env = "RETRY_MAX_MS", default_value_t = 5_000)]
    pub retry_max_ms: u64,

    /// Simulated engines draining each topic.
    ///
    /// Environment variable: `CONSUMERS_PER_TOPIC`
    #[arg(long, env = "CONSUMERS_PER_TOPIC", default_value_t = 1)]
    pub consumers_per_topic: usize,

    /// Units per second each engine consumes. `0` means unthrottled.
    ///
    /// Environment variable: `CONSUME_RATE`
    #[arg(long, env = "CONSUME_RATE", default_value_t = 0)]
    pub consume_rate: u32,

    /// Log output format.
    ///
    /// Environment variable: `LOG_FORMAT`
    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Pretty)]
    pub log_format: LogFormat,
}

#[derive(Debug, Clone)]
pub struct RunConfig {
    pub pipeline: PipelineConfig,
    pub targets: Vec<Target>,
    pub targets_file: Option<PathBuf>,
    pub consumers_per_topic: usize,
    /// Delay between units per engine; `None` when unthrottled.
    pub consume_interval: Option<Duration>,
    pub log_format: LogFormat,
}

impl TryFrom<CliArgs> for RunConfig {
    type Error = anyhow::Error;

    fn try_from(args: CliArgs) -> Result<Self, Self::Error> {
        if args.targets.is_empty() && args.targets_file.is_none() {
            bail!("No targets given; pass --target or --targets-file");
        }

        if args.consumers_per_topic == 0 {
            bail!("CONSUMERS_PER_TOPIC must be greater than 0");
        }

        if args.retry_base_ms > args.retry_max_ms {
            bail!(
                "RETRY_BASE_MS ({}) exceeds RETRY_MAX_MS ({})",
                args.retry_base_ms,
                args.retry_max_ms
            );
        }

        let ports: PortSet = args
            .ports
            .parse()
            .with_context(|| format!("Invalid PORTS `{}`", args.ports))?;

        let protocols = args
            .protocols
            .iter()
            .map(|p| p.parse::<Protocol>())
            .collect::<Result<Vec<_>, _>>()
            .context("Invalid PROTOCOLS")?;

        let pipeline = PipelineConfig {
            target_chunk_size: args.target_chunk_size,
            port_chunk_size: args.port_chunk_size,
            ports,
            protocols,
            watermark: args.watermark,
            handoff_capacity: args.handoff_capacity,
            admission_poll_interval: Duration::from_millis(args.admission_poll_ms),
            retry: RetryPolicy {
                max_attempts: args.retry_attempts,
                base_backoff: Duration::from_millis(args.retry_base_ms),
                max_backoff: Duration::from_millis(args.retry_max_ms),
            },
        };
        pipeline.validate()?;

        let consume_interval = (args.consume_rate > 0)
            .then(|| Duration::from_secs(1) / args.consume_rate);

        Ok(Self {
            pipeline,
            targets: args
                .targets
                .into_iter()
                .map(|t| t.trim().to_owned())
                .filter(|t| !t.is_empty())
                .collect(),
            targets_file: args.targets_file,
            consumers_per_topic: args.consumers_per_topic,
            consume_interval,
            log_format: args.log_format,
        })
    }
}
