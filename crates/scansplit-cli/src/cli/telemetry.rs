//! Structured logging for the `scansplit` binary.
//!
//! Events are written to stderr so stdout stays a clean stream of JSON work
//! units. Filtering comes from `RUST_LOG` and defaults to `info`.
//!
//! ## Formats
//!
//! - `pretty`: multi-line output with thread ID, file, and line number,
//!   timestamped in local time (RFC 3339).
//! - `compact`: one line per event.
//! - `json`: one JSON object per event, including the current stage span.

use super::config::LogFormat;
use std::io;
use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

pub fn init_telemetry(format: LogFormat) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());

    let layer = match format {
        LogFormat::Pretty => fmt::layer()
            .with_writer(io::stderr)
            .with_thread_ids(true)
            .with_line_number(true)
            .with_target(false)
            .with_timer(fmt::time::ChronoLocal::rfc_3339())
            .with_file(true)
            .pretty()
            .boxed(),
        LogFormat::Compact => fmt::layer()
            .with_writer(io::stderr)
            .with_target(false)
            .compact()
            .boxed(),
        LogFormat::Json => fmt::layer()
            .with_writer(io::stderr)
            .json()
            .with_current_span(true)
            .with_span_list(false)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(layer)
        .with(filter)
        .try_init()?;

    Ok(())
}
