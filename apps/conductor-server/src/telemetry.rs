//! Logging initialization

use anyhow::{Context, Result};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::cli::Args;

/// Held for the lifetime of the process
pub struct TelemetryGuards;

/// `RUST_LOG` wins over `--log-level` when set
pub fn init_telemetry(args: &Args) -> Result<TelemetryGuards> {
    let env_filter = build_filter(&args.log_level)?;

    if args.json_logs {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json().with_target(true).with_current_span(true))
            .try_init()
            .context("Failed to install JSON subscriber")?;
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().pretty().with_target(true).with_line_number(true))
            .try_init()
            .context("Failed to install subscriber")?;
    }

    Ok(TelemetryGuards)
}

fn build_filter(level: &str) -> Result<EnvFilter> {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(format!("{level},tower_http=info,hyper=warn")))
        .context("Failed to create environment filter")
}
