//! Logging initialization.
//!
//! Console output goes to stderr at the level selected on the command line;
//! a detailed log is additionally written to `cluster_run.log` inside the
//! results directory. The `SWEEPMILL_LOG` environment variable overrides
//! the console filter.

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use anyhow::Result;
use clap_verbosity_flag::InfoLevel;
use clap_verbosity_flag::Verbosity;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::Layer as _;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// The name of the detailed log file inside the results directory.
const LOG_FILE_NAME: &str = "cluster_run.log";

/// Initializes tracing with a console layer and a file layer.
pub(crate) fn init(result_dir: &Path, verbosity: &Verbosity<InfoLevel>) -> Result<()> {
    let filename = result_dir.join(LOG_FILE_NAME);
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&filename)
        .with_context(|| format!("failed to open `{path}`", path = filename.display()))?;

    let console_filter = EnvFilter::try_from_env("SWEEPMILL_LOG")
        .unwrap_or_else(|_| EnvFilter::new(verbosity.tracing_level_filter().to_string()));

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .with_filter(console_filter),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(Arc::new(file))
                .with_ansi(false)
                .with_filter(EnvFilter::new("debug")),
        )
        .init();

    println!("Detailed logging available in {}", filename.display());
    Ok(())
}
