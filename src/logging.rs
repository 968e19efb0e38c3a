//! Logging bootstrap for programs embedding the client.
//!
//! Records never go to stdout: with the stdio transport, stdout carries
//! the RPC stream itself.

use std::fs::File;
use std::sync::Mutex;

use anyhow::{Context, Result};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Log file path. When unset, records go to stderr.
pub const LOG_FILE_ENV: &str = "NVIM_RPC_LOG_FILE";
/// Filter directive, e.g. `debug` or `nvim_rpc::session=trace`.
pub const LOG_LEVEL_ENV: &str = "NVIM_RPC_LOG_LEVEL";

const DEFAULT_LEVEL: &str = "info";

/// Install the global subscriber from `NVIM_RPC_LOG_FILE` and
/// `NVIM_RPC_LOG_LEVEL`.
///
/// Fails (without panicking) if a global subscriber is already set.
pub fn init_from_env() -> Result<()> {
    let level = std::env::var(LOG_LEVEL_ENV).unwrap_or_else(|_| DEFAULT_LEVEL.to_string());
    let file = std::env::var_os(LOG_FILE_ENV);
    init(&level, file.as_deref().map(std::path::Path::new))
}

/// Install the global subscriber with an explicit filter and optional file.
pub fn init(level: &str, file: Option<&std::path::Path>) -> Result<()> {
    let filter = EnvFilter::try_new(level)
        .with_context(|| format!("Invalid log filter '{}'", level))?;

    match file {
        Some(path) => {
            let file = File::create(path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;
            tracing_subscriber::registry()
                .with(filter)
                .with(
                    fmt::layer()
                        .with_target(false)
                        .with_ansi(false)
                        .with_writer(Mutex::new(file)),
                )
                .try_init()
                .context("A global tracing subscriber is already installed")?;
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(
                    fmt::layer()
                        .with_target(false)
                        .with_writer(std::io::stderr),
                )
                .try_init()
                .context("A global tracing subscriber is already installed")?;
        }
    }

    tracing::debug!("Logging initialized (level: {})", level);
    Ok(())
}
