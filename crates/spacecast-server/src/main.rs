//! # spacecast
//!
//! Realtime fan-out server for space chat, presence and notifications.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! spacecast
//!
//! # Run with a specific config file
//! spacecast --config /path/to/spacecast.toml
//!
//! # Override any setting through the environment
//! SPACECAST__PORT=9000 SPACECAST__LIMITS__SEND_BUFFER=64 spacecast
//! ```

mod config;
mod handlers;
mod metrics;

use anyhow::{Context, Result};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "spacecast=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = match config_path_arg()? {
        Some(path) => config::Config::layered(Some(path.as_path()))?,
        None => config::Config::load()?,
    };

    tracing::info!("Starting spacecast on {}:{}", config.host, config.port);

    metrics::init_metrics();

    handlers::run_server(config).await?;

    Ok(())
}

/// Value of `--config <path>`, if given.
fn config_path_arg() -> Result<Option<PathBuf>> {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" {
            let path = args.next().context("--config requires a path")?;
            return Ok(Some(PathBuf::from(shellexpand::tilde(&path).into_owned())));
        }
    }
    Ok(None)
}
