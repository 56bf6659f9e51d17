//! Tracing initialization with a configurable log level.

use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Initialize the global subscriber.
///
/// `RUST_LOG` from the environment wins over the configured level. When a
/// logs folder is given, events are additionally written to
/// `fhirtab.log` inside it.
pub fn init_tracing(level: &str, logs_folder: Option<&Path>) -> Result<()> {
    let filter = std::env::var("RUST_LOG")
        .ok()
        .and_then(|_| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new(level));

    let file_layer = match logs_folder {
        Some(folder) => {
            std::fs::create_dir_all(folder)
                .with_context(|| format!("creating logs folder `{}`", folder.display()))?;
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(folder.join("fhirtab.log"))
                .with_context(|| format!("opening log file in `{}`", folder.display()))?;
            Some(fmt::layer().with_ansi(false).with_writer(Arc::new(file)))
        }
        None => None,
    };

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .with(file_layer)
        .try_init();

    Ok(())
}
