//! NDJSON stream processing and per-view orchestration for fhirtab.
//!
//! The [`StreamProcessor`] reads newline-delimited JSON resources,
//! materializes them under bounded concurrency and hands row batches to a
//! [`RowSink`]. The [`ViewRunner`] ties one ViewDefinition's whole run
//! together: compile, create the destination table, stream the input and
//! upsert the rows, then emit a run summary.

mod progress;
mod runner;
mod stream;

pub use progress::ProgressTracker;
pub use runner::{ViewReport, ViewRunner};
pub use stream::{ProcessOutcome, RowSink, StreamProcessor, StreamStats};

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised by the processing pipeline.
#[derive(Debug, Error)]
pub enum Error {
    /// The input file could not be opened or read.
    #[error("failed to read `{}`: {source}", .path.display())]
    Io {
        /// The offending file.
        path: PathBuf,
        /// The underlying IO error.
        source: std::io::Error,
    },

    /// A view failed to compile.
    #[error(transparent)]
    View(#[from] fhirtab_view::Error),

    /// A database failure outside batch scope (pool exhaustion, table
    /// creation).
    #[error(transparent)]
    Database(#[from] fhirtab_db::Error),
}

/// Result type alias using the crate's Error type.
pub type Result<T> = std::result::Result<T, Error>;
