//! DuckDB persistence for fhirtab.
//!
//! This crate owns everything that touches the embedded database: a
//! fixed-size connection pool with fail-fast acquisition, idempotent table
//! creation with a sequence-backed surrogate key, and the transactional
//! upsert engine that replaces rows by resource key.
//!
//! # Components
//!
//! - [`DuckDbPool`] - Fixed-size pool; `acquire` never blocks
//! - [`ensure_table`] - Idempotent DDL from column descriptors
//! - [`UpsertEngine`] - Delete-by-key + batched insert inside one transaction

mod pool;
mod table;
mod upsert;

pub use pool::{DuckDbPool, PooledConnection};
pub use table::{ColumnDef, StorageType, ensure_table};
pub use upsert::{Row, UpsertCounts, UpsertEngine};

use thiserror::Error;

/// Errors raised by the persistence layer.
#[derive(Debug, Error)]
pub enum Error {
    /// The pool was empty at acquisition time. Acquisition never blocks;
    /// callers are expected to keep their concurrency limit within the
    /// pool size.
    #[error("no database connection available")]
    NoConnectionAvailable,

    /// The pool cannot be built with the requested size.
    #[error("connection pool size must be at least 1, got {0}")]
    InvalidPoolSize(usize),

    /// The destination table exposes no usable columns.
    #[error("table `{0}` has no insertable columns")]
    NoColumns(String),

    /// An error reported by DuckDB. At transaction scope this aborts the
    /// whole upsert call.
    #[error("database error: {0}")]
    Database(#[from] duckdb::Error),
}

/// Result type alias using the crate's Error type.
pub type Result<T> = std::result::Result<T, Error>;
