//! Line-oriented NDJSON stream processing.
//!
//! Every non-blank line is parsed, checked for object-ness and dispatched
//! to the row materializer under a bounded-concurrency limiter. Failures
//! are isolated per line: an unparseable line is counted, logged with its
//! raw content, and skipped. Rows accumulate in completion order into
//! chunks of the configured batch size and are handed to a [`RowSink`].

use std::path::Path;

use async_trait::async_trait;
use futures_util::{StreamExt, stream};
use serde_json::Value;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::warn;

use fhirtab_db::UpsertCounts;
use fhirtab_view::{MaterializeOutcome, Materializer, Row};

use crate::progress::ProgressTracker;
use crate::{Error, Result};

/// A progress event fires every this many input lines.
const PROGRESS_INTERVAL: u64 = 1000;

/// Counters for one processed input file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamStats {
    /// Lines seen.
    pub total_records: u64,

    /// Resources that matched the plan's resource type and passed its
    /// where clauses.
    pub parsed_records: u64,

    /// Lines that failed JSON parsing or were not objects.
    pub invalid_records: u64,
}

/// The combined result of a streaming run.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessOutcome {
    /// Input-side counters.
    pub stats: StreamStats,

    /// Persistence-side counters accumulated across batches.
    pub upserts: UpsertCounts,
}

/// Consumer of materialized row batches.
#[async_trait]
pub trait RowSink: Send {
    /// Accept one batch of rows.
    ///
    /// # Errors
    ///
    /// A batch-scope failure; the stream logs it, accounts the batch's
    /// rows as errors and continues with the next batch.
    async fn accept(&mut self, rows: &[Row]) -> fhirtab_db::Result<UpsertCounts>;
}

/// Per-line handling result, tagged with the bytes the line consumed.
enum LineOutcome {
    Blank,
    Invalid { line: String, error: String },
    TypeMismatch,
    Filtered,
    Rows(Vec<Row>),
    Io(std::io::Error),
}

/// Reads NDJSON files and dispatches resources to a materializer under
/// bounded concurrency.
pub struct StreamProcessor {
    concurrency: usize,
    batch_size: usize,
}

impl StreamProcessor {
    /// Create a processor with the given concurrency limit and batch size.
    /// A limit of 1 makes the pipeline strictly serial.
    pub fn new(concurrency: usize, batch_size: usize) -> Self {
        Self {
            concurrency: concurrency.max(1),
            batch_size: batch_size.max(1),
        }
    }

    /// Process a file, collecting every produced row in memory.
    ///
    /// Convenience for tests and small inputs; large runs should stream
    /// into a sink with [`StreamProcessor::process_with_sink`].
    pub async fn process(
        &self,
        path: &Path,
        materializer: &Materializer,
    ) -> Result<(Vec<Row>, StreamStats)> {
        let mut sink = CollectSink::default();
        let outcome = self.process_with_sink(path, materializer, &mut sink).await?;
        Ok((sink.rows, outcome.stats))
    }

    /// Process a file, handing rows to the sink in chunks of the batch
    /// size. Rows are appended in the completion order of their
    /// materializations; rows from one resource stay in materialization
    /// order.
    pub async fn process_with_sink<S: RowSink>(
        &self,
        path: &Path,
        materializer: &Materializer,
        sink: &mut S,
    ) -> Result<ProcessOutcome> {
        let file = File::open(path).await.map_err(|source| Error::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let file_size = file
            .metadata()
            .await
            .map(|meta| meta.len())
            .unwrap_or_default();
        let lines = BufReader::new(file).lines();

        // Stop yielding after an IO error; the failure aborts this file.
        let line_stream = stream::unfold((lines, false), |(mut lines, failed)| async move {
            if failed {
                return None;
            }
            match lines.next_line().await {
                Ok(Some(line)) => Some((Ok(line), (lines, false))),
                Ok(None) => None,
                Err(error) => Some((Err(error), (lines, true))),
            }
        });

        let outcomes = line_stream
            .map(|next| async move {
                match next {
                    Ok(line) => {
                        let bytes = line.len() as u64 + 1;
                        (bytes, handle_line(&line, materializer))
                    }
                    Err(error) => (0, LineOutcome::Io(error)),
                }
            })
            .buffer_unordered(self.concurrency);
        let mut outcomes = std::pin::pin!(outcomes);

        let mut progress = ProgressTracker::new(file_size);
        let mut outcome = ProcessOutcome::default();
        let mut batch: Vec<Row> = Vec::with_capacity(self.batch_size);

        while let Some((bytes, line_outcome)) = outcomes.next().await {
            progress.add_bytes(bytes);
            match line_outcome {
                LineOutcome::Io(source) => {
                    return Err(Error::Io {
                        path: path.to_path_buf(),
                        source,
                    });
                }
                LineOutcome::Blank => {
                    outcome.stats.total_records += 1;
                }
                LineOutcome::Invalid { line, error } => {
                    outcome.stats.total_records += 1;
                    outcome.stats.invalid_records += 1;
                    warn!(error = %error, line = %line, "failed record");
                }
                LineOutcome::TypeMismatch | LineOutcome::Filtered => {
                    outcome.stats.total_records += 1;
                }
                LineOutcome::Rows(rows) => {
                    outcome.stats.total_records += 1;
                    outcome.stats.parsed_records += 1;
                    batch.extend(rows);
                    if batch.len() >= self.batch_size {
                        flush(sink, &mut batch, &mut outcome.upserts).await;
                    }
                }
            }
            if outcome.stats.total_records % PROGRESS_INTERVAL == 0 {
                progress.emit(&outcome.stats);
            }
        }

        flush(sink, &mut batch, &mut outcome.upserts).await;
        Ok(outcome)
    }
}

fn handle_line(line: &str, materializer: &Materializer) -> LineOutcome {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return LineOutcome::Blank;
    }

    let value: Value = match serde_json::from_str(trimmed) {
        Ok(value) => value,
        Err(error) => {
            return LineOutcome::Invalid {
                line: line.to_string(),
                error: error.to_string(),
            };
        }
    };
    if !value.is_object() {
        return LineOutcome::Invalid {
            line: line.to_string(),
            error: "not a JSON object".to_string(),
        };
    }

    match materializer.materialize_outcome(&value) {
        MaterializeOutcome::TypeMismatch => LineOutcome::TypeMismatch,
        MaterializeOutcome::Filtered => LineOutcome::Filtered,
        MaterializeOutcome::Rows(rows) => LineOutcome::Rows(rows),
    }
}

/// Hand the pending batch to the sink. A sink failure costs the batch:
/// logged, counted, and the stream moves on.
async fn flush<S: RowSink>(sink: &mut S, batch: &mut Vec<Row>, totals: &mut UpsertCounts) {
    if batch.is_empty() {
        return;
    }
    match sink.accept(batch).await {
        Ok(counts) => totals.absorb(counts),
        Err(error) => {
            totals.errors += batch.len() as u64;
            warn!(error = %error, rows = batch.len(), "batch rejected; continuing");
        }
    }
    batch.clear();
}

/// Sink that keeps every row in memory.
#[derive(Default)]
struct CollectSink {
    rows: Vec<Row>,
}

#[async_trait]
impl RowSink for CollectSink {
    async fn accept(&mut self, rows: &[Row]) -> fhirtab_db::Result<UpsertCounts> {
        self.rows.extend_from_slice(rows);
        Ok(UpsertCounts::default())
    }
}
