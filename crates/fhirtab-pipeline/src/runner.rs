//! Per-view run orchestration.
//!
//! A [`ViewRunner`] takes one ViewDefinition from compilation to a
//! populated destination table: compile the plan, create the table, stream
//! the NDJSON input through the materializer, and upsert row batches keyed
//! by the resource key column.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::info;

use fhirtab_db::{ColumnDef, DuckDbPool, Row, UpsertCounts, UpsertEngine, ensure_table};
use fhirtab_view::{Materializer, Plan, PlanColumn, ViewDefinition, compile};

use crate::stream::{RowSink, StreamProcessor, StreamStats};
use crate::Result;

/// Executes ViewDefinitions against an NDJSON input and a DuckDB pool.
pub struct ViewRunner {
    pool: Arc<DuckDbPool>,
    processor: StreamProcessor,
    batch_size: usize,
}

impl ViewRunner {
    /// Create a runner over the given pool.
    ///
    /// `concurrency` bounds in-flight materializations; `batch_size` is
    /// the upsert chunk size.
    pub fn new(pool: Arc<DuckDbPool>, concurrency: usize, batch_size: usize) -> Self {
        Self {
            pool,
            processor: StreamProcessor::new(concurrency, batch_size),
            batch_size,
        }
    }

    /// Run one view against one NDJSON file and return its report.
    ///
    /// # Errors
    ///
    /// Fails when the view does not compile, the destination table cannot
    /// be created, or the input cannot be read. Batch-scope database
    /// failures do not fail the run; they surface in the report's error
    /// count.
    pub async fn run(&self, view: &ViewDefinition, ndjson_path: &Path) -> Result<ViewReport> {
        let started = Instant::now();
        let plan = Arc::new(compile(view)?);

        info!(
            view = %plan.view_name,
            table = %plan.table_name,
            resource = %plan.resource,
            input = %ndjson_path.display(),
            "running view"
        );

        {
            let conn = self.pool.acquire()?;
            let columns: Vec<ColumnDef> = plan.columns.iter().map(to_column_def).collect();
            ensure_table(&conn, &plan.table_name, &columns)?;
        }

        let materializer = Materializer::new(Arc::clone(&plan));
        let mut sink = UpsertSink {
            engine: UpsertEngine::new(Arc::clone(&self.pool), self.batch_size),
            table_name: plan.table_name.clone(),
            key_column: plan.resource_key_column(),
        };
        let outcome = self
            .processor
            .process_with_sink(ndjson_path, &materializer, &mut sink)
            .await?;

        let report = ViewReport {
            view_name: plan.view_name.clone(),
            table_name: plan.table_name.clone(),
            stats: outcome.stats,
            upserts: outcome.upserts,
            elapsed: started.elapsed(),
        };
        report.emit_summary();
        Ok(report)
    }

    /// The plan a view compiles to, without running anything. Useful for
    /// validating a folder of definitions.
    pub fn explain(&self, view: &ViewDefinition) -> Result<Plan> {
        Ok(compile(view)?)
    }
}

fn to_column_def(column: &PlanColumn) -> ColumnDef {
    ColumnDef {
        name: column.name.clone(),
        col_type: column.col_type.clone(),
        collection: column.collection,
        type_override: column.ansi_type.clone(),
    }
}

/// Sink that upserts each batch under the view's resource key.
struct UpsertSink {
    engine: UpsertEngine,
    table_name: String,
    key_column: String,
}

#[async_trait]
impl RowSink for UpsertSink {
    async fn accept(&mut self, rows: &[Row]) -> fhirtab_db::Result<UpsertCounts> {
        self.engine.upsert(&self.table_name, rows, &self.key_column)
    }
}

/// Summary of one view's run.
#[derive(Debug, Clone)]
pub struct ViewReport {
    /// The view's name.
    pub view_name: String,

    /// The destination table.
    pub table_name: String,

    /// Input-side counters.
    pub stats: StreamStats,

    /// Persistence-side counters.
    pub upserts: UpsertCounts,

    /// Wall-clock duration of the run.
    pub elapsed: Duration,
}

impl ViewReport {
    /// Whether the run saw no failures of any kind.
    pub fn is_clean(&self) -> bool {
        self.stats.invalid_records == 0 && self.upserts.errors == 0
    }

    fn emit_summary(&self) {
        info!(
            view = %self.view_name,
            table = %self.table_name,
            total_records = self.stats.total_records,
            parsed_records = self.stats.parsed_records,
            invalid_records = self.stats.invalid_records,
            inserted = self.upserts.inserted,
            updated = self.upserts.updated,
            deleted = self.upserts.deleted,
            errors = self.upserts.errors,
            elapsed_ms = self.elapsed.as_millis() as u64,
            "run summary"
        );
    }
}
