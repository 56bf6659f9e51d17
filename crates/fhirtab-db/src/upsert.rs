//! Transactional upsert-by-resource-key.
//!
//! Each call replaces every row belonging to the resource keys present in
//! the batch: count, delete, recount per distinct key, then insert the
//! batch in chunks. The whole call runs inside one transaction on one
//! pooled connection; rows that cannot reach the database (missing
//! resource key) are skipped and counted, while a database failure rolls
//! the entire call back.

use std::sync::Arc;

use duckdb::types::Value as DbValue;
use duckdb::{Connection, Transaction, params, params_from_iter};
use indexmap::IndexMap;
use serde_json::Value;
use tracing::{debug, warn};

use crate::pool::DuckDbPool;
use crate::{Error, Result};

/// One row bound for a destination table: column name to JSON value.
pub type Row = IndexMap<String, Value>;

/// Outcome counters for one upsert call.
///
/// `deleted` counts every row removed; `updated` the removed rows whose
/// key is being re-inserted by the same call (reported as updates rather
/// than deletions).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpsertCounts {
    /// Rows inserted.
    pub inserted: u64,

    /// Rows removed before re-insertion.
    pub deleted: u64,

    /// Removed rows that the batch replaced.
    pub updated: u64,

    /// Rows skipped or lost to failures.
    pub errors: u64,
}

impl UpsertCounts {
    /// Fold another call's counters into this one.
    pub fn absorb(&mut self, other: UpsertCounts) {
        self.inserted += other.inserted;
        self.deleted += other.deleted;
        self.updated += other.updated;
        self.errors += other.errors;
    }
}

/// Writes materialized rows into destination tables.
pub struct UpsertEngine {
    pool: Arc<DuckDbPool>,
    batch_size: usize,
}

impl UpsertEngine {
    /// Create an engine drawing connections from the given pool and
    /// processing rows in chunks of `batch_size`.
    pub fn new(pool: Arc<DuckDbPool>, batch_size: usize) -> Self {
        Self {
            pool,
            batch_size: batch_size.max(1),
        }
    }

    /// The pool this engine draws connections from.
    pub fn pool(&self) -> &Arc<DuckDbPool> {
        &self.pool
    }

    /// Replace-by-key upsert of one batch.
    ///
    /// The batch may span many source resources. For every distinct value
    /// of `resource_key_column` in `rows`, currently stored rows are
    /// deleted before the batch's rows are inserted; all of it inside one
    /// transaction.
    ///
    /// # Errors
    ///
    /// Fails fast when no pooled connection is available, and at
    /// transaction scope on any database failure - in which case nothing
    /// from this call is visible and the caller should account the whole
    /// batch as errored.
    pub fn upsert(
        &self,
        table_name: &str,
        rows: &[Row],
        resource_key_column: &str,
    ) -> Result<UpsertCounts> {
        let mut counts = UpsertCounts::default();
        if rows.is_empty() {
            return Ok(counts);
        }

        let mut conn = self.pool.acquire()?;
        let columns = insertable_columns(&conn, table_name)?;
        if columns.is_empty() {
            return Err(Error::NoColumns(table_name.to_string()));
        }

        let tx = conn.transaction()?;
        match run_in_tx(
            &tx,
            table_name,
            rows,
            resource_key_column,
            &columns,
            self.batch_size,
            &mut counts,
        ) {
            Ok(()) => {
                tx.commit()?;
                debug!(
                    table = table_name,
                    inserted = counts.inserted,
                    deleted = counts.deleted,
                    updated = counts.updated,
                    errors = counts.errors,
                    "upsert committed"
                );
                Ok(counts)
            }
            Err(error) => {
                // Dropping the transaction rolls the whole call back.
                drop(tx);
                warn!(table = table_name, error = %error, "upsert rolled back");
                Err(error)
            }
        }
    }
}

fn run_in_tx(
    tx: &Transaction<'_>,
    table_name: &str,
    rows: &[Row],
    resource_key_column: &str,
    columns: &[String],
    batch_size: usize,
    counts: &mut UpsertCounts,
) -> Result<()> {
    // Distinct resource keys, in first-appearance order.
    let mut keys: Vec<&Value> = Vec::new();
    for row in rows {
        if let Some(key) = row.get(resource_key_column)
            && !key.is_null()
            && !keys.contains(&key)
        {
            keys.push(key);
        }
    }

    let count_sql = format!(
        "SELECT count(*) FROM \"{table_name}\" WHERE \"{resource_key_column}\" = ?"
    );
    let delete_sql = format!("DELETE FROM \"{table_name}\" WHERE \"{resource_key_column}\" = ?");

    for key in keys {
        let bound = bind_value(Some(key));
        let before: i64 = tx.query_row(&count_sql, params![bound.clone()], |row| row.get(0))?;
        tx.execute(&delete_sql, params![bound.clone()])?;
        let after: i64 = tx.query_row(&count_sql, params![bound], |row| row.get(0))?;

        let removed = (before - after).max(0) as u64;
        counts.deleted += removed;
        // The key came out of this batch, so its rows are being replaced.
        counts.updated += removed;
    }

    let column_list = columns
        .iter()
        .map(|c| format!("\"{c}\""))
        .collect::<Vec<_>>()
        .join(", ");
    let placeholders = vec!["?"; columns.len()].join(", ");
    let insert_sql =
        format!("INSERT INTO \"{table_name}\" ({column_list}) VALUES ({placeholders})");
    let mut stmt = tx.prepare(&insert_sql)?;

    for chunk in rows.chunks(batch_size) {
        for row in chunk {
            let has_key = row
                .get(resource_key_column)
                .is_some_and(|key| !key.is_null());
            if !has_key {
                counts.errors += 1;
                warn!(
                    table = table_name,
                    key_column = resource_key_column,
                    row = ?row,
                    "row missing resource key; skipped"
                );
                continue;
            }

            let values: Vec<DbValue> = columns.iter().map(|c| bind_value(row.get(c))).collect();
            stmt.execute(params_from_iter(values))?;
            counts.inserted += 1;
        }
        debug!(table = table_name, rows = chunk.len(), "batch completed");
    }

    Ok(())
}

/// The table's bindable column list, in ordinal order, excluding the
/// surrogate `id` and system columns.
fn insertable_columns(conn: &Connection, table_name: &str) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT column_name FROM information_schema.columns \
         WHERE table_name = ? ORDER BY ordinal_position",
    )?;
    let names = stmt.query_map(params![table_name], |row| row.get::<_, String>(0))?;

    let mut columns = Vec::new();
    for name in names {
        let name = name?;
        if name != "id" && name != "last_updated" {
            columns.push(name);
        }
    }
    Ok(columns)
}

/// Convert a JSON value into a bindable DuckDB value. Arrays and objects
/// are JSON-encoded text (the driver offers no list binding); missing
/// column values bind NULL.
fn bind_value(value: Option<&Value>) -> DbValue {
    match value {
        None | Some(Value::Null) => DbValue::Null,
        Some(Value::Bool(b)) => DbValue::Boolean(*b),
        Some(Value::Number(n)) => {
            if let Some(i) = n.as_i64() {
                DbValue::BigInt(i)
            } else if let Some(f) = n.as_f64() {
                DbValue::Double(f)
            } else {
                DbValue::Null
            }
        }
        Some(Value::String(s)) => DbValue::Text(s.clone()),
        Some(other) => DbValue::Text(other.to_string()),
    }
}
