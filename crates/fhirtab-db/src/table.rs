//! Destination table management.
//!
//! Maps the semantic column types declared in a view to DuckDB storage
//! types and creates destination tables idempotently: a sequence per table
//! plus a surrogate integer `id` primary key drawing from it, followed by
//! the declared columns in declaration order. Existing tables are left
//! untouched; no compatibility validation is attempted.

use duckdb::Connection;
use tracing::debug;

use crate::Result;

/// A column to be created in a destination table.
#[derive(Debug, Clone)]
pub struct ColumnDef {
    /// Column name.
    pub name: String,

    /// Semantic type (FHIR primitive type name; unknown maps to VARCHAR).
    pub col_type: String,

    /// Whether the column holds a whole evaluation list.
    pub collection: bool,

    /// Storage type override (an `ansi/type` tag on the view column).
    pub type_override: Option<String>,
}

impl ColumnDef {
    /// The DuckDB type this column is stored as.
    ///
    /// An explicit override wins. Collection columns are stored as VARCHAR
    /// holding the JSON-encoded list: the DuckDB driver offers no list
    /// parameter binding, so the JSON-string representation is used
    /// instead of a native array type.
    pub fn storage_type(&self) -> String {
        if let Some(explicit) = &self.type_override {
            return explicit.clone();
        }
        if self.collection {
            return StorageType::Varchar.sql_type().to_string();
        }
        StorageType::from_semantic(&self.col_type).sql_type().to_string()
    }
}

/// DuckDB storage types for view columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StorageType {
    /// String-like values (string, uri, code, markdown, id, url, uuid, and
    /// anything unknown).
    #[default]
    Varchar,

    /// Boolean values.
    Boolean,

    /// 32-bit integers (integer, positiveInt, unsignedInt).
    Integer,

    /// 64-bit integers (integer64).
    BigInt,

    /// Floating-point decimals.
    Double,

    /// Date values (YYYY-MM-DD).
    Date,

    /// Timestamps (dateTime, instant).
    Timestamp,

    /// Time-of-day values.
    Time,

    /// Base64-encoded binary data.
    Blob,
}

impl StorageType {
    /// Map a semantic FHIR type to its storage type.
    ///
    /// Unknown types map to VARCHAR.
    pub fn from_semantic(type_str: &str) -> Self {
        match type_str.to_lowercase().as_str() {
            "boolean" => Self::Boolean,
            "integer" | "positiveint" | "unsignedint" => Self::Integer,
            "integer64" => Self::BigInt,
            "decimal" => Self::Double,
            "date" => Self::Date,
            "datetime" | "instant" => Self::Timestamp,
            "time" => Self::Time,
            "base64binary" => Self::Blob,
            _ => Self::Varchar,
        }
    }

    /// The DuckDB type name.
    pub fn sql_type(&self) -> &'static str {
        match self {
            Self::Varchar => "VARCHAR",
            Self::Boolean => "BOOLEAN",
            Self::Integer => "INTEGER",
            Self::BigInt => "BIGINT",
            Self::Double => "DOUBLE",
            Self::Date => "DATE",
            Self::Timestamp => "TIMESTAMP",
            Self::Time => "TIME",
            Self::Blob => "BLOB",
        }
    }
}

/// Name of the sequence feeding a table's surrogate key.
pub(crate) fn sequence_name(table_name: &str) -> String {
    format!("{table_name}_id_seq")
}

/// Idempotently create a destination table.
///
/// Creates the `<table>_id_seq` sequence and the table with a surrogate
/// `id` primary key defaulting to the sequence's next value, followed by
/// the given columns in order. Succeeds without touching anything when the
/// table already exists, whatever its schema.
pub fn ensure_table(conn: &Connection, table_name: &str, columns: &[ColumnDef]) -> Result<()> {
    let sequence = sequence_name(table_name);
    conn.execute_batch(&format!("CREATE SEQUENCE IF NOT EXISTS \"{sequence}\" START 1;"))?;

    let mut ddl = format!(
        "CREATE TABLE IF NOT EXISTS \"{table_name}\" (id INTEGER PRIMARY KEY DEFAULT nextval('{sequence}')"
    );
    for column in columns {
        ddl.push_str(&format!(", \"{}\" {}", column.name, column.storage_type()));
    }
    ddl.push(')');

    debug!(table = table_name, ddl = %ddl, "ensuring destination table");
    conn.execute_batch(&ddl)?;
    Ok(())
}
