//! Runtime configuration for fhirtab.
//!
//! Configuration layers an optional TOML file and `FHIRTAB_*` environment
//! variables over built-in defaults. The CLI resolves a [`RunnerConfig`]
//! once at startup and hands it to the components it constructs.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum Error {
    /// A source failed to load or deserialize.
    #[error(transparent)]
    Source(#[from] config::ConfigError),

    /// The loaded values are unusable together.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Result type alias using the crate's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Resolved runner configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Verbose trace logging.
    pub debug: bool,

    /// When false, the pipeline runs strictly serially.
    pub async_processing: bool,

    /// Directory scanned for ViewDefinition JSON files.
    pub view_definitions_folder: PathBuf,

    /// Explicit NDJSON input; wins over the bulk export folder.
    pub ndjson_file_path: Option<PathBuf>,

    /// Directory holding `<Resource>.ndjson` bulk export files.
    pub bulk_export_folder: Option<PathBuf>,

    /// Directory holding the DuckDB database file.
    pub duckdb_folder: PathBuf,

    /// DuckDB database file name.
    pub duckdb_file_name: String,

    /// Fixed connection pool size, created at startup.
    pub connection_pool_size: usize,

    /// Maximum in-flight materializations and upsert calls.
    pub concurrency_limit: usize,

    /// Rows per upsert chunk.
    pub batch_size: usize,

    /// Log level when `RUST_LOG` is not set.
    pub log_level: String,

    /// When set, logs are also written to `fhirtab.log` in this folder.
    pub logs_folder: Option<PathBuf>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            debug: false,
            async_processing: true,
            view_definitions_folder: PathBuf::from("view-definitions"),
            ndjson_file_path: None,
            bulk_export_folder: None,
            duckdb_folder: PathBuf::from("data"),
            duckdb_file_name: "fhirtab.duckdb".to_string(),
            connection_pool_size: 4,
            concurrency_limit: 4,
            batch_size: 1000,
            log_level: "info".to_string(),
            logs_folder: None,
        }
    }
}

impl RunnerConfig {
    /// Load configuration from an optional TOML file plus `FHIRTAB_*`
    /// environment variables, over the defaults.
    pub fn load(file: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = file {
            builder = builder.add_source(config::File::from(path.to_path_buf()).required(true));
        } else {
            builder = builder.add_source(config::File::with_name("fhirtab").required(false));
        }
        let loaded: Self = builder
            .add_source(config::Environment::with_prefix("FHIRTAB"))
            .build()?
            .try_deserialize()?;
        loaded.validate()?;
        Ok(loaded)
    }

    /// Check the values are usable together.
    ///
    /// The connection pool never blocks on acquisition, so the concurrency
    /// limit must not exceed the pool size.
    pub fn validate(&self) -> Result<()> {
        if self.connection_pool_size == 0 {
            return Err(Error::Invalid(
                "connection_pool_size must be at least 1".to_string(),
            ));
        }
        if self.batch_size == 0 {
            return Err(Error::Invalid("batch_size must be at least 1".to_string()));
        }
        if self.concurrency_limit == 0 {
            return Err(Error::Invalid(
                "concurrency_limit must be at least 1".to_string(),
            ));
        }
        if self.concurrency_limit > self.connection_pool_size {
            return Err(Error::Invalid(format!(
                "concurrency_limit ({}) must not exceed connection_pool_size ({})",
                self.concurrency_limit, self.connection_pool_size
            )));
        }
        Ok(())
    }

    /// The concurrency the pipeline actually runs with: 1 when async
    /// processing is disabled.
    pub fn effective_concurrency(&self) -> usize {
        if self.async_processing {
            self.concurrency_limit
        } else {
            1
        }
    }

    /// The log level honoring the `debug` switch.
    pub fn effective_log_level(&self) -> &str {
        if self.debug { "debug" } else { &self.log_level }
    }

    /// Full path of the DuckDB database file.
    pub fn database_path(&self) -> PathBuf {
        self.duckdb_folder.join(&self.duckdb_file_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = RunnerConfig::default();
        assert!(!config.debug);
        assert!(config.async_processing);
        assert_eq!(config.connection_pool_size, 4);
        assert_eq!(config.concurrency_limit, 4);
        assert_eq!(config.batch_size, 1000);
        assert_eq!(config.log_level, "info");
        assert_eq!(config.database_path(), PathBuf::from("data/fhirtab.duckdb"));
        config.validate().unwrap();
    }

    #[test]
    fn test_load_from_toml() {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .unwrap();
        writeln!(
            file,
            "batch_size = 50\nconcurrency_limit = 2\nconnection_pool_size = 2\nduckdb_file_name = \"test.duckdb\""
        )
        .unwrap();
        file.flush().unwrap();

        let config = RunnerConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.batch_size, 50);
        assert_eq!(config.concurrency_limit, 2);
        assert_eq!(config.duckdb_file_name, "test.duckdb");
        // Unset options keep their defaults.
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_validate_rejects_oversubscribed_pool() {
        let config = RunnerConfig {
            connection_pool_size: 2,
            concurrency_limit: 8,
            ..RunnerConfig::default()
        };
        assert!(matches!(config.validate(), Err(Error::Invalid(_))));
    }

    #[test]
    fn test_validate_rejects_zero_sizes() {
        for broken in [
            RunnerConfig {
                connection_pool_size: 0,
                ..RunnerConfig::default()
            },
            RunnerConfig {
                batch_size: 0,
                ..RunnerConfig::default()
            },
            RunnerConfig {
                concurrency_limit: 0,
                ..RunnerConfig::default()
            },
        ] {
            assert!(broken.validate().is_err());
        }
    }

    #[test]
    fn test_effective_concurrency_serial_mode() {
        let config = RunnerConfig {
            async_processing: false,
            concurrency_limit: 8,
            connection_pool_size: 8,
            ..RunnerConfig::default()
        };
        assert_eq!(config.effective_concurrency(), 1);
    }

    #[test]
    fn test_effective_log_level_debug_wins() {
        let config = RunnerConfig {
            debug: true,
            ..RunnerConfig::default()
        };
        assert_eq!(config.effective_log_level(), "debug");
    }
}
