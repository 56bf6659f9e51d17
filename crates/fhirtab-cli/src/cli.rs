//! Command-line interface definition.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

/// Materialize FHIR NDJSON streams into DuckDB tables driven by
/// ViewDefinitions.
#[derive(Parser)]
#[command(name = "fhirtab", version, about)]
pub struct Cli {
    /// Configuration file (TOML). Defaults to `fhirtab.toml` when present.
    #[arg(long, global = true, env = "FHIRTAB_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run every ViewDefinition in the configured folder against its
    /// input and load the database.
    Run(RunArgs),

    /// Compile-check every ViewDefinition in the configured folder
    /// without touching the database.
    Validate,
}

#[derive(Args)]
pub struct RunArgs {
    /// NDJSON input file, overriding the configured input selection.
    #[arg(long)]
    pub input: Option<PathBuf>,

    /// ViewDefinitions folder, overriding the configured one.
    #[arg(long)]
    pub views: Option<PathBuf>,
}
