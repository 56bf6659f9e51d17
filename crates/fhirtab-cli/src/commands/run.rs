//! Run every view against its input and load the database.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{error, warn};

use fhirtab_config::RunnerConfig;
use fhirtab_db::DuckDbPool;
use fhirtab_pipeline::ViewRunner;
use fhirtab_view::ViewDefinition;

use crate::cli::RunArgs;
use crate::views;

pub async fn execute(config: &RunnerConfig, args: &RunArgs) -> Result<()> {
    let views_folder = args
        .views
        .as_deref()
        .unwrap_or(&config.view_definitions_folder);
    let views = views::load_views(views_folder)?;
    if views.is_empty() {
        warn!(folder = %views_folder.display(), "no view definitions found");
        return Ok(());
    }

    std::fs::create_dir_all(&config.duckdb_folder).with_context(|| {
        format!(
            "creating database folder `{}`",
            config.duckdb_folder.display()
        )
    })?;
    let pool = DuckDbPool::open(config.database_path(), config.connection_pool_size)?;
    let runner = ViewRunner::new(
        Arc::clone(&pool),
        config.effective_concurrency(),
        config.batch_size,
    );

    let total = views.len();
    let mut failures = 0usize;
    for loaded in &views {
        // A broken view never stops the run; the next one still loads.
        let view = match &loaded.view {
            Ok(view) => view,
            Err(e) => {
                error!(path = %loaded.path.display(), error = %e, "invalid view definition");
                failures += 1;
                continue;
            }
        };

        let Some(input) = select_input(config, args, view) else {
            warn!(view = %view.name, resource = %view.resource, "no input file; view skipped");
            continue;
        };

        match runner.run(view, &input).await {
            Ok(report) => {
                println!(
                    "{}: {} inserted, {} updated, {} errors ({} records in {:.1?})",
                    report.table_name,
                    report.upserts.inserted,
                    report.upserts.updated,
                    report.upserts.errors + report.stats.invalid_records,
                    report.stats.total_records,
                    report.elapsed,
                );
            }
            Err(e) => {
                error!(view = %view.name, error = %e, "view run failed");
                failures += 1;
            }
        }
    }

    if failures > 0 {
        anyhow::bail!("{failures} of {total} view(s) failed");
    }
    Ok(())
}

/// Pick the NDJSON input for a view: the command-line override, then the
/// configured file, then `<Resource>.ndjson` in the bulk export folder.
fn select_input(config: &RunnerConfig, args: &RunArgs, view: &ViewDefinition) -> Option<PathBuf> {
    if let Some(path) = &args.input {
        return Some(path.clone());
    }
    if let Some(path) = &config.ndjson_file_path {
        return Some(path.clone());
    }
    let folder = config.bulk_export_folder.as_ref()?;
    let candidate = folder.join(format!("{}.ndjson", view.resource));
    candidate.exists().then_some(candidate)
}
