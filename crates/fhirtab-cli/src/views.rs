//! ViewDefinition folder scanning.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use fhirtab_view::ViewDefinition;
use tracing::warn;

/// One `*.json` file found in the ViewDefinitions folder.
pub struct LoadedView {
    /// Where it came from.
    pub path: PathBuf,

    /// The parse result; commands decide whether a failure is skipped or
    /// reported.
    pub view: std::result::Result<ViewDefinition, fhirtab_view::Error>,
}

/// Scan a folder for ViewDefinition JSON files, in file-name order.
pub fn load_views(folder: &Path) -> Result<Vec<LoadedView>> {
    let entries = fs::read_dir(folder)
        .with_context(|| format!("reading view definitions folder `{}`", folder.display()))?;

    let mut paths: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
        .collect();
    paths.sort();

    let mut views = Vec::with_capacity(paths.len());
    for path in paths {
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(error) => {
                warn!(path = %path.display(), error = %error, "unreadable view definition file");
                continue;
            }
        };
        let view = ViewDefinition::parse(&text);
        views.push(LoadedView { path, view });
    }
    Ok(views)
}
