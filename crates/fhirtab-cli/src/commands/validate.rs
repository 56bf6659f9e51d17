//! Compile-check the ViewDefinitions folder.

use anyhow::Result;

use fhirtab_config::RunnerConfig;
use fhirtab_view::compile;

use crate::views;

pub fn execute(config: &RunnerConfig) -> Result<()> {
    let views = views::load_views(&config.view_definitions_folder)?;
    if views.is_empty() {
        println!(
            "no view definitions in `{}`",
            config.view_definitions_folder.display()
        );
        return Ok(());
    }

    let mut invalid = 0usize;
    for loaded in &views {
        let name = loaded.path.display();
        match &loaded.view {
            Err(error) => {
                invalid += 1;
                println!("FAIL {name}: {error}");
            }
            Ok(view) => match compile(view) {
                Ok(plan) => println!(
                    "ok   {name}: table `{}`, {} column(s)",
                    plan.table_name,
                    plan.columns.len()
                ),
                Err(error) => {
                    invalid += 1;
                    println!("FAIL {name}: {error}");
                }
            },
        }
    }

    if invalid > 0 {
        anyhow::bail!("{invalid} invalid view definition(s)");
    }
    Ok(())
}
