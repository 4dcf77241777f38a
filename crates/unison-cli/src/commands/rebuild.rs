use anyhow::{Context, Result};
use unison_etl::Config;

use super::open_database;

pub fn run_rebuild(config: &Config) -> Result<()> {
    let db = open_database(config)?;
    let summary = db.rebuild_projection().context("Failed to rebuild projection")?;

    println!("✓ Projection rebuilt");
    println!("  Rows: {}", summary.projected);
    if summary.skipped > 0 {
        println!("  Skipped (no usable track id): {}", summary.skipped);
    }
    if summary.superseded > 0 {
        println!("  Superseded raw entries: {}", summary.superseded);
    }

    Ok(())
}
