use anyhow::Result;
use unison_core::schema::ProjectionFilter;
use unison_etl::fetch::stream_key;
use unison_etl::{Config, FetchState, SyncError};

use super::{open_checkpoints, open_database};

pub fn show_status(config: &Config) -> Result<()> {
    let db = open_database(config)?;
    let checkpoints = open_checkpoints(config)?;

    println!("\n📊 Unison Status\n");
    println!("  Database: {}", config.database_path.display());
    println!("  Checkpoints: {}", config.checkpoint_dir.display());
    println!("  Raw entries: {}", db.raw_entry_count(None)?);
    println!("  Projected rows: {}", db.projected_count()?);

    let collections = db.collections()?;
    if collections.is_empty() {
        println!("\n  No playlists fetched yet. Run `unison fetch <playlist>` to start.");
        return Ok(());
    }

    println!("\n  Playlists:");
    for collection in &collections {
        let rows = db
            .query_projection(&ProjectionFilter::collection(collection.clone()))?
            .len();
        let progress = match checkpoints.load(&stream_key(collection)) {
            Ok(record) => match (FetchState::from_checkpoint(record.as_ref()), &record) {
                (FetchState::Resuming, Some(r)) => format!(
                    "interrupted at {} of {}",
                    r.cursor,
                    r.total.map_or_else(|| "?".to_string(), |t| t.to_string())
                ),
                (state, _) => format!("{state:?}"),
            },
            Err(SyncError::CheckpointCorrupt { .. }) => "corrupt checkpoint".to_string(),
            Err(e) => return Err(e.into()),
        };
        println!("    {}  {} rows  [{}]", collection, rows, progress);
    }

    let listing = checkpoints.list()?;
    let pending: Vec<_> = listing.records.iter().filter(|r| !r.completed).collect();
    if !pending.is_empty() {
        println!("\n  Unfinished streams:");
        for record in pending {
            println!("    {} ({} done)", record.stream_key, record.accumulated_count);
        }
    }
    if !listing.corrupt.is_empty() {
        println!("\n  Corrupt checkpoints (clear with `unison checkpoints clear <key>`):");
        for corrupt in &listing.corrupt {
            println!(
                "    {}: {}",
                corrupt.stream_key.as_deref().unwrap_or("<unknown key>"),
                corrupt.message
            );
        }
    }

    Ok(())
}
