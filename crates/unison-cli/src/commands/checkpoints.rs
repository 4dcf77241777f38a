use anyhow::Result;
use unison_etl::{CheckpointStore, Config};

use super::open_checkpoints;

/// List every checkpoint, including files that no longer parse.
pub fn list(config: &Config) -> Result<()> {
    let store = open_checkpoints(config)?;
    let listing = store.list()?;

    if listing.is_empty() {
        println!("No checkpoints in {}", store.dir().display());
        return Ok(());
    }

    for record in &listing.records {
        let total = record
            .total
            .map_or_else(|| "?".to_string(), |t| t.to_string());
        println!(
            "{}  cursor {}  done {}/{}  {}  {}",
            record.stream_key,
            record.cursor,
            record.accumulated_count,
            total,
            if record.completed { "completed" } else { "in progress" },
            record.updated_at.format("%Y-%m-%d %H:%M:%S")
        );
    }

    for corrupt in &listing.corrupt {
        println!(
            "{}  CORRUPT ({})  {}",
            corrupt.stream_key.as_deref().unwrap_or("<unknown key>"),
            corrupt.message,
            corrupt.path.display()
        );
    }
    if !listing.corrupt.is_empty() {
        println!("\nRun 'unison checkpoints clear <key>' to discard a corrupt checkpoint.");
    }

    Ok(())
}

/// Remove one checkpoint by key, or all with `--all`.
pub fn clear(config: &Config, key: Option<String>, all: bool) -> Result<()> {
    let store = open_checkpoints(config)?;
    let cleared = clear_from(&store, key.as_deref(), all)?;
    match key {
        Some(key) if !all => println!("✓ Cleared {}", key),
        _ => println!("✓ Cleared {} checkpoint(s)", cleared),
    }
    Ok(())
}

fn clear_from(store: &CheckpointStore, key: Option<&str>, all: bool) -> Result<usize> {
    if all {
        return Ok(store.clear_prefix("")?);
    }

    let Some(key) = key else {
        anyhow::bail!("Give a checkpoint key, or --all.\n\nRun 'unison checkpoints list' to see keys.");
    };

    // Checked by file so a record that no longer parses can still go.
    if !store.contains(key) {
        anyhow::bail!("No checkpoint named {key}");
    }
    store.clear(key)?;
    Ok(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use unison_etl::CheckpointRecord;

    fn store_with_corrupt_entry() -> (TempDir, CheckpointStore) {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::open(dir.path()).unwrap();
        store.save(&CheckpointRecord::new("fetch:ok")).unwrap();
        store.save(&CheckpointRecord::new("fetch:bad")).unwrap();

        // Overwrite the record for fetch:bad in place.
        for entry in std::fs::read_dir(dir.path()).unwrap() {
            let path = entry.unwrap().path();
            if std::fs::read_to_string(&path).unwrap().contains("fetch:bad") {
                std::fs::write(&path, "{ not json").unwrap();
            }
        }
        assert_eq!(store.list().unwrap().corrupt.len(), 1);
        (dir, store)
    }

    #[test]
    fn test_clear_removes_corrupt_checkpoint_by_key() {
        let (_dir, store) = store_with_corrupt_entry();

        assert_eq!(clear_from(&store, Some("fetch:bad"), false).unwrap(), 1);

        let listing = store.list().unwrap();
        assert!(listing.corrupt.is_empty());
        assert_eq!(listing.records.len(), 1);
    }

    #[test]
    fn test_clear_all_removes_corrupt_checkpoints() {
        let (_dir, store) = store_with_corrupt_entry();

        assert_eq!(clear_from(&store, None, true).unwrap(), 2);
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn test_clear_unknown_key_fails() {
        let (_dir, store) = store_with_corrupt_entry();

        assert!(clear_from(&store, Some("fetch:missing"), false).is_err());
        assert!(clear_from(&store, None, false).is_err());
    }
}
