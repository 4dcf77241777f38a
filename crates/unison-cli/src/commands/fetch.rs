use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use unison_core::model::CollectionId;
use unison_etl::{Config, FetchState, Fetcher};

use super::{api_client, open_checkpoints, open_database};

pub async fn run_fetch(
    config: &Config,
    ids: Vec<String>,
    file: Option<PathBuf>,
    refresh: bool,
) -> Result<()> {
    let mut refs = ids;
    if let Some(file) = file {
        refs.extend(read_id_list(&file)?);
    }
    if refs.is_empty() {
        anyhow::bail!("No playlists given.\n\nPass playlist ids or URLs, or --file with one per line.");
    }

    let collections = refs
        .iter()
        .map(|r| parse_collection_ref(r))
        .collect::<Result<Vec<_>>>()?;

    let db = open_database(config)?;
    let checkpoints = open_checkpoints(config)?;
    let client = api_client(config)?;
    let fetcher = Fetcher::new(&client, &checkpoints, &db, config.fetch_options(refresh));

    println!("Fetching {} playlist(s)\n", collections.len());

    let mut failed = Vec::new();
    for collection in &collections {
        println!("→ {}", collection);
        match fetcher.fetch(collection).await {
            Ok(outcome) if outcome.state == FetchState::Completed && outcome.fetched == 0 => {
                println!(
                    "  ✓ already fetched ({} entries), use --refresh to fetch again",
                    outcome.accumulated_count
                );
            }
            Ok(outcome) => {
                if let Some(cursor) = outcome.resumed_from {
                    println!("  resumed at {}", cursor);
                }
                print!("  ✓ {} entries stored", outcome.accumulated_count);
                if outcome.skipped > 0 {
                    print!(" ({} unavailable skipped)", outcome.skipped);
                }
                println!();
            }
            Err(e) => {
                println!("  ✗ {}", e);
                if e.is_transient() {
                    println!("  Run the same command again to resume.");
                }
                failed.push(collection.clone());
            }
        }
    }

    let summary = db.rebuild_projection().context("Failed to rebuild projection")?;
    println!(
        "\n✓ Projection rebuilt: {} rows ({} skipped)",
        summary.projected, summary.skipped
    );

    if !failed.is_empty() {
        let list: Vec<String> = failed.iter().map(ToString::to_string).collect();
        anyhow::bail!(
            "{} of {} playlist(s) did not finish: {}",
            failed.len(),
            collections.len(),
            list.join(", ")
        );
    }

    Ok(())
}

/// Read playlist references from a file, one per line.
fn read_id_list(path: &Path) -> Result<Vec<String>> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read playlist list {}", path.display()))?;
    Ok(parse_id_list(&contents))
}

fn parse_id_list(contents: &str) -> Vec<String> {
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect()
}

/// Accept a bare id, a `spotify:playlist:` URI, or a playlist URL.
fn parse_collection_ref(reference: &str) -> Result<CollectionId> {
    let reference = reference.trim();
    let id = if let Some(rest) = reference.strip_prefix("spotify:playlist:") {
        rest
    } else if let Some(index) = reference.find("/playlist/") {
        let rest = &reference[index + "/playlist/".len()..];
        rest.split(['?', '/', '#']).next().unwrap_or(rest)
    } else {
        reference
    };

    CollectionId::new(id).with_context(|| format!("Invalid playlist reference: {reference:?}"))
}
