use anyhow::Result;
use unison_etl::reconcile::{format_duration, format_total_duration, Reconciler, Scope};
use unison_etl::Config;

use super::open_database;

/// Print library statistics and duplicate analysis.
pub fn run_analyze(config: &Config, top: usize) -> Result<()> {
    let db = open_database(config)?;
    let engine = Reconciler::load(&db)?;
    if engine.is_empty() {
        anyhow::bail!("The projection is empty.\n\nRun 'unison fetch' first.");
    }

    println!("Library Analysis");
    println!("================\n");

    // ---
    let summary = engine.collection_summary();
    println!("Playlists:");
    println!(
        "  {:<30} {:>8} {:>8} {:>8} {:>7}",
        "playlist", "entries", "unique", "dupes", "dupe %"
    );
    for c in &summary.collections {
        println!(
            "  {:<30} {:>8} {:>8} {:>8} {:>6.2}%",
            c.collection_source.as_str(),
            c.entries,
            c.unique,
            c.duplicates,
            c.duplicate_pct
        );
    }
    println!(
        "  {:<30} {:>8} {:>8} {:>8} {:>6.2}%",
        "all", summary.total_entries, summary.unique_tracks, summary.duplicates, summary.duplicate_pct
    );

    // ---
    println!("\nPresence:");
    for (count, tracks) in engine.presence_distribution() {
        let label = if count == 1 { "playlist" } else { "playlists" };
        println!("  in {count} {label}: {tracks} tracks");
    }

    let shared = engine.shared_tracks();
    if !shared.is_empty() {
        println!("\nMost shared tracks:");
        for record in shared.iter().take(top) {
            println!(
                "  {:>3}× {}",
                record.presence_by_collection.len(),
                describe(record.name.as_deref(), record.primary_artist.as_deref())
            );
        }
    }

    let repeated: Vec<_> = engine
        .weight_report(&Scope::All)
        .into_iter()
        .filter(|r| r.weight > 1)
        .collect();
    if !repeated.is_empty() {
        println!("\nMost repeated tracks:");
        for record in repeated.iter().take(top) {
            println!(
                "  {:>3}× {}",
                record.weight,
                describe(record.name.as_deref(), record.primary_artist.as_deref())
            );
        }
    }

    // ---
    let stats = engine.library_stats();
    println!("\nCatalog:");
    println!("  Unique tracks:  {}", stats.unique_tracks);
    println!("  Unique artists: {}", stats.unique_artists);
    println!("  Unique albums:  {}", stats.unique_albums);
    println!("  Explicit:       {}", stats.explicit_tracks);
    println!(
        "  Total length:   {}",
        format_total_duration(stats.total_duration_ms)
    );
    if let Some(avg) = stats.avg_duration_ms {
        println!("  Average length: {}", format_duration(avg));
    }
    if let (Some(min), Some(max)) = (stats.min_duration_ms, stats.max_duration_ms) {
        println!(
            "  Range:          {} to {}",
            format_duration(min),
            format_duration(max)
        );
    }
    if let Some(popularity) = stats.avg_popularity {
        println!("  Popularity:     {popularity:.1}");
    }

    let artists = engine.top_artists(top);
    if !artists.is_empty() {
        println!("\nTop artists:");
        for artist in &artists {
            println!(
                "  {:<40} {:>6} tracks {:>6} entries",
                artist.artist.as_deref().unwrap_or("<unknown>"),
                artist.unique_tracks,
                artist.total_entries
            );
        }
    }

    let years = engine.release_years();
    if !years.is_empty() {
        println!("\nRelease years:");
        for year in &years {
            println!("  {}: {}", year.year, year.tracks);
        }
    }

    // ---
    let timeline = engine.timeline(&Scope::All);
    if !timeline.is_empty() {
        println!("\nAdded per month:");
        println!("  {:<8} {:>8} {:>8} {:>6}", "month", "entries", "unique", "ratio");
        for bucket in &timeline {
            println!(
                "  {:<8} {:>8} {:>8} {:>6.2}",
                bucket.month, bucket.entries, bucket.unique, bucket.ratio
            );
        }
    }

    Ok(())
}

fn describe(name: Option<&str>, artist: Option<&str>) -> String {
    match (name, artist) {
        (Some(name), Some(artist)) => format!("{name} by {artist}"),
        (Some(name), None) => name.to_string(),
        (None, Some(artist)) => format!("<untitled> by {artist}"),
        (None, None) => "<untitled>".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_describe() {
        assert_eq!(describe(Some("Song"), Some("Band")), "Song by Band");
        assert_eq!(describe(Some("Song"), None), "Song");
        assert_eq!(describe(None, None), "<untitled>");
    }
}
