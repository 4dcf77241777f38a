use anyhow::{Context, Result};
use unison_core::model::CollectionId;
use unison_etl::reconcile::{DryRunSummary, Reconciler, Scope, SummaryOptions};
use unison_etl::Config;

use super::open_database;

pub fn run_dry_run(
    config: &Config,
    weighted: Option<String>,
    pair: Option<Vec<String>>,
    json: bool,
) -> Result<()> {
    let db = open_database(config)?;
    let engine = Reconciler::load(&db)?;
    if engine.is_empty() {
        anyhow::bail!("The projection is empty.\n\nRun 'unison fetch' first.");
    }

    let options = summary_options(config, weighted, pair)?;
    let summary = engine.dry_run_summary(&options);

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&summary).context("Failed to serialize summary")?
        );
    } else {
        print_summary(&summary);
        println!("\nNo changes made. Run 'unison merge' to create the merged playlist.");
    }

    Ok(())
}

pub fn summary_options(
    config: &Config,
    weighted: Option<String>,
    pair: Option<Vec<String>>,
) -> Result<SummaryOptions> {
    let weighted_scope = weighted
        .or_else(|| config.weighted_collection.clone())
        .map(CollectionId::new)
        .transpose()
        .context("Invalid weighted playlist id")?
        .into();

    let overlap_pair = match pair.as_deref() {
        None => None,
        Some([a, b]) => Some((
            CollectionId::new(a.as_str())?,
            CollectionId::new(b.as_str())?,
        )),
        Some(_) => anyhow::bail!("--pair takes exactly two playlist ids"),
    };

    Ok(SummaryOptions {
        weighted_scope,
        overlap_pair,
    })
}

pub fn print_summary(summary: &DryRunSummary) {
    println!("\nDry Run");
    println!("=======\n");

    println!("Before:");
    for (collection, entries) in &summary.before.entries_by_collection {
        println!("  {:<40} {:>8}", collection.as_str(), entries);
    }
    println!("  {:<40} {:>8}", "total entries", summary.before.total_entries);

    println!("\nAfter:");
    println!("  {:<40} {:>8}", "unique tracks", summary.after.unique_tracks);

    println!("\nImpact:");
    println!(
        "  {:<40} {:>8} ({:.2}%)",
        "duplicates removed", summary.impact.duplicates_removed, summary.impact.reduction_pct
    );

    if let Some(overlap) = &summary.overlap {
        println!(
            "\nOverlap {} / {}:",
            overlap.collection_a, overlap.collection_b
        );
        println!("  {:<40} {:>8}", "only in first", overlap.only_a);
        println!("  {:<40} {:>8}", "only in second", overlap.only_b);
        println!("  {:<40} {:>8}", "in both", overlap.in_both);
    }

    let stats = &summary.weight_stats;
    let scope = match &stats.scope {
        Scope::All => "all playlists".to_string(),
        Scope::Collection(id) => id.to_string(),
    };
    println!("\nWeights ({}):", scope);
    println!("  {:<40} {:>8}", "highest", stats.highest);
    println!("  {:<40} {:>8.2}", "mean", stats.mean);
    println!("  {:<40} {:>8}", "tracks added more than once", stats.with_duplicates);
}
