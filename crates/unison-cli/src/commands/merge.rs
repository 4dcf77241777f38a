use anyhow::{Context, Result};
use std::io::{self, BufRead, Write};
use unison_etl::reconcile::Reconciler;
use unison_etl::writeback::plan_targets;
use unison_etl::{Config, WriteBack};

use super::dry_run::{print_summary, summary_options};
use super::{api_client, open_checkpoints, open_database};

pub async fn run_merge(
    config: &Config,
    name: Option<String>,
    max_per_target: Option<usize>,
    yes: bool,
) -> Result<()> {
    let db = open_database(config)?;
    let engine = Reconciler::load(&db)?;
    if engine.is_empty() {
        anyhow::bail!("The projection is empty.\n\nRun 'unison fetch' first.");
    }

    let today = chrono::Local::now().format("%Y-%m-%d").to_string();
    let name = name.unwrap_or_else(|| format!("Master Library {today}"));
    let max_per_target = max_per_target.unwrap_or(config.max_per_target);

    print_summary(&engine.dry_run_summary(&summary_options(config, None, None)?));

    let ids = engine.deduplicated_ids();
    let plans = plan_targets(ids.len(), &name, max_per_target)?;

    println!("\nThis will:");
    println!("  1. Create {} NEW playlist(s), originals untouched:", plans.len());
    for plan in &plans {
        println!("       {} ({} tracks)", plan.name, plan.len());
    }
    println!("  2. Add {} unique tracks in total", ids.len());

    if !yes && !ask("\nProceed? [y/N] ")? {
        println!("Cancelled, nothing written");
        return Ok(());
    }

    let client = api_client(config)?;
    let checkpoints = open_checkpoints(config)?;
    let description = format!("Merged playlist created on {today}");
    let writer = WriteBack::new(
        &client,
        &checkpoints,
        config.write_options(Some(description)),
    );

    let report = match writer.execute(&ids, &name, max_per_target, true).await {
        Ok(report) => report,
        Err(e) => {
            if e.is_transient() {
                println!("\n{}", resume_hint(&name, max_per_target));
            }
            return Err(e).context("Merge did not finish");
        }
    };

    println!("\n✓ Merge complete");
    for target in &report.targets {
        println!("  {} ({})", target.name, target.collection_id);
        println!("    Tracks: {}/{}", target.written, target.planned);
        println!(
            "    URL: https://open.spotify.com/playlist/{}",
            target.collection_id
        );
    }

    Ok(())
}

/// The command that picks an interrupted merge back up.
fn resume_hint(name: &str, max_per_target: usize) -> String {
    format!(
        "Run this to resume where it stopped:\n  unison merge {name:?} --max-per-target {max_per_target}"
    )
}

fn ask(prompt: &str) -> Result<bool> {
    print!("{prompt}");
    io::stdout().flush().context("Failed to write prompt")?;

    let mut answer = String::new();
    io::stdin()
        .lock()
        .read_line(&mut answer)
        .context("Failed to read answer")?;

    Ok(is_yes(&answer))
}

fn is_yes(answer: &str) -> bool {
    matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}
