use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use unison_etl::Config;

mod commands;

#[derive(Debug, Parser)]
#[command(name = "unison", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to the database (default: ~/.local/share/unison/unison.db)
    #[arg(long, global = true)]
    db: Option<PathBuf>,
}

#[derive(Debug, clap::Subcommand)]
enum Commands {
    /// Fetch playlists into the local store
    ///
    /// Pages through each playlist and stores every entry verbatim in the
    /// raw log. Progress is checkpointed, so an interrupted fetch (rate
    /// limits, network loss, Ctrl-C) resumes where it stopped on the next
    /// run. Playlists that already finished are skipped unless --refresh
    /// is given.
    ///
    /// Playlists can be given as ids, open.spotify.com URLs or
    /// spotify:playlist: URIs, on the command line or one per line in a
    /// file (blank lines and lines starting with '#' are ignored).
    ///
    /// A playlist that fails is reported with its saved progress and the
    /// remaining playlists are still fetched. The projection is rebuilt
    /// at the end.
    Fetch {
        /// Playlist ids or URLs
        ids: Vec<String>,

        /// File with one playlist id or URL per line
        #[arg(long)]
        file: Option<PathBuf>,

        /// Discard finished checkpoints and fetch again from the start
        #[arg(long)]
        refresh: bool,
    },
    /// Rebuild the typed projection from the raw log
    Rebuild,
    /// Library statistics and duplicate analysis
    Analyze {
        /// Rows to show in ranked lists
        #[arg(long, default_value_t = 20)]
        top: usize,
    },
    /// Show what a merge would do, without writing anything
    DryRun {
        /// Playlist whose duplicate weights to report (default: config
        /// weighted_collection, else all playlists)
        #[arg(long)]
        weighted: Option<String>,

        /// Two playlists to compare for overlap
        #[arg(long, num_args = 2, value_names = ["A", "B"])]
        pair: Option<Vec<String>>,

        /// Print the summary as JSON
        #[arg(long)]
        json: bool,
    },
    /// Write the deduplicated library to new playlists
    ///
    /// Prints the dry-run summary first and asks for confirmation. Libraries
    /// larger than --max-per-target are split into "NAME (Part k)"
    /// playlists. Original playlists are never modified. An interrupted
    /// merge resumes into the same playlists when run again with the same
    /// name.
    Merge {
        /// Name of the new playlist (default: "Master Library YYYY-MM-DD")
        name: Option<String>,

        /// Largest playlist to create
        #[arg(long)]
        max_per_target: Option<usize>,

        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },
    /// Show store and checkpoint status
    Status,
    /// Inspect or clear resumable progress
    Checkpoints {
        #[command(subcommand)]
        action: CheckpointAction,
    },
    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Debug, clap::Subcommand)]
enum CheckpointAction {
    /// List every checkpoint
    List,
    /// Remove one checkpoint, or all of them
    Clear {
        /// Stream key, e.g. fetch:37i9dQZF1DXcBWIGoYBM5M
        key: Option<String>,

        /// Remove every checkpoint
        #[arg(long, conflicts_with = "key")]
        all: bool,
    },
}

#[derive(Debug, clap::Subcommand)]
enum ConfigAction {
    /// Show the effective configuration
    Show,
    /// Print the config file path
    Path,
    /// Create the config file with defaults
    Init,
    /// Print an example config file
    Example,
    /// Set a value in the config file
    Set {
        key: String,
        value: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match cli.db {
        Some(db_path) => Config::load_with_db_path(db_path)?,
        None => Config::load()?,
    };

    twyg::setup(config.logging.clone())
        .map_err(|e| anyhow::anyhow!("{e}"))
        .context("Failed to set up logging")?;

    match cli.command {
        Commands::Fetch { ids, file, refresh } => {
            commands::run_fetch(&config, ids, file, refresh).await?;
        }
        Commands::Rebuild => {
            commands::run_rebuild(&config)?;
        }
        Commands::Analyze { top } => {
            commands::run_analyze(&config, top)?;
        }
        Commands::DryRun {
            weighted,
            pair,
            json,
        } => {
            commands::run_dry_run(&config, weighted, pair, json)?;
        }
        Commands::Merge {
            name,
            max_per_target,
            yes,
        } => {
            commands::run_merge(&config, name, max_per_target, yes).await?;
        }
        Commands::Status => {
            commands::show_status(&config)?;
        }
        Commands::Checkpoints { action } => match action {
            CheckpointAction::List => commands::checkpoints::list(&config)?,
            CheckpointAction::Clear { key, all } => commands::checkpoints::clear(&config, key, all)?,
        },
        Commands::Config { action } => match action {
            ConfigAction::Show => commands::config::show_config(&config)?,
            ConfigAction::Path => commands::config::show_path()?,
            ConfigAction::Init => commands::config::init_config()?,
            ConfigAction::Example => commands::config::show_example()?,
            ConfigAction::Set { key, value } => commands::config::set_config(&key, &value)?,
        },
    }

    Ok(())
}
