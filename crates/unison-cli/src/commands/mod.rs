pub mod analyze;
pub mod checkpoints;
pub mod config;
pub mod dry_run;
pub mod fetch;
pub mod merge;
pub mod rebuild;
pub mod status;

pub use analyze::run_analyze;
pub use dry_run::run_dry_run;
pub use fetch::run_fetch;
pub use merge::run_merge;
pub use rebuild::run_rebuild;
pub use status::show_status;

use anyhow::{Context, Result};
use std::sync::Arc;
use unison_core::schema::Database;
use unison_etl::{CheckpointStore, Config, HttpTransport, RateLimitedClient, StaticToken};

/// Open the store, creating its directory on first use.
pub fn open_database(config: &Config) -> Result<Database> {
    if let Some(parent) = config.database_path.parent() {
        std::fs::create_dir_all(parent).context("Failed to create database directory")?;
    }
    Database::open(&config.database_path).with_context(|| {
        format!(
            "Failed to open database at {}",
            config.database_path.display()
        )
    })
}

pub fn open_checkpoints(config: &Config) -> Result<CheckpointStore> {
    CheckpointStore::open(&config.checkpoint_dir).with_context(|| {
        format!(
            "Failed to open checkpoint directory {}",
            config.checkpoint_dir.display()
        )
    })
}

/// Build the rate-limited Web API client from configuration.
pub fn api_client(config: &Config) -> Result<RateLimitedClient<HttpTransport>> {
    let token = config.access_token.clone().context(
        "No access token configured.\n\n\
         Set UNISON_ACCESS_TOKEN or run 'unison config set access_token <token>'.",
    )?;

    let transport = HttpTransport::new(
        config.api_base_url.clone(),
        Arc::new(StaticToken::new(token)),
        config.user_id.clone(),
    )
    .context("Failed to build HTTP client")?;

    Ok(RateLimitedClient::new(
        transport,
        config.retry_policy(),
        config.rate_limiter(),
    ))
}
