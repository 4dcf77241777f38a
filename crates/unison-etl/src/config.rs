use anyhow::{Context, Result};
use confyg::{env, Confygery};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::fetch::FetchOptions;
use crate::http::DEFAULT_API_BASE;
use crate::resilience::{RateLimiter, RetryPolicy};
use crate::writeback::{WriteOptions, DEFAULT_MAX_PER_TARGET};

/// Configuration for unison.
///
/// Configuration is loaded from multiple sources with the following priority:
/// 1. CLI arguments (highest priority)
/// 2. Environment variables (UNISON_* prefix)
/// 3. Config file (~/.config/unison/config.toml)
/// 4. Built-in defaults (lowest priority)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Path to the SQLite database.
    ///
    /// Can be set via:
    /// - CLI: --db /path/to/db
    /// - ENV: UNISON_DATABASE_PATH
    /// - Config: database_path = "/path/to/db"
    /// - Default: ~/.local/share/unison/unison.db
    pub database_path: PathBuf,

    /// Directory holding one checkpoint file per stream.
    pub checkpoint_dir: PathBuf,

    /// Bearer token for the Web API.
    ///
    /// Can be set via:
    /// - ENV: UNISON_ACCESS_TOKEN
    /// - Config: access_token = "..."
    pub access_token: Option<String>,

    /// Account that owns created collections; looked up when absent.
    pub user_id: Option<String>,

    pub api_base_url: String,

    /// Items per page, at most 100.
    pub page_size: u32,

    /// Fetched items between checkpoint saves.
    pub checkpoint_interval: u64,

    /// Attempts per API call, including the first.
    pub max_attempts: u32,

    /// Wait after a throttled response that carries no `Retry-After`.
    pub default_retry_after_secs: u64,

    pub backoff_base_ms: u64,

    pub backoff_cap_secs: u64,

    /// Request pacing; 0 disables it.
    pub requests_per_second: u32,

    /// Largest target collection a merge creates.
    pub max_per_target: usize,

    /// Ids per write request, at most 100.
    pub write_batch_size: usize,

    /// Collection whose weights the dry run reports; all when unset.
    pub weighted_collection: Option<String>,

    /// Logging options passed to twyg.
    pub logging: twyg::Opts,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: default_db_path(),
            checkpoint_dir: default_checkpoint_dir(),
            access_token: None,
            user_id: None,
            api_base_url: DEFAULT_API_BASE.to_string(),
            page_size: 100,
            checkpoint_interval: 500,
            max_attempts: 5,
            default_retry_after_secs: 5,
            backoff_base_ms: 1000,
            backoff_cap_secs: 60,
            requests_per_second: 10,
            max_per_target: DEFAULT_MAX_PER_TARGET,
            write_batch_size: 100,
            weighted_collection: None,
            logging: twyg::Opts::default(),
        }
    }
}

impl Config {
    /// Load configuration from file and environment variables.
    ///
    /// Searches for config file at: ~/.config/unison/config.toml
    /// Reads environment variables with UNISON_ prefix.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed.
    pub fn load() -> Result<Self> {
        let config_path = config_file_path();

        let mut builder = Confygery::new().context("Failed to create config builder")?;

        if config_path.exists() {
            let path_str = config_path
                .to_str()
                .ok_or_else(|| anyhow::anyhow!("Config path contains invalid UTF-8"))?;
            builder
                .add_file(path_str)
                .context("Failed to load config file")?;
        }

        let env_opts = env::Options::with_top_level("unison");
        builder
            .add_env(env_opts)
            .context("Failed to load environment variables")?;

        let config: Self = builder
            .build()
            .context("Failed to build configuration")?;

        Ok(config)
    }

    /// Load configuration with custom database path.
    ///
    /// This is used when the --db CLI flag is provided.
    pub fn load_with_db_path(db_path: PathBuf) -> Result<Self> {
        let mut config = Self::load()?;
        config.database_path = db_path;
        Ok(config)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            default_retry_after: Duration::from_secs(self.default_retry_after_secs),
            backoff_base: Duration::from_millis(self.backoff_base_ms),
            backoff_cap: Duration::from_secs(self.backoff_cap_secs),
        }
    }

    pub fn rate_limiter(&self) -> RateLimiter {
        RateLimiter::new(self.requests_per_second)
    }

    pub fn fetch_options(&self, refresh: bool) -> FetchOptions {
        FetchOptions {
            page_size: self.page_size,
            checkpoint_interval: self.checkpoint_interval,
            refresh,
        }
    }

    pub fn write_options(&self, description: Option<String>) -> WriteOptions {
        WriteOptions {
            batch_size: self.write_batch_size,
            public: false,
            description,
        }
    }
}

/// Get the default database path.
///
/// Returns: ~/.local/share/unison/unison.db (or platform equivalent)
fn default_db_path() -> PathBuf {
    data_dir().join("unison.db")
}

/// Returns: ~/.local/share/unison/checkpoints (or platform equivalent)
fn default_checkpoint_dir() -> PathBuf {
    data_dir().join("checkpoints")
}

fn data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("unison")
}

/// Get the config file path.
///
/// Returns:
/// - Linux: ~/.config/unison/config.toml
/// - macOS: ~/Library/Application Support/unison/config.toml
/// - Windows: %APPDATA%\unison\config.toml
pub fn config_file_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("unison")
        .join("config.toml")
}

/// Get the example config file content.
pub fn example_config() -> &'static str {
    r#"# Unison Configuration File
#
# Configuration is loaded from multiple sources with the following priority:
# 1. CLI arguments (highest priority)
# 2. Environment variables (UNISON_* prefix)
# 3. This config file
# 4. Built-in defaults (lowest priority)

# Web API access token (bearer)
#
# Can also be set via:
# - Environment: UNISON_ACCESS_TOKEN=your-token-here
access_token = "your-access-token-here"

# Owner of merged playlists; looked up from the token when unset
#user_id = "your-user-id"

#api_base_url = "https://api.spotify.com/v1"

# Path to the SQLite database
#
# Can also be set via:
# - CLI: unison --db /custom/path.db fetch ...
# - Environment: UNISON_DATABASE_PATH=/custom/path.db
#
# Default: Platform-specific data directory
#database_path = "/path/to/custom/unison.db"

# Directory for resumable progress (one file per playlist or merge target)
#checkpoint_dir = "/path/to/checkpoints"

# Fetching
page_size = 100
checkpoint_interval = 500

# Retries: throttled calls wait Retry-After (or the default below);
# server and network errors back off exponentially up to the cap.
max_attempts = 5
default_retry_after_secs = 5
backoff_base_ms = 1000
backoff_cap_secs = 60
requests_per_second = 10

# Merging
max_per_target = 10000
write_batch_size = 100

# Playlist whose duplicate weights the dry run reports
#weighted_collection = "playlist-id"
"#
}

/// Create default config file if it doesn't exist.
///
/// Returns true if a new file was created, false if it already existed.
pub fn ensure_config_file() -> Result<bool> {
    let config_path = config_file_path();

    if config_path.exists() {
        return Ok(false);
    }

    if let Some(parent) = config_path.parent() {
        std::fs::create_dir_all(parent).context("Failed to create config directory")?;
    }

    std::fs::write(&config_path, example_config()).context("Failed to write config file")?;

    Ok(true)
}
