use anyhow::{Context, Result};
use toml_edit::{value, DocumentMut};
use unison_etl::{config, Config};

/// Keys `config set` accepts, and whether each takes an integer.
const SETTABLE_KEYS: &[(&str, bool)] = &[
    ("access_token", false),
    ("user_id", false),
    ("api_base_url", false),
    ("database_path", false),
    ("checkpoint_dir", false),
    ("weighted_collection", false),
    ("page_size", true),
    ("checkpoint_interval", true),
    ("max_attempts", true),
    ("default_retry_after_secs", true),
    ("backoff_base_ms", true),
    ("backoff_cap_secs", true),
    ("requests_per_second", true),
    ("max_per_target", true),
    ("write_batch_size", true),
];

/// Show the current effective configuration.
pub fn show_config(config: &Config) -> Result<()> {
    println!("Current Configuration");
    println!("=====================\n");

    let path = config::config_file_path();
    println!("Config file: {}", path.display());
    println!(
        "File exists: {}\n",
        if path.exists() { "yes" } else { "no (using defaults)" }
    );

    println!("Settings:");
    println!(
        "  access_token: {}",
        if config.access_token.is_some() { "<set>" } else { "<not set>" }
    );
    println!(
        "  user_id: {}",
        config.user_id.as_deref().unwrap_or("<from token>")
    );
    println!("  api_base_url: {}", config.api_base_url);
    println!("  database_path: {}", config.database_path.display());
    println!("  checkpoint_dir: {}", config.checkpoint_dir.display());
    println!("  page_size: {}", config.page_size);
    println!("  checkpoint_interval: {}", config.checkpoint_interval);
    println!("  max_attempts: {}", config.max_attempts);
    println!("  default_retry_after_secs: {}", config.default_retry_after_secs);
    println!("  backoff_base_ms: {}", config.backoff_base_ms);
    println!("  backoff_cap_secs: {}", config.backoff_cap_secs);
    println!("  requests_per_second: {}", config.requests_per_second);
    println!("  max_per_target: {}", config.max_per_target);
    println!("  write_batch_size: {}", config.write_batch_size);
    println!(
        "  weighted_collection: {}",
        config.weighted_collection.as_deref().unwrap_or("<all playlists>")
    );
    println!("  logging.level: {:?}", config.logging.level());
    println!("  logging.coloured: {}", config.logging.coloured());
    println!("  logging.output: {:?}", config.logging.output());

    println!("\nPriority: CLI args > ENV vars (UNISON_*) > Config file > Defaults");

    Ok(())
}

/// Set a config value, keeping the rest of the file as written.
pub fn set_config(key: &str, value: &str) -> Result<()> {
    let config_path = config::config_file_path();
    config::ensure_config_file()?;

    let contents =
        std::fs::read_to_string(&config_path).context("Failed to read config file")?;
    let updated = update_document(&contents, key, value)?;
    std::fs::write(&config_path, updated).context("Failed to write config file")?;

    println!("✓ Updated {} = {}", key, value);
    println!("  in {}", config_path.display());

    Ok(())
}

fn update_document(contents: &str, key: &str, raw: &str) -> Result<String> {
    let Some(&(_, numeric)) = SETTABLE_KEYS.iter().find(|(name, _)| *name == key) else {
        let valid: Vec<&str> = SETTABLE_KEYS.iter().map(|(name, _)| *name).collect();
        anyhow::bail!("Unknown config key: {}\n\nValid keys: {}", key, valid.join(", "));
    };

    let mut doc = contents
        .parse::<DocumentMut>()
        .context("Config file is not valid TOML")?;

    if numeric {
        let number: i64 = raw
            .trim()
            .parse()
            .with_context(|| format!("{key} takes a whole number, got {raw:?}"))?;
        if number < 0 {
            anyhow::bail!("{key} cannot be negative");
        }
        doc[key] = value(number);
    } else {
        doc[key] = value(raw);
    }

    Ok(doc.to_string())
}

/// Show the config file path.
pub fn show_path() -> Result<()> {
    println!("{}", config::config_file_path().display());
    Ok(())
}

/// Show example configuration.
pub fn show_example() -> Result<()> {
    print!("{}", config::example_config());
    Ok(())
}

/// Initialize config file with defaults.
pub fn init_config() -> Result<()> {
    let created = config::ensure_config_file()?;
    let config_path = config::config_file_path();

    if created {
        println!("✓ Created config file: {}", config_path.display());
        println!("\nEdit this file to configure unison.");
    } else {
        println!("Config file already exists: {}", config_path.display());
    }

    Ok(())
}
