use crate::config::Config;
use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

pub const DEFAULT_CONFIG_PATH: &str = "courier.json";

/// Load configuration from `path`, falling back to `courier.json` in the
/// working directory, falling back to defaults when neither exists.
pub fn load_config(config_path: Option<&Path>) -> Result<Config> {
    let path = config_path.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_PATH));

    if path.exists() {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;
        let config: Config = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config JSON from {}", path.display()))?;
        return Ok(config);
    }

    Ok(Config::default())
}
