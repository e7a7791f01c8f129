use std::path::Path;

use anyhow::{Context, Result};
use rtpbridge_protocol::BridgeConfig;

/// Load configuration from a TOML file at the given path. If the file
/// doesn't exist, returns default configuration.
pub fn load_config(path: &Path) -> Result<BridgeConfig> {
    if !path.exists() {
        tracing::warn!("config file not found at {}, using defaults", path.display());
        return Ok(BridgeConfig::default());
    }

    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;

    let config: BridgeConfig = toml::from_str(&contents).with_context(|| "failed to parse config TOML")?;

    for issue in config.validate() {
        if issue.starts_with("ERROR:") {
            anyhow::bail!(issue);
        }
        tracing::warn!("{issue}");
    }

    tracing::info!("loaded config from {}", path.display());
    Ok(config)
}
