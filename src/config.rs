use anyhow::{Context, Result};
use colonysync_core::SyncConfig;
use std::fs;
use std::path::Path;
use tracing::warn;

pub const DEFAULT_CONFIG_PATH: &str = "config/colonysync.toml";

/// Load the engine configuration, falling back to defaults on errors.
pub fn load_from_path(path: &Path) -> SyncConfig {
    match fs::read_to_string(path) {
        Ok(contents) => match toml::from_str::<SyncConfig>(&contents) {
            Ok(cfg) => cfg,
            Err(err) => {
                warn!("Failed to parse {}: {err}. Using defaults", path.display());
                SyncConfig::default()
            }
        },
        Err(err) => {
            if err.kind() == std::io::ErrorKind::NotFound {
                warn!("Config not found at {}. Using defaults", path.display());
            } else {
                warn!("Failed to read {}: {err}. Using defaults", path.display());
            }
            SyncConfig::default()
        }
    }
}

/// Write `config` as pretty TOML, creating parent directories.
pub fn save_to_path(config: &SyncConfig, path: &Path) -> Result<()> {
    let toml = toml::to_string_pretty(config).context("Failed to serialize config")?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    fs::write(path, toml).with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}
