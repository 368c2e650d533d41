//! First-run setup: config directory and default config file.

use crate::config::Config;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// Create the config directory and write a default config file when none
/// exists. Returns the directory. An existing config is left untouched.
pub fn init_config_dir(config_path: &Path) -> Result<PathBuf> {
    let dir = config_path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("creating config directory {}", dir.display()))?;

    if config_path.exists() {
        log::info!("config already present at {}", config_path.display());
        return Ok(dir);
    }

    let config = Config::default();
    let body = serde_json::to_string_pretty(&config).context("encoding default config")?;
    std::fs::write(config_path, body)
        .with_context(|| format!("writing default config to {}", config_path.display()))?;
    log::info!("wrote default config to {}", config_path.display());
    Ok(dir)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_default_config_once() {
        let dir = std::env::temp_dir().join(format!("observer-init-{}", uuid::Uuid::new_v4()));
        let path = dir.join("config.json");
        init_config_dir(&path).unwrap();
        assert!(path.exists());

        // A second init must not clobber edits.
        std::fs::write(&path, "{\"broker\":{\"testing\":true}}").unwrap();
        init_config_dir(&path).unwrap();
        let body = std::fs::read_to_string(&path).unwrap();
        assert!(body.contains("testing"));
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
