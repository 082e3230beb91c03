use std::path::{Path, PathBuf};

use tracing::debug;

use crate::config::types::BoxenvConfig;
use crate::error::{BoxenvError, Result};

/// Get the default configuration file path
pub fn get_config_path() -> PathBuf {
    if let Some(proj_dirs) = directories::ProjectDirs::from("com", "boxenv", "boxenv") {
        proj_dirs.config_dir().join("config.toml")
    } else {
        // Fallback to home directory
        dirs_fallback().join(".boxenv").join("config.toml")
    }
}

fn dirs_fallback() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("."))
}

/// Load configuration from file, with defaults for missing values
pub fn load_config(config_path: Option<&Path>) -> Result<BoxenvConfig> {
    let path = config_path
        .map(PathBuf::from)
        .unwrap_or_else(get_config_path);

    if !path.exists() {
        if config_path.is_some() {
            return Err(BoxenvError::Config(format!(
                "Config file not found: {}",
                path.display()
            )));
        }
        debug!(path = %path.display(), "No config file, using defaults");
        return Ok(BoxenvConfig::default());
    }

    let content = std::fs::read_to_string(&path)?;
    let config = parse_config(&content)?;
    debug!(path = %path.display(), "Loaded config");

    Ok(config)
}

pub fn parse_config(content: &str) -> Result<BoxenvConfig> {
    toml::from_str(content).map_err(|e| BoxenvError::TomlParse(e.to_string()))
}

/// Write the default configuration to `path`, creating parent directories.
pub fn write_default_config(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let content = toml::to_string_pretty(&BoxenvConfig::default())
        .map_err(|e| BoxenvError::Config(format!("Failed to render config: {}", e)))?;
    std::fs::write(path, content)?;
    Ok(())
}
