//! Config file loader and serialization.

use crate::config::EngineConfig;
use crate::error::ConfigError;
use std::fs;
use std::path::{Path, PathBuf};

/// Get the global config path: ~/.config/ledgerforge/engine.json
pub fn get_global_config_path() -> Result<PathBuf, ConfigError> {
    let home = dirs::home_dir().ok_or_else(|| {
        ConfigError::ValidationFailed("Cannot determine home directory".to_string())
    })?;

    Ok(home.join(".config/ledgerforge").join("engine.json"))
}

/// Load config from a `.json` or `.toml` file and validate it.
pub fn load_config_from_file(path: &Path) -> Result<EngineConfig, ConfigError> {
    validate_config_path(path)?;

    let content = fs::read_to_string(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            ConfigError::FileNotFound(format!(
                "Configuration file not found at: {}",
                path.display()
            ))
        } else {
            ConfigError::IoError(e)
        }
    })?;

    let config: EngineConfig = if is_toml(path) {
        toml::from_str(&content)?
    } else {
        serde_json::from_str(&content)?
    };
    config.validate()?;

    log::debug!("loaded engine config from {}", path.display());
    Ok(config)
}

/// Load the global config, or defaults when none has been written yet.
pub fn load_global_config() -> Result<EngineConfig, ConfigError> {
    let path = get_global_config_path()?;
    if !path.exists() {
        return Ok(EngineConfig::default());
    }
    load_config_from_file(&path)
}

/// Save config as JSON or TOML depending on the extension.
pub fn save_config_to_file(config: &EngineConfig, path: &Path) -> Result<(), ConfigError> {
    validate_config_path(path)?;

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let content = if is_toml(path) {
        toml::to_string_pretty(config)?
    } else {
        serde_json::to_string_pretty(config)?
    };
    fs::write(path, content)?;

    Ok(())
}

/// Validate config path (.json or .toml extension required).
pub fn validate_config_path(path: &Path) -> Result<(), ConfigError> {
    if path.as_os_str().is_empty() {
        return Err(ConfigError::ValidationFailed(
            "Configuration path cannot be empty".to_string(),
        ));
    }

    match path.extension() {
        Some(ext) if ext == "json" || ext == "toml" => {}
        Some(ext) => {
            return Err(ConfigError::ValidationFailed(format!(
                "Configuration file must have .json or .toml extension, got .{}",
                ext.to_string_lossy()
            )))
        }
        None => {
            return Err(ConfigError::ValidationFailed(
                "Configuration file must have .json or .toml extension".to_string(),
            ))
        }
    }

    if path.to_str().is_none() {
        return Err(ConfigError::ValidationFailed(
            "Configuration path contains invalid characters".to_string(),
        ));
    }

    Ok(())
}

fn is_toml(path: &Path) -> bool {
    path.extension().map_or(false, |ext| ext == "toml")
}
