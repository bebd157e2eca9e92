//! Configuration Storage
//!
//! This module handles persistent storage of the platform configuration
//! as a TOML file in the user's configuration directory.

use crate::config::PlatformConfig;
use crate::error::{Result, TenantForgeError};
use std::fs;
use std::path::{Path, PathBuf};

/// Configuration file name
const CONFIG_FILE: &str = "config.toml";

/// Environment variable pointing at an explicit configuration file
const CONFIG_PATH_ENV: &str = "TENANT_FORGE_CONFIG";

/// Get the configuration directory path
pub fn config_dir() -> Result<PathBuf> {
    let config_dir = dirs::config_dir()
        .ok_or_else(|| TenantForgeError::Config("Could not find configuration directory".to_string()))?
        .join("tenant-forge");

    Ok(config_dir)
}

/// Get the configuration file path, honouring `TENANT_FORGE_CONFIG`
pub fn config_file() -> Result<PathBuf> {
    if let Ok(explicit) = std::env::var(CONFIG_PATH_ENV) {
        return Ok(PathBuf::from(explicit));
    }
    Ok(config_dir()?.join(CONFIG_FILE))
}

/// Load the configuration file, if one exists
pub fn load() -> Result<Option<PlatformConfig>> {
    let path = config_file()?;
    if !path.exists() {
        return Ok(None);
    }
    load_from(&path).map(Some)
}

/// Load a configuration file from an explicit path
pub fn load_from(path: &Path) -> Result<PlatformConfig> {
    let content = fs::read_to_string(path).map_err(|e| {
        TenantForgeError::Config(format!("Failed to read {}: {}", path.display(), e))
    })?;

    toml::from_str(&content).map_err(|e| {
        TenantForgeError::Config(format!("Failed to parse {}: {}", path.display(), e))
    })
}

/// Save the configuration to an explicit path, creating parent directories
pub fn save_to(config: &PlatformConfig, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let content = toml::to_string_pretty(config)
        .map_err(|e| TenantForgeError::Config(format!("Failed to serialize config: {}", e)))?;

    fs::write(path, content)?;
    Ok(())
}
