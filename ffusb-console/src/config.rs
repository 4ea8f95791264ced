use std::{fs, io, path::PathBuf};

use directories_next::ProjectDirs;
use ffusb_core::ConnectionConfig;

const CONFIG_FILE: &str = "config.json";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("no home directory to keep settings in")]
    NoConfigDir,
    #[error("couldn't access settings: {0}")]
    Io(#[from] io::Error),
    #[error("settings file is malformed: {0}")]
    Format(#[from] serde_json::Error),
}

pub fn config_path() -> Result<PathBuf, ConfigError> {
    ProjectDirs::from("dev", "arades", "ffusb")
        .map(|dirs| dirs.config_dir().join(CONFIG_FILE))
        .ok_or(ConfigError::NoConfigDir)
}

/// Read connection settings, writing out the defaults on first run
pub fn load() -> Result<ConnectionConfig, ConfigError> {
    let path = config_path()?;
    match fs::read_to_string(&path) {
        Ok(content) => Ok(serde_json::from_str(&content)?),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            let config = ConnectionConfig::default();
            save(&config)?;
            Ok(config)
        }
        Err(e) => Err(e.into()),
    }
}

pub fn save(config: &ConnectionConfig) -> Result<(), ConfigError> {
    let path = config_path()?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, serde_json::to_string_pretty(config)?)?;
    Ok(())
}
