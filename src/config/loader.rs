use std::path::{Path, PathBuf};

use crate::config::types::SandlinkConfig;
use crate::error::{Result, SandlinkError};

/// Get the default configuration file path
pub fn get_config_path() -> PathBuf {
    if let Some(proj_dirs) = directories::ProjectDirs::from("com", "sandlink", "sandlink") {
        proj_dirs.config_dir().join("config.toml")
    } else {
        dirs_fallback().join(".sandlink").join("config.toml")
    }
}

fn dirs_fallback() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("."))
}

/// Load configuration from file, with defaults for missing values
pub fn load_config(config_path: Option<&Path>) -> Result<SandlinkConfig> {
    let path = config_path
        .map(PathBuf::from)
        .unwrap_or_else(get_config_path);

    if !path.exists() {
        return Ok(SandlinkConfig::default());
    }

    let content = std::fs::read_to_string(&path)?;
    let config: SandlinkConfig =
        toml::from_str(&content).map_err(|e| SandlinkError::TomlParse(e.to_string()))?;

    validate(&config)?;
    Ok(config)
}

fn validate(config: &SandlinkConfig) -> Result<()> {
    if matches!(&config.relay.command, Some(command) if command.is_empty()) {
        return Err(SandlinkError::Config(
            "relay.command must name a program".to_string(),
        ));
    }

    for (index, osc) in config.osc.iter().enumerate() {
        if osc.id == 0 {
            return Err(SandlinkError::Config(format!(
                "osc '{}' needs a non-zero id",
                osc.name
            )));
        }
        if osc.command.is_empty() {
            return Err(SandlinkError::Config(format!(
                "osc '{}' needs a command",
                osc.name
            )));
        }
        if config.osc[..index].iter().any(|other| other.id == osc.id) {
            return Err(SandlinkError::Config(format!(
                "osc id {} is bound more than once",
                osc.id
            )));
        }
    }
    Ok(())
}
