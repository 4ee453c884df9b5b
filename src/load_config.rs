use crate::config::{FileConfig, Settings};
use crate::ingest::MAX_CONFIGURABLE_BYTES;
use crate::session::OperatorId;
use anyhow::{bail, Result};
use std::fs;
use std::path::Path;
use tracing::{error, info};

pub const OWNER_ID_VAR: &str = "OWNER_ID";
pub const GITHUB_TOKEN_VAR: &str = "GITHUB_TOKEN";

fn required_env(var: &str) -> Result<String> {
    match std::env::var(var) {
        Ok(value) if !value.trim().is_empty() => {
            info!(var, "Found required variable in env");
            Ok(value.trim().to_string())
        }
        Ok(_) => {
            error!(var, "Environment variable is empty");
            bail!("{var} environment variable is empty")
        }
        Err(e) => {
            error!(error = ?e, var, "Environment variable not set");
            bail!("{var} environment variable not set: {e}")
        }
    }
}

/// Loads the static YAML config file (no secrets) and merges in the owner identity and
/// hosting token from the environment.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Settings> {
    let path_ref = path.as_ref();
    info!(config_path = ?path_ref, "Loading configuration from file");

    let config_content = match fs::read_to_string(path_ref) {
        Ok(content) => {
            info!(config_path = ?path_ref, "Config file read successfully");
            content
        }
        Err(e) => {
            error!(error = ?e, config_path = ?path_ref, "Failed to read config file");
            return Err(anyhow::anyhow!("Failed to read config file {:?}: {}", path_ref, e));
        }
    };

    // An empty file means all defaults.
    let file: FileConfig = if config_content.trim().is_empty() {
        FileConfig::default()
    } else {
        match serde_yaml::from_str(&config_content) {
            Ok(conf) => {
                info!(config_path = ?path_ref, "Parsed config YAML successfully");
                conf
            }
            Err(e) => {
                error!(error = ?e, config_path = ?path_ref, "Failed to parse config YAML");
                return Err(anyhow::anyhow!("Failed to parse config YAML: {e}"));
            }
        }
    };

    if file.github.timeout_secs == 0 {
        error!("github.timeout_secs must be positive");
        bail!("github.timeout_secs must be greater than zero");
    }
    if file.session.expiry_secs == 0 {
        error!("session.expiry_secs must be positive");
        bail!("session.expiry_secs must be greater than zero");
    }
    if file.limits.max_files == 0 {
        error!("limits.max_files must be positive");
        bail!("limits.max_files must be greater than zero");
    }
    for (key, value) in [
        ("limits.max_archive_bytes", file.limits.max_archive_bytes),
        ("limits.max_decompressed_bytes", file.limits.max_decompressed_bytes),
    ] {
        if value == 0 || value > MAX_CONFIGURABLE_BYTES {
            error!(key, value, max = MAX_CONFIGURABLE_BYTES, "Byte limit out of range");
            bail!("{key} must be between 1 and {MAX_CONFIGURABLE_BYTES}, got {value}");
        }
    }

    let owner = OperatorId::new(required_env(OWNER_ID_VAR)?);
    let github_token = required_env(GITHUB_TOKEN_VAR)?;

    let settings = Settings {
        owner,
        github_token,
        file,
    };
    settings.trace_loaded();
    info!("Config loaded and merged successfully");
    Ok(settings)
}
