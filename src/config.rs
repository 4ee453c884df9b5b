// repo-courier/src/config.rs

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

use crate::contract::Visibility;
use crate::github::DEFAULT_API_BASE;
use crate::ingest::{
    IngestLimits, DEFAULT_MAX_ARCHIVE_BYTES, DEFAULT_MAX_DECOMPRESSED_BYTES, DEFAULT_MAX_FILES,
};
use crate::session::{OperatorId, PipelineOptions, DEFAULT_SESSION_TTL};
use crate::synchronise::DEFAULT_REMOTE_TIMEOUT;

/// Static settings read from the YAML file. Holds no secrets; every key is optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub github: GitHubSection,
    pub limits: LimitsSection,
    pub session: SessionSection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GitHubSection {
    pub api_base: String,
    pub default_visibility: Visibility,
    pub timeout_secs: u64,
}

impl Default for GitHubSection {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_API_BASE.to_string(),
            default_visibility: Visibility::Public,
            timeout_secs: DEFAULT_REMOTE_TIMEOUT.as_secs(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LimitsSection {
    pub max_archive_bytes: u64,
    pub max_decompressed_bytes: u64,
    pub max_files: usize,
}

impl Default for LimitsSection {
    fn default() -> Self {
        Self {
            max_archive_bytes: DEFAULT_MAX_ARCHIVE_BYTES,
            max_decompressed_bytes: DEFAULT_MAX_DECOMPRESSED_BYTES,
            max_files: DEFAULT_MAX_FILES,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SessionSection {
    pub expiry_secs: u64,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            expiry_secs: DEFAULT_SESSION_TTL.as_secs(),
        }
    }
}

/// Fully merged runtime settings: the file plus secrets from the environment.
#[derive(Clone, PartialEq)]
pub struct Settings {
    pub owner: OperatorId,
    pub github_token: String,
    pub file: FileConfig,
}

// The token stays out of debug output.
impl std::fmt::Debug for Settings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Settings")
            .field("owner", &self.owner)
            .field("github_token_len", &self.github_token.len())
            .field("file", &self.file)
            .finish()
    }
}

impl Settings {
    pub fn remote_timeout(&self) -> Duration {
        Duration::from_secs(self.file.github.timeout_secs)
    }

    pub fn pipeline_options(&self) -> PipelineOptions {
        PipelineOptions {
            limits: IngestLimits {
                max_archive_bytes: self.file.limits.max_archive_bytes,
                max_decompressed_bytes: self.file.limits.max_decompressed_bytes,
                max_files: self.file.limits.max_files,
            },
            default_visibility: self.file.github.default_visibility,
            session_ttl: Duration::from_secs(self.file.session.expiry_secs),
            remote_timeout: self.remote_timeout(),
        }
    }

    pub fn trace_loaded(&self) {
        info!(
            owner = %self.owner,
            api_base = %self.file.github.api_base,
            default_visibility = %self.file.github.default_visibility,
            timeout_secs = self.file.github.timeout_secs,
            max_archive_bytes = self.file.limits.max_archive_bytes,
            max_files = self.file.limits.max_files,
            expiry_secs = self.file.session.expiry_secs,
            "Loaded Settings"
        );
        debug!(?self, "Settings loaded (full debug)");
    }
}
