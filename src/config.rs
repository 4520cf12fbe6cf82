//! Engine configuration.
//!
//! The configuration file parser is deliberately thin: a JSON document
//! deserialized straight into [`MirrorConfig`]. Validation enforces the one
//! structural rule the engine cannot tolerate being broken: an individual
//! repo's owner must not also be mirrored as a whole org or user, or the two
//! scan paths would fight over the same records.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default upstream request budget per hour.
const DEFAULT_REQUESTS_PER_HOUR: u32 = 5000;

/// Default pause between requests when the quota formula yields zero.
const DEFAULT_PAUSE_MSECS: u64 = 500;

/// Default seconds between event scans.
const DEFAULT_EVENT_SCAN_SECS: u64 = 60;

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("cannot parse config file: {0}")]
    Json(#[from] serde_json::Error),

    #[error(
        "individual repo owner {owner:?} is also listed as an org or user; \
         remove one of the two"
    )]
    OwnerOverlap { owner: String },

    #[error("invalid repository format (expected <owner>/<repo>): {repo:?}")]
    InvalidRepoFormat { repo: String },
}

/// One individually mirrored repository.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndividualRepo {
    /// `<owner>/<repo>`.
    pub repo: String,

    /// Overrides the global event-scan cadence for this repo.
    #[serde(default)]
    pub time_between_event_scans_in_seconds: Option<u64>,
}

/// Full engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MirrorConfig {
    /// Upstream hostname. A value ending in `github.com` selects the public
    /// API; anything else is treated as an enterprise host.
    pub github_server: String,

    pub github_username: String,
    pub github_password: String,

    #[serde(default)]
    pub org_list: Vec<String>,

    #[serde(default)]
    pub user_repo_list: Vec<String>,

    #[serde(default)]
    pub individual_repo_list: Vec<IndividualRepo>,

    pub db_path: PathBuf,

    #[serde(default = "default_requests_per_hour")]
    pub num_requests_per_hour: u32,

    #[serde(default = "default_pause_msecs")]
    pub pause_between_requests_in_msecs: u64,

    #[serde(default = "default_event_scan_secs")]
    pub time_between_event_scans_in_seconds: u64,

    /// Directory for the resource-change journal. Absent disables it.
    #[serde(default)]
    pub file_logger_path: Option<PathBuf>,

    /// Shared secret the read API requires in the Authorization header.
    #[serde(default)]
    pub preshared_key: Option<String>,

    /// Read-API bind address, `host:port`.
    #[serde(default)]
    pub listen_addr: Option<String>,
}

fn default_requests_per_hour() -> u32 {
    DEFAULT_REQUESTS_PER_HOUR
}

fn default_pause_msecs() -> u64 {
    DEFAULT_PAUSE_MSECS
}

fn default_event_scan_secs() -> u64 {
    DEFAULT_EVENT_SCAN_SECS
}

impl MirrorConfig {
    /// Loads and validates a configuration file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let bytes = std::fs::read(path)?;
        let config: MirrorConfig = serde_json::from_slice(&bytes)?;
        config.validate()?;
        Ok(config)
    }

    /// Structural validation; called again by the engine on start.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for individual in &self.individual_repo_list {
            let Some((owner, _repo)) = individual.repo.split_once('/') else {
                return Err(ConfigError::InvalidRepoFormat {
                    repo: individual.repo.clone(),
                });
            };

            let owner_listed = self.org_list.iter().any(|o| o == owner)
                || self.user_repo_list.iter().any(|u| u == owner);
            if owner_listed {
                return Err(ConfigError::OwnerOverlap {
                    owner: owner.to_string(),
                });
            }
        }
        Ok(())
    }

    /// The individual-repo full names, for store reconciliation.
    pub fn individual_repo_names(&self) -> Vec<String> {
        self.individual_repo_list
            .iter()
            .map(|r| r.repo.clone())
            .collect()
    }
}
