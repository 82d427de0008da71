//! Settings for talking to the service.
//!
//! Values come from an optional `config.toml` in the user's config directory,
//! overlaid by environment variables. Credentials are only checked for presence.

use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use dirs::config_dir;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::auth::{ClientCredentials, DEFAULT_CONTROL_TIMEOUT, DEFAULT_SCOPE};
use crate::endpoints::{DEFAULT_BASE_URL, DEFAULT_REGION, Endpoints};
use crate::error::DaError;
use crate::job::ActivityId;
use crate::poll::PollOptions;
use crate::retry::RetryPolicy;
use crate::transfer::DEFAULT_TRANSFER_TIMEOUT;

const CONFIG_DIR_NAME: &str = "darun";
const CONFIG_FILE_NAME: &str = "config.toml";
const DEFAULT_BUNDLE_ALIAS: &str = "prod";
/// Transfers may be large; their timeout is kept at least this many times the control timeout.
const TRANSFER_TIMEOUT_RATIO: u32 = 10;

pub const ENV_CLIENT_ID: &str = "APS_CLIENT_ID";
pub const ENV_CLIENT_SECRET: &str = "APS_CLIENT_SECRET";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid value for {key}: {message}")]
    Invalid { key: &'static str, message: String },
    #[error("missing required setting {0}")]
    Missing(&'static str),
}

impl From<ConfigError> for DaError {
    fn from(err: ConfigError) -> Self {
        DaError::Config(err.to_string())
    }
}

/// On-disk schema; every field optional so env vars can fill gaps.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileSettings {
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub region: Option<String>,
    pub base_url: Option<String>,
    pub scope: Option<String>,
    pub nickname: Option<String>,
    pub activity: Option<String>,
    pub bundle_alias: Option<String>,
    pub activity_id: Option<String>,
    pub max_wait_secs: Option<u64>,
    pub poll_interval_secs: Option<u64>,
    pub control_timeout_secs: Option<u64>,
    pub transfer_timeout_secs: Option<u64>,
    pub max_retries: Option<u32>,
    pub retry_base_ms: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub control: Duration,
    pub transfer: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            control: DEFAULT_CONTROL_TIMEOUT,
            transfer: DEFAULT_TRANSFER_TIMEOUT,
        }
    }
}

impl Timeouts {
    /// Raise the transfer timeout to at least ten control timeouts.
    pub fn normalized(self) -> Self {
        let floor = self.control * TRANSFER_TIMEOUT_RATIO;
        Self {
            control: self.control,
            transfer: self.transfer.max(floor),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub credentials: ClientCredentials,
    pub endpoints: Endpoints,
    pub scope: String,
    /// Default activity when a caller does not name one.
    pub activity_id: Option<ActivityId>,
    pub poll: PollOptions,
    pub timeouts: Timeouts,
    pub retry: RetryPolicy,
}

/// Path to the configuration directory.
pub fn config_directory() -> PathBuf {
    config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(CONFIG_DIR_NAME)
}

/// Path to `config.toml`.
pub fn config_path() -> PathBuf {
    config_directory().join(CONFIG_FILE_NAME)
}

/// Read the settings file; a missing file yields empty settings.
pub fn read_file_settings(path: &Path) -> Result<FileSettings, ConfigError> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(FileSettings::default()),
        Err(source) => {
            return Err(ConfigError::Io {
                path: path.to_path_buf(),
                source,
            });
        }
    };
    toml::from_str(&raw).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Load settings from `config.toml` and the process environment.
pub fn load_settings() -> Result<Settings, ConfigError> {
    load_settings_with(|key| env::var(key).ok())
}

/// Like [`load_settings`], with a custom environment lookup.
pub fn load_settings_with<F>(env_lookup: F) -> Result<Settings, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let file = read_file_settings(&config_path())?;
    Settings::resolve(file, env_lookup)
}

impl Settings {
    /// Merge file values with environment overrides. The environment wins.
    pub fn resolve<F>(file: FileSettings, env_lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let lookup = |key: &str| env_lookup(key).filter(|value| !value.trim().is_empty());

        let client_id = lookup(ENV_CLIENT_ID)
            .or(file.client_id)
            .ok_or(ConfigError::Missing(ENV_CLIENT_ID))?;
        let client_secret = lookup(ENV_CLIENT_SECRET)
            .or(file.client_secret)
            .ok_or(ConfigError::Missing(ENV_CLIENT_SECRET))?;

        let region = lookup("APS_REGION")
            .or(file.region)
            .unwrap_or_else(|| DEFAULT_REGION.to_string());
        let base_url = lookup("APS_BASE_URL")
            .or(file.base_url)
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        let scope = lookup("APS_SCOPE")
            .or(file.scope)
            .unwrap_or_else(|| DEFAULT_SCOPE.to_string());

        let nickname = lookup("APS_DA_NICKNAME").or(file.nickname);
        let activity = lookup("APS_DA_ACTIVITY").or(file.activity);
        let alias = lookup("APS_DA_BUNDLE_ALIAS")
            .or(file.bundle_alias)
            .unwrap_or_else(|| DEFAULT_BUNDLE_ALIAS.to_string());
        let activity_id = match lookup("APS_ACTIVITY_ID").or(file.activity_id) {
            Some(explicit) => Some(ActivityId::new(explicit)),
            None => match (nickname, activity) {
                (Some(nickname), Some(activity)) => {
                    Some(ActivityId::qualified(&nickname, &activity, &alias))
                }
                _ => None,
            },
        };

        let max_wait = parse_u64(&lookup, "DARUN_MAX_WAIT_SECS", file.max_wait_secs)?;
        let poll_interval =
            parse_u64(&lookup, "DARUN_POLL_INTERVAL_SECS", file.poll_interval_secs)?;
        let control_timeout =
            parse_u64(&lookup, "DARUN_CONTROL_TIMEOUT_SECS", file.control_timeout_secs)?;
        let transfer_timeout = parse_u64(
            &lookup,
            "DARUN_TRANSFER_TIMEOUT_SECS",
            file.transfer_timeout_secs,
        )?;
        let max_retries = parse_u64(
            &lookup,
            "DARUN_MAX_RETRIES",
            file.max_retries.map(u64::from),
        )?;
        let retry_base_ms = parse_u64(&lookup, "DARUN_RETRY_BASE_MS", file.retry_base_ms)?;

        let defaults = PollOptions::default();
        let poll = PollOptions {
            max_wait: max_wait.map(Duration::from_secs).unwrap_or(defaults.max_wait),
            poll_interval: poll_interval
                .map(Duration::from_secs)
                .unwrap_or(defaults.poll_interval),
        };
        if poll.poll_interval.is_zero() {
            return Err(ConfigError::Invalid {
                key: "DARUN_POLL_INTERVAL_SECS",
                message: "must be at least 1 second".to_string(),
            });
        }

        let timeouts = Timeouts {
            control: control_timeout
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_CONTROL_TIMEOUT),
            transfer: transfer_timeout
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_TRANSFER_TIMEOUT),
        }
        .normalized();

        let mut retry = RetryPolicy::default();
        if let Some(attempts) = max_retries {
            let attempts = u32::try_from(attempts).map_err(|_| ConfigError::Invalid {
                key: "DARUN_MAX_RETRIES",
                message: format!("{attempts} is too large"),
            })?;
            retry = retry.with_max_attempts(attempts.max(1));
        }
        if let Some(base_ms) = retry_base_ms {
            retry = retry.with_base_delay(Duration::from_millis(base_ms));
        }

        Ok(Self {
            credentials: ClientCredentials::new(client_id, client_secret),
            endpoints: Endpoints::new(base_url, region),
            scope,
            activity_id,
            poll,
            timeouts,
            retry,
        })
    }
}

fn parse_u64<L>(lookup: &L, key: &'static str, fallback: Option<u64>) -> Result<Option<u64>, ConfigError>
where
    L: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|err| ConfigError::Invalid {
                key,
                message: format!("{raw:?}: {err}"),
            }),
        None => Ok(fallback),
    }
}
