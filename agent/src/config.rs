//! Configuration management for the agent.

use converge_engine::{KeptPrefixMode, Limits};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Agent configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Base URL of the management API
    pub api_url: String,
    /// Bearer token sent with every request
    pub api_token: Option<String>,
    /// Tenant every request is scoped to
    pub tenant: Option<String>,
    /// Declared configuration
    pub manifest_path: PathBuf,
    /// Observed state, rewritten after every pass
    pub state_path: PathBuf,
    pub limits: Limits,
    pub request_timeout: Duration,
    /// Attempts for requests against the assignment endpoint
    pub retry_attempts: u32,
    pub retry_delay: Duration,
    /// Overrides the kept-prefix mode of every policy when set
    pub kept_prefix: Option<KeptPrefixMode>,
    /// Re-read keyed collections before planning
    pub refresh: bool,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let api_url = lookup("API_URL")
            .filter(|url| !url.trim().is_empty())
            .ok_or(ConfigError::MissingApiUrl)?;

        let defaults = Limits::default();
        let limits = Limits {
            max_payload_bytes: parse_or(&lookup, "MAX_PAYLOAD_BYTES", defaults.max_payload_bytes)?,
            max_filter_length: parse_or(&lookup, "MAX_FILTER_LENGTH", defaults.max_filter_length)?,
        };

        let kept_prefix = match lookup("KEPT_PREFIX").as_deref() {
            None | Some("") => None,
            Some("preserve") => Some(KeptPrefixMode::Preserve),
            Some("replace") => Some(KeptPrefixMode::Replace),
            Some(other) => return Err(ConfigError::InvalidKeptPrefix(other.to_string())),
        };

        let refresh = match lookup("REFRESH").as_deref() {
            None | Some("") | Some("true") | Some("1") => true,
            Some("false") | Some("0") => false,
            Some(other) => {
                return Err(ConfigError::InvalidValue {
                    name: "REFRESH",
                    value: other.to_string(),
                })
            }
        };

        Ok(Self {
            api_url: api_url.trim_end_matches('/').to_string(),
            api_token: lookup("API_TOKEN").filter(|t| !t.is_empty()),
            tenant: lookup("TENANT").filter(|t| !t.is_empty()),
            manifest_path: lookup("MANIFEST_PATH")
                .unwrap_or_else(|| "manifest.json".to_string())
                .into(),
            state_path: lookup("STATE_PATH")
                .unwrap_or_else(|| "state.json".to_string())
                .into(),
            limits,
            request_timeout: Duration::from_secs(parse_or(&lookup, "REQUEST_TIMEOUT_SECS", 30)?),
            retry_attempts: parse_or(&lookup, "RETRY_ATTEMPTS", 5)?,
            retry_delay: Duration::from_millis(parse_or(&lookup, "RETRY_DELAY_MS", 1000)?),
            kept_prefix,
            refresh,
        })
    }
}

fn parse_or<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match lookup(name) {
        Some(value) if !value.is_empty() => value
            .parse()
            .map_err(|_| ConfigError::InvalidValue { name, value }),
        _ => Ok(default),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("API_URL environment variable is required")]
    MissingApiUrl,

    #[error("Invalid {name} value: {value}")]
    InvalidValue { name: &'static str, value: String },

    #[error("Invalid KEPT_PREFIX value: {0} (expected preserve or replace)")]
    InvalidKeptPrefix(String),
}
