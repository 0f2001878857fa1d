//! Unified error handling for the agent.

use crate::config::ConfigError;
use converge_engine::ApiError;

/// Agent error type.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Engine error: {0}")]
    Engine(#[from] converge_engine::Error),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid JSON in {path}: {source}")]
    Json {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

impl From<ApiError> for AgentError {
    fn from(err: ApiError) -> Self {
        AgentError::Engine(err.into())
    }
}

impl AgentError {
    pub(crate) fn io(path: &std::path::Path, source: std::io::Error) -> Self {
        AgentError::Io {
            path: path.display().to_string(),
            source,
        }
    }

    pub(crate) fn json(path: &std::path::Path, source: serde_json::Error) -> Self {
        AgentError::Json {
            path: path.display().to_string(),
            source,
        }
    }
}

/// Result type alias for the agent.
pub type Result<T> = std::result::Result<T, AgentError>;
