use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, PolicyError>;

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Serde JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid average hash '{0}'")]
    InvalidHash(String),
}

/// Reasons an advisory attempt did not produce a candidate decision.
///
/// Every variant leads to the heuristic fallback; none reaches the caller.
#[derive(Debug, Error)]
pub enum AdvisoryError {
    #[error("no advisory backend configured")]
    NotConfigured,

    #[error("advisory transport failed: {0}")]
    Transport(String),

    #[error("advisory returned status {0}")]
    Status(u16),

    #[error("advisory reply is not JSON: {0}")]
    Parse(String),

    #[error("advisory reply violates schema: {0}")]
    Schema(String),

    #[error("advisory timed out after {0} ms")]
    Timeout(u64),

    #[error("advisory task aborted: {0}")]
    Aborted(String),
}

impl AdvisoryError {
    /// Stable label for metrics and diagnostics.
    pub fn reason(&self) -> &'static str {
        match self {
            AdvisoryError::NotConfigured => "not_configured",
            AdvisoryError::Transport(_) => "transport",
            AdvisoryError::Status(_) => "status",
            AdvisoryError::Parse(_) => "parse",
            AdvisoryError::Schema(_) => "schema",
            AdvisoryError::Timeout(_) => "timeout",
            AdvisoryError::Aborted(_) => "aborted",
        }
    }
}

// The transport layer reports through anyhow; keep the chain in the message.
impl From<anyhow::Error> for AdvisoryError {
    fn from(err: anyhow::Error) -> Self {
        AdvisoryError::Transport(format!("{err:#}"))
    }
}
