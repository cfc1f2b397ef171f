use std::{
    env,
    net::SocketAddr,
    path::{Path, PathBuf},
};

use binsight_policy::{load_policy_strict, PolicyConfig};
use serde::Serialize;

use crate::error::{CoreError, Result};

const DEFAULT_ADDR: &str = "0.0.0.0:8080";
const DEFAULT_POLICY_PATH: &str = "./policies/recycling.yaml";
const DEFAULT_ADVISORY_MODEL: &str = "openai/gpt-oss-20b";
const DEFAULT_HTTP_TIMEOUT_MS: u64 = 5000;
const DEFAULT_HTTP_CONCURRENCY: u64 = 512;
const DEFAULT_ALLOWED_ORIGIN: &str = "http://127.0.0.1:8080";

/// Process-level settings read from the environment.
///
/// Everything that shapes a disposal decision lives in the policy file;
/// these flags only wire the service together.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceFlags {
    pub addr: String,
    pub policy_path: PathBuf,
    pub advisory_url: Option<String>,
    #[serde(skip)]
    pub advisory_key: Option<String>,
    pub advisory_model: String,
    /// 0 disables the request timeout.
    pub http_timeout_ms: u64,
    /// 0 disables the concurrency limit.
    pub http_concurrency: u64,
    pub allowed_origin: String,
    pub expose_docs: bool,
    pub events: bool,
    pub data_dir: PathBuf,
    pub log_dir: Option<PathBuf>,
}

impl Default for ServiceFlags {
    fn default() -> Self {
        Self {
            addr: DEFAULT_ADDR.into(),
            policy_path: DEFAULT_POLICY_PATH.into(),
            advisory_url: None,
            advisory_key: None,
            advisory_model: DEFAULT_ADVISORY_MODEL.into(),
            http_timeout_ms: DEFAULT_HTTP_TIMEOUT_MS,
            http_concurrency: DEFAULT_HTTP_CONCURRENCY,
            allowed_origin: DEFAULT_ALLOWED_ORIGIN.into(),
            expose_docs: false,
            events: false,
            data_dir: default_data_dir(),
            log_dir: None,
        }
    }
}

fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| ".".into())
        .join(".binsight")
}

/// First non-empty value among `keys`.
fn env_first(keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|k| env::var(k).ok())
        .map(|v| v.trim().to_string())
        .find(|v| !v.is_empty())
}

fn env_u64(key: &str, default: u64) -> u64 {
    match env::var(key) {
        Ok(v) => v.trim().parse::<u64>().unwrap_or_else(|_| {
            tracing::warn!("Invalid value for {key}='{v}', falling back to {default}");
            default
        }),
        Err(_) => default,
    }
}

fn env_bool(key: &str) -> bool {
    env::var(key)
        .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(false)
}

impl ServiceFlags {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            addr: env_first(&["BINSIGHT_ADDR"]).unwrap_or(defaults.addr),
            policy_path: env_first(&["BINSIGHT_POLICY"])
                .map(PathBuf::from)
                .unwrap_or(defaults.policy_path),
            advisory_url: env_first(&["BINSIGHT_ADVISORY_URL", "LLM_ENDPOINT"]),
            advisory_key: env_first(&["BINSIGHT_ADVISORY_KEY", "LLM_KEY"]),
            advisory_model: env_first(&["BINSIGHT_ADVISORY_MODEL", "LLM_MODEL"])
                .unwrap_or(defaults.advisory_model),
            http_timeout_ms: env_u64("BINSIGHT_HTTP_TIMEOUT_MS", DEFAULT_HTTP_TIMEOUT_MS),
            http_concurrency: env_u64("BINSIGHT_HTTP_CONCURRENCY", DEFAULT_HTTP_CONCURRENCY),
            allowed_origin: env_first(&["BINSIGHT_ALLOWED_ORIGIN"])
                .unwrap_or(defaults.allowed_origin),
            expose_docs: env_bool("BINSIGHT_EXPOSE_DOCS"),
            events: env_bool("BINSIGHT_EVENTS"),
            data_dir: env_first(&["BINSIGHT_DATA"])
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            log_dir: env_first(&["BINSIGHT_LOG_DIR"]).map(PathBuf::from),
        }
    }

    pub fn socket_addr(&self) -> Result<SocketAddr> {
        self.addr
            .parse()
            .map_err(|err| CoreError::Config(format!("invalid BINSIGHT_ADDR '{}': {err}", self.addr)))
    }

    pub fn events_dir(&self) -> Option<PathBuf> {
        self.events.then(|| self.data_dir.join("events"))
    }
}

/// Loads the service policy. A missing file falls back to the built-in
/// policy; a file that exists but does not parse is a startup error.
pub fn load_service_policy(path: &Path) -> Result<PolicyConfig> {
    if !path.exists() {
        tracing::warn!(
            path = %path.display(),
            "policy file not found, using built-in policy"
        );
        return Ok(PolicyConfig::default());
    }
    Ok(load_policy_strict(path)?)
}
