//! Configuration loader and validator for the feed synchronizer.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::feed::retry::RetryPolicy;
use crate::fetcher::FetchSettings;

/// Environment variable that overrides `feed.token`.
pub const TOKEN_ENV: &str = "NAV_API_TOKEN";
/// Environment variable that overrides the SQLite URL derived from `app.data_dir`.
pub const DATABASE_URL_ENV: &str = "DATABASE_URL";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema exactly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    pub feed: Feed,
    pub sync: SyncSettings,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
}

/// Upstream feed API settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Feed {
    pub base_url: String,
    /// Bearer token. May be left empty when `NAV_API_TOKEN` is set.
    #[serde(default)]
    pub token: String,
    pub user_agent: String,
    pub request_timeout_ms: u64,
}

/// Detail fetch pool and retry settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SyncSettings {
    pub workers: usize,
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
}

impl App {
    /// `data_dir` with a leading `~/` expanded.
    pub fn resolved_data_dir(&self) -> String {
        match self.data_dir.strip_prefix("~/") {
            Some(rest) => match std::env::var("HOME") {
                Ok(home) => format!("{}/{}", home.trim_end_matches('/'), rest),
                Err(_) => self.data_dir.clone(),
            },
            None => self.data_dir.clone(),
        }
    }
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(self.app.resolved_data_dir())
    }

    /// `DATABASE_URL` if set, otherwise a SQLite file under `app.data_dir`.
    pub fn database_url(&self) -> String {
        std::env::var(DATABASE_URL_ENV)
            .unwrap_or_else(|_| format!("sqlite://{}/jobfeed.db", self.app.resolved_data_dir()))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.feed.request_timeout_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.sync.max_attempts,
            base_delay: Duration::from_millis(self.sync.backoff_base_ms),
            max_delay: Duration::from_millis(self.sync.backoff_max_ms),
        }
    }

    pub fn fetch_settings(&self) -> FetchSettings {
        FetchSettings {
            workers: self.sync.workers,
            request_timeout: self.request_timeout(),
            retry: self.retry_policy(),
        }
    }
}

/// Load configuration from a YAML file, apply environment overrides and
/// validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let mut cfg: Config = serde_yaml::from_str(&content)?;
    apply_overrides(&mut cfg, |key| std::env::var(key).ok());
    validate(&cfg)?;
    Ok(cfg)
}

/// Apply environment overrides through `lookup`.
pub fn apply_overrides<F>(cfg: &mut Config, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(token) = lookup(TOKEN_ENV).filter(|t| !t.trim().is_empty()) {
        cfg.feed.token = token;
    }
}

/// Validate a configuration instance.
fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }

    if cfg.feed.base_url.trim().is_empty() {
        return Err(ConfigError::Invalid("feed.base_url must be non-empty"));
    }
    if reqwest::Url::parse(&cfg.feed.base_url).is_err() {
        return Err(ConfigError::Invalid("feed.base_url must be an absolute URL"));
    }
    if cfg.feed.token.trim().is_empty() {
        return Err(ConfigError::Invalid(
            "feed.token must be non-empty (or set NAV_API_TOKEN)",
        ));
    }
    if cfg.feed.user_agent.trim().is_empty() {
        return Err(ConfigError::Invalid("feed.user_agent must be non-empty"));
    }
    if cfg.feed.request_timeout_ms == 0 {
        return Err(ConfigError::Invalid("feed.request_timeout_ms must be > 0"));
    }

    if cfg.sync.workers == 0 {
        return Err(ConfigError::Invalid("sync.workers must be > 0"));
    }
    if cfg.sync.max_attempts == 0 {
        return Err(ConfigError::Invalid("sync.max_attempts must be > 0"));
    }
    if cfg.sync.backoff_max_ms < cfg.sync.backoff_base_ms {
        return Err(ConfigError::Invalid(
            "sync.backoff_max_ms must be >= sync.backoff_base_ms",
        ));
    }

    Ok(())
}

/// Returns the example YAML content.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"

feed:
  base_url: "https://pam-stilling-feed.nav.no/"
  token: "YOUR_NAV_API_TOKEN"
  user_agent: "jobfeed-sync/0.1"
  request_timeout_ms: 30000

sync:
  workers: 10
  max_attempts: 3
  backoff_base_ms: 1000
  backoff_max_ms: 30000
"#
}
