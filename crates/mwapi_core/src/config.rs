use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub const DEFAULT_USER_AGENT: &str = "mwapi/0.1";
pub const DEFAULT_CACHE_DIR: &str = ".mwapi/apicache";

const DEFAULT_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_MAX_RETRIES: usize = 2;
const DEFAULT_RETRY_DELAY_MS: u64 = 500;
const DEFAULT_RATE_LIMIT_READ_MS: u64 = 0;
const DEFAULT_RATE_LIMIT_WRITE_MS: u64 = 1_000;
const DEFAULT_MAX_URL_LENGTH: usize = 4_000;
const DEFAULT_MAXLAG: u64 = 5;
const DEFAULT_CACHE_TTL_MINUTES: u64 = 60;

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct ClientConfig {
    #[serde(default)]
    pub wiki: WikiSection,
    #[serde(default)]
    pub http: HttpSection,
    #[serde(default)]
    pub cache: CacheSection,
    #[serde(default)]
    pub strict_params: bool,
    /// Skip the `WIKI_*` environment overrides.
    #[serde(skip)]
    pub ignore_env: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct WikiSection {
    pub api_url: Option<String>,
    pub user_agent: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct HttpSection {
    pub timeout_ms: Option<u64>,
    pub max_retries: Option<usize>,
    pub retry_delay_ms: Option<u64>,
    pub rate_limit_read_ms: Option<u64>,
    pub rate_limit_write_ms: Option<u64>,
    pub max_url_length: Option<usize>,
    /// Seconds passed as `maxlag` on write requests; 0 disables it.
    pub maxlag: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct CacheSection {
    pub dir: Option<PathBuf>,
    pub ttl_minutes: Option<u64>,
}

impl ClientConfig {
    /// A config pointing at `api_url` with every other value defaulted.
    pub fn for_api_url(api_url: impl Into<String>) -> Self {
        Self {
            wiki: WikiSection {
                api_url: Some(api_url.into()),
                ..WikiSection::default()
            },
            ..Self::default()
        }
    }

    /// The same config resolved from its own values only, without `WIKI_*` overrides.
    pub fn without_env(mut self) -> Self {
        self.ignore_env = true;
        self
    }

    /// Resolve the API URL: env WIKI_API_URL > config.
    pub fn api_url(&self) -> Result<String> {
        self.env_override("WIKI_API_URL")
            .or_else(|| self.wiki.api_url.clone())
            .map(|url| url.trim().to_string())
            .filter(|url| !url.is_empty())
            .ok_or_else(|| Error::Config("no API URL; set WIKI_API_URL or [wiki].api_url".into()))
    }

    /// Resolve user agent: env WIKI_USER_AGENT > config > DEFAULT_USER_AGENT.
    pub fn user_agent(&self) -> String {
        self.env_override("WIKI_USER_AGENT")
            .or_else(|| self.wiki.user_agent.clone())
            .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string())
    }

    pub fn username(&self) -> Option<String> {
        self.env_override("WIKI_USERNAME").or_else(|| self.wiki.username.clone())
    }

    pub fn password(&self) -> Option<String> {
        self.env_override("WIKI_PASSWORD").or_else(|| self.wiki.password.clone())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(
            self.env_parsed("WIKI_HTTP_TIMEOUT_MS")
                .or(self.http.timeout_ms)
                .unwrap_or(DEFAULT_TIMEOUT_MS),
        )
    }

    pub fn max_retries(&self) -> usize {
        self.env_parsed("WIKI_HTTP_RETRIES")
            .or(self.http.max_retries)
            .unwrap_or(DEFAULT_MAX_RETRIES)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.http.retry_delay_ms.unwrap_or(DEFAULT_RETRY_DELAY_MS))
    }

    pub fn rate_limit(&self, is_write: bool) -> Duration {
        let millis = if is_write {
            self.http
                .rate_limit_write_ms
                .unwrap_or(DEFAULT_RATE_LIMIT_WRITE_MS)
        } else {
            self.http
                .rate_limit_read_ms
                .unwrap_or(DEFAULT_RATE_LIMIT_READ_MS)
        };
        Duration::from_millis(millis)
    }

    pub fn max_url_length(&self) -> usize {
        self.http.max_url_length.unwrap_or(DEFAULT_MAX_URL_LENGTH)
    }

    pub fn maxlag(&self) -> Option<u64> {
        match self.http.maxlag.unwrap_or(DEFAULT_MAXLAG) {
            0 => None,
            seconds => Some(seconds),
        }
    }

    /// Resolve the response cache directory: env WIKI_CACHE_DIR > config > DEFAULT_CACHE_DIR.
    pub fn cache_dir(&self) -> PathBuf {
        self.env_override("WIKI_CACHE_DIR")
            .map(PathBuf::from)
            .or_else(|| self.cache.dir.clone())
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CACHE_DIR))
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(
            self.cache
                .ttl_minutes
                .unwrap_or(DEFAULT_CACHE_TTL_MINUTES)
                .saturating_mul(60),
        )
    }
}

/// Load and parse a ClientConfig from a TOML file. Returns default if file doesn't exist.
pub fn load_config(config_path: &Path) -> Result<ClientConfig> {
    if !config_path.exists() {
        return Ok(ClientConfig::default());
    }
    let content = fs::read_to_string(config_path).map_err(|e| Error::io(config_path, e))?;
    toml::from_str(&content)
        .map_err(|e| Error::Config(format!("failed to parse {}: {e}", config_path.display())))
}

impl ClientConfig {
    fn env_override(&self, key: &str) -> Option<String> {
        if self.ignore_env {
            return None;
        }
        env::var(key)
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    }

    fn env_parsed<T: std::str::FromStr>(&self, key: &str) -> Option<T> {
        self.env_override(key)
            .and_then(|value| value.parse::<T>().ok())
    }
}
