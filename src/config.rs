// src/config.rs
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};
use tracing::{debug, info};

use crate::feed::{FallbackPolicy, FeedKind, PriceFeed};
use crate::fetch::FetchLimits;

pub const CONFIG_ENV: &str = "NEMPRICES_CONFIG";
pub const DEFAULT_CONFIG_FILE: &str = "nemprices.yaml";
const ENV_PREFIX: &str = "NEMPRICES_";

/// Runtime settings. Loaded from an optional YAML file, then overridden by
/// `NEMPRICES_*` environment variables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Root of the Parquet price history.
    pub data_dir: PathBuf,
    pub feeds: Vec<FeedKind>,
    /// Report files to try per feed before giving up.
    pub max_attempts: usize,
    pub attempt_delay_ms: u64,
    pub poll_interval_secs: u64,
    pub http_timeout_secs: u64,
    pub max_archive_bytes: u64,
    pub max_member_bytes: u64,
    pub fallback: FallbackPolicy,
    pub user_agent: String,
}

impl Default for Config {
    fn default() -> Self {
        let limits = FetchLimits::default();
        Self {
            data_dir: PathBuf::from("history"),
            feeds: vec![FeedKind::DispatchIs],
            max_attempts: 3,
            attempt_delay_ms: 1000,
            poll_interval_secs: 300,
            http_timeout_secs: 30,
            max_archive_bytes: limits.max_archive_bytes,
            max_member_bytes: limits.max_member_bytes,
            fallback: FallbackPolicy::Leave,
            user_agent: concat!("nemprices/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl Config {
    /// File named by `NEMPRICES_CONFIG`, else `nemprices.yaml` if present,
    /// else defaults; environment overrides on top.
    pub fn load() -> Result<Self> {
        let mut cfg = match env::var(CONFIG_ENV) {
            Ok(path) => Self::from_yaml_file(&path)?,
            Err(_) if Path::new(DEFAULT_CONFIG_FILE).is_file() => {
                Self::from_yaml_file(DEFAULT_CONFIG_FILE)?
            }
            Err(_) => {
                debug!("no config file; using defaults");
                Self::default()
            }
        };
        cfg.apply_env(|k| env::var(k).ok())?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let cfg = Self::from_yaml_str(&text)
            .with_context(|| format!("parsing config {}", path.display()))?;
        info!(path = %path.display(), "loaded config");
        Ok(cfg)
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(text)?)
    }

    /// Apply `NEMPRICES_<KEY>` overrides read through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(&format!("{}{}", ENV_PREFIX, key));

        if let Some(v) = get("DATA_DIR") {
            self.data_dir = PathBuf::from(v);
        }
        if let Some(v) = get("FEEDS") {
            self.feeds = v
                .split(',')
                .filter(|s| !s.trim().is_empty())
                .map(str::parse)
                .collect::<Result<_>>()
                .context("NEMPRICES_FEEDS")?;
        }
        if let Some(v) = get("MAX_ATTEMPTS") {
            self.max_attempts = v.trim().parse().context("NEMPRICES_MAX_ATTEMPTS")?;
        }
        if let Some(v) = get("ATTEMPT_DELAY_MS") {
            self.attempt_delay_ms = v.trim().parse().context("NEMPRICES_ATTEMPT_DELAY_MS")?;
        }
        if let Some(v) = get("POLL_INTERVAL_SECS") {
            self.poll_interval_secs = v.trim().parse().context("NEMPRICES_POLL_INTERVAL_SECS")?;
        }
        if let Some(v) = get("HTTP_TIMEOUT_SECS") {
            self.http_timeout_secs = v.trim().parse().context("NEMPRICES_HTTP_TIMEOUT_SECS")?;
        }
        if let Some(v) = get("MAX_ARCHIVE_BYTES") {
            self.max_archive_bytes = v.trim().parse().context("NEMPRICES_MAX_ARCHIVE_BYTES")?;
        }
        if let Some(v) = get("MAX_MEMBER_BYTES") {
            self.max_member_bytes = v.trim().parse().context("NEMPRICES_MAX_MEMBER_BYTES")?;
        }
        if let Some(v) = get("FALLBACK") {
            self.fallback = v.parse().context("NEMPRICES_FALLBACK")?;
        }
        if let Some(v) = get("USER_AGENT") {
            self.user_agent = v;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.feeds.is_empty() {
            bail!("no feeds configured");
        }
        if self.max_attempts == 0 {
            bail!("max_attempts must be at least 1");
        }
        if self.poll_interval_secs == 0 {
            bail!("poll_interval_secs must be at least 1");
        }
        if self.max_archive_bytes == 0 || self.max_member_bytes == 0 {
            bail!("byte limits must be non-zero");
        }
        Ok(())
    }

    pub fn price_feeds(&self) -> Vec<PriceFeed> {
        self.feeds.iter().map(|k| k.feed(self.fallback)).collect()
    }

    pub fn limits(&self) -> FetchLimits {
        FetchLimits {
            max_archive_bytes: self.max_archive_bytes,
            max_member_bytes: self.max_member_bytes,
        }
    }

    pub fn attempt_delay(&self) -> Duration {
        Duration::from_millis(self.attempt_delay_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }
}
