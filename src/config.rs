use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub ttl_secs: u64,
    pub max_entries: usize,
    pub sweep_interval_secs: u64,
    /// Persist entries in Postgres so they outlive a single command.
    pub external: bool,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            ttl_secs: 300,
            max_entries: 256,
            sweep_interval_secs: 60,
            external: false,
        }
    }
}

impl CacheSettings {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub database_url: Option<String>,
    pub max_connections: u32,
    pub request_timeout_ms: u64,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
    pub cache: CacheSettings,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            max_connections: 5,
            request_timeout_ms: 5_000,
            max_retries: 2,
            retry_backoff_ms: 1_000,
            cache: CacheSettings::default(),
        }
    }
}

impl AppConfig {
    /// Reads the optional JSON file, then applies environment overrides.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("invalid config file {}", path.display()))
    }

    pub fn apply_overrides<F>(&mut self, lookup: F) -> anyhow::Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parse<T: std::str::FromStr>(key: &str, raw: String) -> anyhow::Result<T> {
            raw.trim()
                .parse()
                .map_err(|_| anyhow::anyhow!("{key} has invalid value '{raw}'"))
        }

        if let Some(url) = lookup("DATABASE_URL") {
            self.database_url = Some(url);
        }
        if let Some(raw) = lookup("EDUFAM_MAX_CONNECTIONS") {
            self.max_connections = parse("EDUFAM_MAX_CONNECTIONS", raw)?;
        }
        if let Some(raw) = lookup("EDUFAM_REQUEST_TIMEOUT_MS") {
            self.request_timeout_ms = parse("EDUFAM_REQUEST_TIMEOUT_MS", raw)?;
        }
        if let Some(raw) = lookup("EDUFAM_MAX_RETRIES") {
            self.max_retries = parse("EDUFAM_MAX_RETRIES", raw)?;
        }
        if let Some(raw) = lookup("EDUFAM_RETRY_BACKOFF_MS") {
            self.retry_backoff_ms = parse("EDUFAM_RETRY_BACKOFF_MS", raw)?;
        }
        if let Some(raw) = lookup("EDUFAM_CACHE_TTL_SECS") {
            self.cache.ttl_secs = parse("EDUFAM_CACHE_TTL_SECS", raw)?;
        }
        if let Some(raw) = lookup("EDUFAM_CACHE_MAX_ENTRIES") {
            self.cache.max_entries = parse("EDUFAM_CACHE_MAX_ENTRIES", raw)?;
        }
        if let Some(raw) = lookup("EDUFAM_CACHE_EXTERNAL") {
            self.cache.external = parse("EDUFAM_CACHE_EXTERNAL", raw)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.request_timeout_ms == 0 {
            bail!("request_timeout_ms must be greater than zero");
        }
        if self.max_connections == 0 {
            bail!("max_connections must be greater than zero");
        }
        if self.cache.max_entries == 0 {
            bail!("cache.max_entries must be greater than zero");
        }
        if self.cache.sweep_interval_secs == 0 {
            bail!("cache.sweep_interval_secs must be greater than zero");
        }
        Ok(())
    }

    pub fn database_url(&self) -> anyhow::Result<&str> {
        self.database_url
            .as_deref()
            .context("DATABASE_URL must be set to a production Postgres instance")
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}
