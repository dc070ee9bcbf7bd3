use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use catsync_storage::BackoffPolicy;
use catsync_transform::TransformConfig;
use serde::{Deserialize, Serialize};

pub const DEFAULT_CONFIG_PATH: &str = "catsync.yaml";

pub const ENV_FEED_URL: &str = "CATSYNC_FEED_URL";
pub const ENV_SHOP_DOMAIN: &str = "CATSYNC_SHOP_DOMAIN";
pub const ENV_ACCESS_TOKEN: &str = "CATSYNC_ACCESS_TOKEN";

/// Everything the daemon needs besides the transform rules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    pub feed_url: Option<String>,
    pub feed_path: Option<PathBuf>,
    pub shop_domain: Option<String>,
    pub access_token: Option<String>,
    pub api_version: String,
    pub monitor_interval_minutes: u64,
    pub max_retry_attempts: usize,
    pub retry_delay_seconds: u64,
    pub max_sync_errors: u32,
    pub state_file_path: PathBuf,
    pub feed_cache_dir: PathBuf,
    pub published_feed_path: Option<PathBuf>,
    pub http_timeout_secs: u64,
    pub user_agent: String,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            feed_url: None,
            feed_path: None,
            shop_domain: None,
            access_token: None,
            api_version: "2023-10".to_string(),
            monitor_interval_minutes: 30,
            max_retry_attempts: 3,
            retry_delay_seconds: 60,
            max_sync_errors: 5,
            state_file_path: PathBuf::from("sync_state.json"),
            feed_cache_dir: PathBuf::from("feed_cache"),
            published_feed_path: None,
            http_timeout_secs: 30,
            user_agent: format!("catsync/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl SyncSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.monitor_interval_minutes.saturating_mul(60))
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy::from_retry_settings(
            self.max_retry_attempts,
            Duration::from_secs(self.retry_delay_seconds),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub transform: TransformConfig,
    pub sync: SyncSettings,
}

impl AppConfig {
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).context("parsing catsync config")
    }

    /// Reads `path` and applies environment overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let mut config: Self = serde_yaml::from_str(&text)
            .with_context(|| format!("parsing config {}", path.display()))?;
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// An explicit path must exist. Without one, `catsync.yaml` is used when present and the
    /// built-in defaults otherwise.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => {
                let default_path = Path::new(DEFAULT_CONFIG_PATH);
                if default_path.exists() {
                    Self::load(default_path)
                } else {
                    let mut config = Self::default();
                    config.apply_overrides(|key| std::env::var(key).ok());
                    Ok(config)
                }
            }
        }
    }

    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        if let Some(url) = non_empty(ENV_FEED_URL) {
            self.sync.feed_url = Some(url);
        }
        if let Some(domain) = non_empty(ENV_SHOP_DOMAIN) {
            self.sync.shop_domain = Some(domain);
        }
        if let Some(token) = non_empty(ENV_ACCESS_TOKEN) {
            self.sync.access_token = Some(token);
        }
    }

    /// Checks the settings a sync cycle cannot run without.
    pub fn validate_for_sync(&self) -> Result<()> {
        let sync = &self.sync;
        if sync.feed_url.is_none() && sync.feed_path.is_none() {
            bail!("sync.feed_url or sync.feed_path must be set (or {ENV_FEED_URL})");
        }
        if sync.shop_domain.as_deref().map_or(true, str::is_empty) {
            bail!("sync.shop_domain must be set (or {ENV_SHOP_DOMAIN})");
        }
        if sync.access_token.as_deref().map_or(true, str::is_empty) {
            bail!("sync.access_token must be set (or {ENV_ACCESS_TOKEN})");
        }
        if sync.monitor_interval_minutes == 0 {
            bail!("sync.monitor_interval_minutes must be at least 1");
        }
        Ok(())
    }
}

pub fn sample_config_yaml() -> Result<String> {
    let mut config = AppConfig::default();
    config.sync.feed_url = Some("https://supplier.example.com/feed.xml".to_string());
    config.sync.shop_domain = Some("your-store.myshopify.com".to_string());
    config.sync.published_feed_path = Some(PathBuf::from("stockmount_feed.xml"));
    let body = serde_yaml::to_string(&config).context("rendering sample config")?;
    Ok(format!(
        "# catsync configuration\n# Secrets are better passed as {ENV_ACCESS_TOKEN}; {ENV_FEED_URL} and {ENV_SHOP_DOMAIN} also override this file.\n{body}"
    ))
}

/// Writes the sample config to `path`. Never replaces an existing file.
pub fn write_sample_config(path: &Path) -> Result<()> {
    use std::io::Write;

    let text = sample_config_yaml()?;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .with_context(|| format!("creating {} (refusing to overwrite an existing file)", path.display()))?;
    file.write_all(text.as_bytes())
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}
