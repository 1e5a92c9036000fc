//! Configuration loader and validator for the offline submission daemon.
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

pub const MAX_RETENTION_HOURS: u64 = 24 * 365 * 10;
pub const MAX_CLEANUP_INTERVAL_MINUTES: u64 = 60 * 24 * 365;
pub const MAX_DATA_CACHE_PURGE_HOURS: u64 = 24 * 365;

static TABLE_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("valid table name regex"));

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
    pub supabase: Supabase,
    pub cloudinary: Cloudinary,
    #[serde(default)]
    pub images: Images,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    pub probe_interval_ms: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    pub replay_timeout_seconds: u64,
    pub retention_hours: u64,
    pub cleanup_interval_minutes: u64,
    #[serde(default = "default_data_cache_purge_hours")]
    pub data_cache_purge_hours: u64,
    #[serde(default = "default_true")]
    pub retry_failed_on_reconnect: bool,
}

fn default_poll_interval_ms() -> u64 {
    5000
}

fn default_data_cache_purge_hours() -> u64 {
    6
}

fn default_true() -> bool {
    true
}

/// REST endpoint of the hosted database.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Supabase {
    pub url: String,
    pub anon_key: String,
    pub tables: Tables,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Tables {
    pub revision: String,
    pub note: String,
}

/// Image CDN used for attachments (unsigned uploads).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Cloudinary {
    #[serde(default = "default_cloudinary_base")]
    pub base_url: String,
    pub cloud_name: String,
    pub upload_preset: String,
}

fn default_cloudinary_base() -> String {
    "https://api.cloudinary.com/".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Images {
    pub max_dimension: u32,
    pub target_bytes: usize,
}

impl Default for Images {
    fn default() -> Self {
        Self {
            max_dimension: 1600,
            target_bytes: 1024 * 1024,
        }
    }
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.app.data_dir)
    }

    pub fn database_url(&self) -> String {
        std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| format!("sqlite://{}/casitas.db", self.app.data_dir))
    }
}

impl App {
    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn replay_timeout(&self) -> Duration {
        Duration::from_secs(self.replay_timeout_seconds)
    }

    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::hours(self.retention_hours.min(MAX_RETENTION_HOURS) as i64)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_minutes.saturating_mul(60))
    }

    pub fn data_cache_purge_interval(&self) -> Duration {
        Duration::from_secs(self.data_cache_purge_hours.saturating_mul(3600))
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    if cfg.app.probe_interval_ms == 0 {
        return Err(ConfigError::Invalid("app.probe_interval_ms must be > 0"));
    }
    if cfg.app.poll_interval_ms == 0 {
        return Err(ConfigError::Invalid("app.poll_interval_ms must be > 0"));
    }
    if cfg.app.replay_timeout_seconds == 0 {
        return Err(ConfigError::Invalid("app.replay_timeout_seconds must be > 0"));
    }
    if cfg.app.retention_hours == 0 {
        return Err(ConfigError::Invalid("app.retention_hours must be > 0"));
    }
    if cfg.app.retention_hours > MAX_RETENTION_HOURS {
        return Err(ConfigError::Invalid("app.retention_hours must be at most ten years"));
    }
    if cfg.app.cleanup_interval_minutes == 0 {
        return Err(ConfigError::Invalid("app.cleanup_interval_minutes must be > 0"));
    }
    if cfg.app.cleanup_interval_minutes > MAX_CLEANUP_INTERVAL_MINUTES {
        return Err(ConfigError::Invalid("app.cleanup_interval_minutes must be at most one year"));
    }
    if cfg.app.data_cache_purge_hours == 0 {
        return Err(ConfigError::Invalid("app.data_cache_purge_hours must be > 0"));
    }
    if cfg.app.data_cache_purge_hours > MAX_DATA_CACHE_PURGE_HOURS {
        return Err(ConfigError::Invalid("app.data_cache_purge_hours must be at most one year"));
    }

    if cfg.supabase.url.trim().is_empty() {
        return Err(ConfigError::Invalid("supabase.url must be non-empty"));
    }
    if cfg.supabase.anon_key.trim().is_empty() {
        return Err(ConfigError::Invalid("supabase.anon_key must be non-empty"));
    }
    if !TABLE_NAME.is_match(&cfg.supabase.tables.revision) {
        return Err(ConfigError::Invalid("supabase.tables.revision must be a table identifier"));
    }
    if !TABLE_NAME.is_match(&cfg.supabase.tables.note) {
        return Err(ConfigError::Invalid("supabase.tables.note must be a table identifier"));
    }

    if cfg.cloudinary.cloud_name.trim().is_empty() {
        return Err(ConfigError::Invalid("cloudinary.cloud_name must be non-empty"));
    }
    if cfg.cloudinary.upload_preset.trim().is_empty() {
        return Err(ConfigError::Invalid("cloudinary.upload_preset must be non-empty"));
    }

    if cfg.images.max_dimension == 0 {
        return Err(ConfigError::Invalid("images.max_dimension must be > 0"));
    }
    if cfg.images.target_bytes == 0 {
        return Err(ConfigError::Invalid("images.target_bytes must be > 0"));
    }

    Ok(())
}

/// Returns an example configuration with every field populated.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  probe_interval_ms: 5000
  poll_interval_ms: 5000
  replay_timeout_seconds: 60
  retention_hours: 168
  cleanup_interval_minutes: 60
  data_cache_purge_hours: 6
  retry_failed_on_reconnect: true

supabase:
  url: "https://YOUR_PROJECT.supabase.co"
  anon_key: "YOUR_SUPABASE_ANON_KEY"
  tables:
    revision: "revisiones_casitas"
    note: "Notas"

cloudinary:
  cloud_name: "YOUR_CLOUD_NAME"
  upload_preset: "YOUR_UNSIGNED_PRESET"

images:
  max_dimension: 1600
  target_bytes: 1048576
"#
}
