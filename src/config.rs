use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cache::{DEFAULT_CAPACITY, DEFAULT_TTL};
use crate::queue::{RetryPolicy, WorkerOptions};
use crate::sync::SyncOptions;

/// Environment variable holding the backend API token.
pub const TOKEN_ENV: &str = "LEDGER_SYNC_TOKEN";

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub remote: RemoteConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub store: StoreConfig,
  #[serde(default)]
  pub queue: QueueConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteConfig {
  pub url: String,
  #[serde(default = "default_timeout_secs")]
  pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// Entries held by the in-memory cache
  pub capacity: usize,
  pub ttl_secs: u64,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      capacity: DEFAULT_CAPACITY,
      ttl_secs: DEFAULT_TTL.as_secs(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
  /// SQLite file (defaults to $XDG_DATA_HOME/ledger-sync/sync.db)
  pub path: Option<PathBuf>,
  /// Synced rows older than this are removed by `evict`
  pub max_age_hours: u64,
}

impl Default for StoreConfig {
  fn default() -> Self {
    Self {
      path: None,
      max_age_hours: 168,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
  pub max_retries: u32,
  pub parallelism: usize,
  pub poll_interval_secs: u64,
  pub base_backoff_ms: u64,
  pub max_backoff_ms: u64,
}

impl Default for QueueConfig {
  fn default() -> Self {
    Self {
      max_retries: 5,
      parallelism: 4,
      poll_interval_secs: 30,
      base_backoff_ms: 1000,
      max_backoff_ms: 60_000,
    }
  }
}

fn default_timeout_secs() -> u64 {
  30
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./ledger-sync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/ledger-sync/config.yaml
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Err(eyre!(
        "No configuration file found. Create one at ~/.config/ledger-sync/config.yaml"
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("ledger-sync.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("ledger-sync").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;
    Self::parse(&contents).map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  fn parse(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    if config.remote.url.trim().is_empty() {
      return Err(eyre!("remote.url must not be empty"));
    }
    Ok(config)
  }

  /// API token from `LEDGER_SYNC_TOKEN`, if set.
  pub fn api_token() -> Option<String> {
    std::env::var(TOKEN_ENV).ok().filter(|t| !t.is_empty())
  }

  pub fn store_path(&self) -> Option<&Path> {
    self.store.path.as_deref()
  }

  pub fn max_age(&self) -> Result<chrono::Duration> {
    hours_to_duration(self.store.max_age_hours)
  }

  pub fn sync_options(&self) -> SyncOptions {
    SyncOptions {
      cache_capacity: self.cache.capacity,
      cache_ttl: Duration::from_secs(self.cache.ttl_secs),
      worker: WorkerOptions {
        poll_interval: Duration::from_secs(self.queue.poll_interval_secs),
        parallelism: self.queue.parallelism,
        request_timeout: Duration::from_secs(self.remote.timeout_secs),
        retry: RetryPolicy {
          max_retries: self.queue.max_retries,
          base_backoff: Duration::from_millis(self.queue.base_backoff_ms),
          max_backoff: Duration::from_millis(self.queue.max_backoff_ms),
        },
      },
    }
  }
}

/// Hour counts come from users; reject ones chrono cannot represent.
pub fn hours_to_duration(hours: u64) -> Result<chrono::Duration> {
  i64::try_from(hours)
    .ok()
    .and_then(chrono::Duration::try_hours)
    .ok_or_else(|| eyre!("{} hours is out of range", hours))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_minimal_config_uses_defaults() {
    let config = Config::parse("remote:\n  url: https://books.example.com/api\n").unwrap();
    assert_eq!(config.remote.timeout_secs, 30);
    assert_eq!(config.cache.capacity, 1000);
    assert_eq!(config.store.max_age_hours, 168);
    assert!(config.store_path().is_none());

    let options = config.sync_options();
    assert_eq!(options.cache_ttl, Duration::from_secs(300));
    assert_eq!(options.worker.parallelism, 4);
    assert_eq!(options.worker.retry.max_retries, 5);
    assert_eq!(options.worker.retry.max_backoff, Duration::from_secs(60));
  }

  #[test]
  fn test_sections_override_defaults() {
    let yaml = r#"
remote:
  url: http://localhost:8080
  timeout_secs: 5
cache:
  capacity: 50
store:
  path: /tmp/ledger.db
  max_age_hours: 2
queue:
  max_retries: 2
  base_backoff_ms: 10
"#;
    let config = Config::parse(yaml).unwrap();
    assert_eq!(config.store_path(), Some(Path::new("/tmp/ledger.db")));
    assert_eq!(config.max_age().unwrap(), chrono::Duration::hours(2));

    let options = config.sync_options();
    assert_eq!(options.cache_capacity, 50);
    assert_eq!(options.cache_ttl, Duration::from_secs(300));
    assert_eq!(options.worker.request_timeout, Duration::from_secs(5));
    assert_eq!(options.worker.retry.max_retries, 2);
    assert_eq!(options.worker.retry.base_backoff, Duration::from_millis(10));
    assert_eq!(options.worker.poll_interval, Duration::from_secs(30));
  }

  #[test]
  fn test_remote_url_is_required() {
    assert!(Config::parse("cache:\n  capacity: 10\n").is_err());
    assert!(Config::parse("remote:\n  url: \"\"\n").is_err());
  }

  #[test]
  fn test_missing_explicit_path_is_an_error() {
    let err = Config::load(Some(Path::new("/nonexistent/ledger-sync.yaml"))).unwrap_err();
    assert!(err.to_string().contains("not found"));
  }

  #[test]
  fn test_load_from_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.yaml");
    std::fs::write(&path, "remote:\n  url: https://books.example.com\n").unwrap();
    let config = Config::load(Some(&path)).unwrap();
    assert_eq!(config.remote.url, "https://books.example.com");
  }

  #[test]
  fn test_out_of_range_hours_are_rejected() {
    assert_eq!(hours_to_duration(0).unwrap(), chrono::Duration::zero());
    assert_eq!(hours_to_duration(24).unwrap(), chrono::Duration::days(1));
    assert!(hours_to_duration(u64::MAX).is_err());
    assert!(hours_to_duration(i64::MAX as u64).is_err());

    let yaml = "remote:\n  url: http://localhost\nstore:\n  max_age_hours: 18446744073709551615\n";
    let config = Config::parse(yaml).unwrap();
    let err = config.max_age().unwrap_err();
    assert!(err.to_string().contains("out of range"));
  }
}
