use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::retry::{millis, RetryPolicy};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
  pub backend: BackendConfig,
  pub sync: SyncConfig,
  pub retry: RetryPolicy,
  pub log: LogConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
  /// REST root, e.g. "https://firestore.googleapis.com/v1"
  pub base_url: String,
  pub project_id: String,
  pub database: String,
  pub request_timeout_secs: u64,
}

impl Default for BackendConfig {
  fn default() -> Self {
    Self {
      base_url: "https://firestore.googleapis.com/v1".to_string(),
      project_id: String::new(),
      database: "(default)".to_string(),
      request_timeout_secs: 30,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
  /// How often polling backends re-run live queries
  #[serde(deserialize_with = "millis::deserialize", rename = "poll_interval_ms")]
  pub poll_interval: Duration,
  /// TTL for cached reads of static collections
  #[serde(deserialize_with = "millis::deserialize", rename = "default_ttl_ms")]
  pub default_ttl: Duration,
  /// Maximum number of cached query results held in memory
  pub cache_capacity: usize,
  /// Keep the cache in SQLite so it survives restarts
  pub persistent_cache: bool,
  /// Collections whose reads are served from cache while fresh (case-insensitive)
  #[serde(deserialize_with = "deserialize_lowercase_set")]
  pub static_collections: BTreeSet<String>,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      poll_interval: Duration::from_secs(2),
      default_ttl: Duration::from_secs(5 * 60),
      cache_capacity: 1024,
      persistent_cache: false,
      static_collections: ["users", "classes"].into_iter().map(String::from).collect(),
    }
  }
}

impl SyncConfig {
  pub fn is_static(&self, collection: &str) -> bool {
    self.static_collections.contains(&collection.to_lowercase())
  }
}

fn deserialize_lowercase_set<'de, D>(deserializer: D) -> Result<BTreeSet<String>, D::Error>
where
  D: serde::Deserializer<'de>,
{
  let v: Vec<String> = Vec::deserialize(deserializer)?;
  Ok(v.into_iter().map(|s| s.to_lowercase()).collect())
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
  /// Default filter directive; RUST_LOG overrides it
  pub level: String,
  /// Directory for the rolling log file (default: data dir)
  pub directory: Option<PathBuf>,
}

impl Default for LogConfig {
  fn default() -> Self {
    Self {
      level: "info".to_string(),
      directory: None,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./classync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/classync/config.yaml
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

    let config = match path {
      Some(p) => Self::load_from_path(&p)?,
      None => {
        return Err(eyre!(
          "No configuration file found. Create one at ~/.config/classync/config.yaml\n\
                 with at least `backend: {{ project_id: <your-project> }}`."
        ))
      }
    };

    config.validate()?;
    Ok(config)
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("classync.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("classync").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::from_yaml(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn from_yaml(contents: &str) -> Result<Self, serde_yaml::Error> {
    serde_yaml::from_str(contents)
  }

  fn validate(&self) -> Result<()> {
    if self.backend.project_id.trim().is_empty() {
      return Err(eyre!("backend.project_id must be set"));
    }
    if self.sync.poll_interval.is_zero() {
      return Err(eyre!("sync.poll_interval_ms must be greater than zero"));
    }
    Ok(())
  }

  /// Get the backend access token from environment variables.
  ///
  /// Checks CLASSYNC_TOKEN first, then GOOGLE_OAUTH_ACCESS_TOKEN as fallback.
  /// Without a token, requests are sent unauthenticated and succeed only
  /// where the database rules allow public access.
  pub fn get_api_token() -> Option<String> {
    std::env::var("CLASSYNC_TOKEN")
      .or_else(|_| std::env::var("GOOGLE_OAUTH_ACCESS_TOKEN"))
      .ok()
      .filter(|t| !t.trim().is_empty())
  }
}
