use chrono::Duration;
use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::cache::DEFAULT_TTL_SECS;
use crate::model::{EntityKind, Role};
use crate::remote::Document;

/// Environment variable overriding `cache.ttl_secs`.
pub const TTL_ENV: &str = "STOCKROOM_CACHE_TTL";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
  #[serde(default)]
  pub cache: CacheConfig,
  /// Roles loaded into the policy store at startup
  #[serde(default)]
  pub roles: Vec<Role>,
  /// Documents per collection for the in-memory store
  #[serde(default)]
  pub seed: BTreeMap<String, Vec<Value>>,
  #[serde(default)]
  pub log: LogConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
  #[serde(default = "default_ttl_secs")]
  pub ttl_secs: u64,
  /// Per-entity TTLs in seconds (e.g. `kit: 60`)
  #[serde(default)]
  pub ttl_overrides: BTreeMap<EntityKind, u64>,
  /// Mirror caches to a SQLite snapshot for offline restarts
  #[serde(default)]
  pub snapshot: bool,
  /// Snapshot location (defaults to the user data directory)
  pub snapshot_path: Option<PathBuf>,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      ttl_secs: default_ttl_secs(),
      ttl_overrides: BTreeMap::new(),
      snapshot: false,
      snapshot_path: None,
    }
  }
}

impl CacheConfig {
  pub fn default_ttl(&self) -> Duration {
    Duration::seconds(clamp_secs(self.ttl_secs))
  }

  pub fn ttl_for(&self, kind: EntityKind) -> Duration {
    self
      .ttl_overrides
      .get(&kind)
      .map(|secs| Duration::seconds(clamp_secs(*secs)))
      .unwrap_or_else(|| self.default_ttl())
  }
}

fn clamp_secs(secs: u64) -> i64 {
  i64::try_from(secs).unwrap_or(i64::MAX / 1_000)
}

fn default_ttl_secs() -> u64 {
  DEFAULT_TTL_SECS as u64
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
  /// Default filter directive when STOCKROOM_LOG is unset
  #[serde(default = "default_log_level")]
  pub level: String,
  /// Write daily-rolling log files here instead of stderr
  pub dir: Option<PathBuf>,
}

impl Default for LogConfig {
  fn default() -> Self {
    Self {
      level: default_log_level(),
      dir: None,
    }
  }
}

fn default_log_level() -> String {
  "info".to_string()
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./stockroom.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/stockroom/config.yaml
  ///
  /// Falls back to defaults when nothing is found.
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
      None => Self::default(),
    };

    config.with_env_overrides(|name| std::env::var(name).ok())
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("stockroom.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("stockroom").join("config.yaml");
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

  pub fn from_yaml(contents: &str) -> Result<Self> {
    serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))
  }

  /// Apply environment overrides using `lookup` to read variables.
  pub fn with_env_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
    if let Some(raw) = lookup(TTL_ENV) {
      self.cache.ttl_secs = raw
        .trim()
        .parse()
        .map_err(|_| eyre!("{} must be a number of seconds, got '{}'", TTL_ENV, raw))?;
    }
    Ok(self)
  }

  /// Seed documents grouped by collection. Every document needs a string `id`.
  pub fn seed_documents(&self) -> Result<Vec<(String, Vec<Document>)>> {
    self
      .seed
      .iter()
      .map(|(collection, values)| {
        let docs = values
          .iter()
          .map(|value| {
            let id = value
              .get("id")
              .and_then(Value::as_str)
              .ok_or_else(|| eyre!("Seed document in '{}' has no string id", collection))?;
            Ok(Document::new(id, value.clone()))
          })
          .collect::<Result<Vec<_>>>()?;
        Ok((collection.clone(), docs))
      })
      .collect()
  }
}
