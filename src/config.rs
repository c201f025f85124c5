use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::connection::RetryPolicy;
use crate::entity::EntityKind;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub remote: RemoteConfig,
  #[serde(default)]
  pub sync: SyncConfig,
  #[serde(default)]
  pub retry: RetryConfig,
  #[serde(default)]
  pub health: HealthConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteConfig {
  /// Base URL of the service (data API under /rest/v1, auth under /auth/v1)
  pub url: String,
}

/// What to do when the initial load does not finish in time.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LoadTimeoutPolicy {
  /// Throw away all state and load again from scratch
  #[default]
  Reload,
  /// Report the failure and let the user decide whether to retry
  Prompt,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
  /// Age after which a cached collection is refetched
  pub stale_after_secs: u64,
  /// Deadline for fetching one collection
  pub fetch_timeout_secs: u64,
  /// Deadline for the whole initial load
  pub load_timeout_secs: u64,
  pub on_load_timeout: LoadTimeoutPolicy,
  /// Upper bound on automatic reloads before giving up
  pub max_reloads: u32,
  /// Entity kinds to keep in sync
  pub kinds: Vec<EntityKind>,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      stale_after_secs: 300,
      fetch_timeout_secs: 10,
      load_timeout_secs: 10,
      on_load_timeout: LoadTimeoutPolicy::Reload,
      max_reloads: 3,
      kinds: EntityKind::ALL.to_vec(),
    }
  }
}

impl SyncConfig {
  pub fn stale_after(&self) -> Duration {
    Duration::from_secs(self.stale_after_secs)
  }

  pub fn fetch_timeout(&self) -> Duration {
    Duration::from_secs(self.fetch_timeout_secs)
  }

  pub fn load_timeout(&self) -> Duration {
    Duration::from_secs(self.load_timeout_secs)
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
  pub max_attempts: u32,
  pub base_delay_ms: u64,
  pub max_delay_ms: u64,
  pub request_timeout_secs: u64,
}

impl Default for RetryConfig {
  fn default() -> Self {
    Self {
      max_attempts: 3,
      base_delay_ms: 500,
      max_delay_ms: 5_000,
      request_timeout_secs: 10,
    }
  }
}

impl From<&RetryConfig> for RetryPolicy {
  fn from(c: &RetryConfig) -> Self {
    RetryPolicy {
      max_attempts: c.max_attempts.max(1),
      base_delay: Duration::from_millis(c.base_delay_ms),
      max_delay: Duration::from_millis(c.max_delay_ms),
      request_timeout: Duration::from_secs(c.request_timeout_secs),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
  /// Interval of the warm-up read against the backend
  pub keepalive_secs: u64,
  /// Interval of the session validity check
  pub session_check_secs: u64,
  /// Collection the keepalive reads from
  pub probe_kind: EntityKind,
}

impl Default for HealthConfig {
  fn default() -> Self {
    Self {
      keepalive_secs: 240,
      session_check_secs: 60,
      probe_kind: EntityKind::Article,
    }
  }
}

impl HealthConfig {
  pub fn keepalive_interval(&self) -> Duration {
    Duration::from_secs(self.keepalive_secs.max(1))
  }

  pub fn session_check_interval(&self) -> Duration {
    Duration::from_secs(self.session_check_secs.max(1))
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./strata.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/strata/config.yaml
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
        "No configuration file found. Create one at ~/.config/strata/config.yaml\n\
                 with at least `remote: {{ url: https://... }}`."
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("strata.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("strata").join("config.yaml");
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
    if config.sync.kinds.is_empty() {
      return Err(eyre!("sync.kinds must name at least one entity kind"));
    }
    Ok(config)
  }

  /// Get the service API key from environment variables.
  ///
  /// Checks STRATA_API_KEY first, then SUPABASE_ANON_KEY as fallback.
  pub fn get_api_key() -> Result<String> {
    std::env::var("STRATA_API_KEY")
      .or_else(|_| std::env::var("SUPABASE_ANON_KEY"))
      .map_err(|_| {
        eyre!("API key not found. Set STRATA_API_KEY or SUPABASE_ANON_KEY environment variable.")
      })
  }
}
