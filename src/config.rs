use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cache::EntityType;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
  #[serde(default)]
  pub server: ServerConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub log: LogConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
  /// REST base URL, e.g. "http://192.168.30.94:3000"
  #[serde(default = "default_url")]
  pub url: String,
  /// Per-request timeout applied to reads and writes
  #[serde(default = "default_timeout_ms")]
  pub timeout_ms: u64,
  #[serde(default)]
  pub endpoints: EndpointsConfig,
}

impl Default for ServerConfig {
  fn default() -> Self {
    Self {
      url: default_url(),
      timeout_ms: default_timeout_ms(),
      endpoints: EndpointsConfig::default(),
    }
  }
}

impl ServerConfig {
  pub fn timeout(&self) -> Duration {
    Duration::from_millis(self.timeout_ms)
  }
}

fn default_url() -> String {
  "http://localhost:3000".to_string()
}

fn default_timeout_ms() -> u64 {
  10_000
}

/// Path segment per entity type on the backend.
#[derive(Debug, Clone, Deserialize)]
pub struct EndpointsConfig {
  #[serde(default = "default_user_endpoint")]
  pub user: String,
  #[serde(default = "default_project_endpoint")]
  pub project: String,
  #[serde(default = "default_report_endpoint")]
  pub report: String,
  /// Segment after the user endpoint that creates accounts (`POST /usuarios/registrar`)
  #[serde(default = "default_user_register")]
  pub user_register: String,
  /// Segment after the report endpoint that lists one project's reports
  /// (`GET /reportes/proyecto/<id>`)
  #[serde(default = "default_reports_by_project")]
  pub reports_by_project: String,
}

impl Default for EndpointsConfig {
  fn default() -> Self {
    Self {
      user: default_user_endpoint(),
      project: default_project_endpoint(),
      report: default_report_endpoint(),
      user_register: default_user_register(),
      reports_by_project: default_reports_by_project(),
    }
  }
}

fn default_user_register() -> String {
  "registrar".to_string()
}

fn default_reports_by_project() -> String {
  "proyecto".to_string()
}

fn default_user_endpoint() -> String {
  "usuarios".to_string()
}

fn default_project_endpoint() -> String {
  "proyectos".to_string()
}

fn default_report_endpoint() -> String {
  "reportes".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
  /// Keep entries across restarts (false = memory-only)
  #[serde(default = "default_true")]
  pub persist: bool,
  /// Database path (default: $XDG_DATA_HOME/fieldsync/cache.db)
  #[serde(default)]
  pub path: Option<PathBuf>,
  #[serde(default)]
  pub ttl_secs: TtlConfig,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      persist: true,
      path: None,
      ttl_secs: TtlConfig::default(),
    }
  }
}

fn default_true() -> bool {
  true
}

/// Freshness window per entity type, in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct TtlConfig {
  #[serde(default = "default_user_ttl")]
  pub user: u64,
  #[serde(default = "default_project_ttl")]
  pub project: u64,
  #[serde(default = "default_report_ttl")]
  pub report: u64,
}

impl Default for TtlConfig {
  fn default() -> Self {
    Self {
      user: default_user_ttl(),
      project: default_project_ttl(),
      report: default_report_ttl(),
    }
  }
}

impl TtlConfig {
  pub fn for_type(&self, entity_type: EntityType) -> Duration {
    let secs = match entity_type {
      EntityType::User => self.user,
      EntityType::Project => self.project,
      EntityType::Report => self.report,
    };
    Duration::from_secs(secs)
  }
}

fn default_user_ttl() -> u64 {
  300
}

fn default_project_ttl() -> u64 {
  600
}

fn default_report_ttl() -> u64 {
  60
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
  /// Default filter when RUST_LOG is unset
  #[serde(default = "default_log_level")]
  pub level: String,
  /// Write to a daily rolling file here instead of stderr
  #[serde(default)]
  pub directory: Option<PathBuf>,
}

impl Default for LogConfig {
  fn default() -> Self {
    Self {
      level: default_log_level(),
      directory: None,
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
  /// 2. ./fieldsync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/fieldsync/config.yaml
  ///
  /// Falls back to defaults when no file is found.
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
      None => Ok(Self::default()),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("fieldsync.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("fieldsync").join("config.yaml");
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
    // An empty document deserializes as unit, not as an empty map
    if contents.trim().is_empty() {
      return Ok(Self::default());
    }
    Ok(serde_yaml::from_str(contents)?)
  }

  /// Get the API bearer token from the environment, if set.
  ///
  /// Checks FIELDSYNC_API_TOKEN.
  pub fn get_api_token() -> Option<String> {
    std::env::var("FIELDSYNC_API_TOKEN")
      .ok()
      .filter(|t| !t.trim().is_empty())
  }
}
