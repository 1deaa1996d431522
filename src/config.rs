use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use url::Url;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
  /// Origin the application is served from; manifest and request paths resolve against it
  pub origin: String,
  /// SQLite file holding caches and deferred actions (defaults to the user data dir)
  pub database: Option<PathBuf>,
  pub worker: WorkerConfig,
  pub network: NetworkConfig,
  pub connectivity: ConnectivityConfig,
  pub notifications: NotificationConfig,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      origin: "http://localhost:5000".to_string(),
      database: None,
      worker: WorkerConfig::default(),
      network: NetworkConfig::default(),
      connectivity: ConnectivityConfig::default(),
      notifications: NotificationConfig::default(),
    }
  }
}

/// Settings baked into one worker version.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
  /// Generation tag; bumping it invalidates every partition of the previous one
  pub version: String,
  pub static_prefix: String,
  pub dynamic_prefix: String,
  /// Path prefix of backend data endpoints
  pub api_prefix: String,
  /// Application shell resources fetched at install time
  pub precache: Vec<String>,
}

impl Default for WorkerConfig {
  fn default() -> Self {
    Self {
      version: "v1".to_string(),
      static_prefix: "eduquest-static".to_string(),
      dynamic_prefix: "eduquest-dynamic".to_string(),
      api_prefix: "/api/".to_string(),
      precache: [
        "/",
        "/index.html",
        "/static/js/bundle.js",
        "/static/css/main.css",
        "/manifest.json",
        "/favicon.ico",
      ]
      .iter()
      .map(|s| s.to_string())
      .collect(),
    }
  }
}

impl WorkerConfig {
  pub fn cache_names(&self) -> CacheNames {
    CacheNames {
      static_name: format!("{}-{}", self.static_prefix, self.version),
      dynamic_name: format!("{}-{}", self.dynamic_prefix, self.version),
    }
  }
}

/// Names of the partitions that are current for one worker version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheNames {
  pub static_name: String,
  pub dynamic_name: String,
}

impl CacheNames {
  pub fn is_current(&self, name: &str) -> bool {
    name == self.static_name || name == self.dynamic_name
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
  pub timeout_secs: u64,
}

impl Default for NetworkConfig {
  fn default() -> Self {
    Self { timeout_secs: 10 }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConnectivityConfig {
  /// Path probed to decide whether the origin is reachable
  pub probe_path: String,
  pub poll_secs: u64,
}

impl Default for ConnectivityConfig {
  fn default() -> Self {
    Self {
      probe_path: "/api/health".to_string(),
      poll_secs: 5,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
  pub title: String,
  pub icon: String,
  pub badge: String,
  /// Body used when a push arrives without a payload
  pub default_body: String,
}

impl Default for NotificationConfig {
  fn default() -> Self {
    Self {
      title: "EduQuest".to_string(),
      icon: "/logo192.png".to_string(),
      badge: "/logo192.png".to_string(),
      default_body: "New quiz available!".to_string(),
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./eduquest-sw.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/eduquest-sw/config.yaml
  ///
  /// Falls back to defaults when no file exists.
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
        tracing::info!("No configuration file found, using defaults");
        Config::default()
      }
    };

    config.validate()?;
    Ok(config)
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("eduquest-sw.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("eduquest-sw").join("config.yaml");
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
    serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))
  }

  fn validate(&self) -> Result<()> {
    self.origin_url()?;
    let names = self.worker.cache_names();
    if names.static_name == names.dynamic_name {
      return Err(eyre!(
        "Static and dynamic cache names collide: {}",
        names.static_name
      ));
    }
    if self.worker.version.trim().is_empty() {
      return Err(eyre!("worker.version must not be empty"));
    }
    Ok(())
  }

  pub fn origin_url(&self) -> Result<Url> {
    Url::parse(&self.origin).map_err(|e| eyre!("Invalid origin '{}': {}", self.origin, e))
  }

  /// Resolve an application path (or absolute URL) against the origin.
  pub fn resolve(&self, path: &str) -> Result<Url> {
    self
      .origin_url()?
      .join(path)
      .map_err(|e| eyre!("Invalid URL '{}': {}", path, e))
  }
}
