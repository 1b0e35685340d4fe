//! Configuration loaded from a JSON file.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

const APP_DIR: &str = "mpv-trakt-sync";

#[derive(Debug, Error)]
pub enum ConfigError {
  #[error("Failed to read {path}: {source}")]
  Io {
    path: String,
    #[source]
    source: std::io::Error,
  },

  #[error("Failed to parse {path}: {source}")]
  Parse {
    path: String,
    #[source]
    source: serde_json::Error,
  },

  #[error("Invalid configuration: {0}")]
  Invalid(String),
}

/// Application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
  #[serde(default)]
  pub monitor: MonitorConfig,

  /// trakt credentials. No token is requested when absent.
  #[serde(default)]
  pub trakt: Option<TraktConfig>,
}

/// Where to reach mpv's `--input-ipc-server`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitorConfig {
  /// Unix domain socket path (Linux/macOS).
  #[serde(default = "default_socket_path")]
  pub socket_path: PathBuf,

  /// Named pipe path (Windows).
  #[serde(default = "default_pipe_path")]
  pub pipe_path: PathBuf,

  /// Give up opening the named pipe after this many retries (None = never).
  #[serde(default)]
  pub pipe_connect_retries: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraktConfig {
  pub client_id: String,

  pub client_secret: String,

  /// Where the token blob is persisted.
  #[serde(default = "default_token_file")]
  pub token_file: PathBuf,

  #[serde(default = "default_base_url")]
  pub base_url: String,
}

fn default_socket_path() -> PathBuf {
  PathBuf::from("/tmp/mpvsocket")
}

fn default_pipe_path() -> PathBuf {
  PathBuf::from(r"\\.\pipe\mpvsocket")
}

fn default_token_file() -> PathBuf {
  app_dir()
    .map(|dir| dir.join("trakt_token.json"))
    .unwrap_or_else(|| PathBuf::from("trakt_token.json"))
}

fn default_base_url() -> String {
  "https://api.trakt.tv".to_string()
}

fn app_dir() -> Option<PathBuf> {
  dirs::config_dir().map(|dir| dir.join(APP_DIR))
}

/// Default location of the configuration file.
pub fn default_config_path() -> PathBuf {
  app_dir()
    .map(|dir| dir.join("config.json"))
    .unwrap_or_else(|| PathBuf::from("config.json"))
}

impl Default for MonitorConfig {
  fn default() -> Self {
    Self {
      socket_path: default_socket_path(),
      pipe_path: default_pipe_path(),
      pipe_connect_retries: None,
    }
  }
}

impl Config {
  /// Load and validate the configuration. A missing file yields the defaults.
  pub fn load(path: &Path) -> Result<Self, ConfigError> {
    if !path.exists() {
      log::info!("No config at {}, using defaults", path.display());
      return Ok(Self::default());
    }

    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
      path: path.display().to_string(),
      source,
    })?;
    let config: Config = serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
      path: path.display().to_string(),
      source,
    })?;
    config.validate()?;

    log::info!("Loaded config from {}", path.display());
    Ok(config)
  }

  /// Validate configuration values.
  pub fn validate(&self) -> Result<(), ConfigError> {
    if self.monitor.socket_path.as_os_str().is_empty() {
      return Err(ConfigError::Invalid("Socket path cannot be empty".to_string()));
    }
    if self.monitor.pipe_path.as_os_str().is_empty() {
      return Err(ConfigError::Invalid("Pipe path cannot be empty".to_string()));
    }
    if let Some(trakt) = &self.trakt {
      if trakt.client_id.trim().is_empty() {
        return Err(ConfigError::Invalid("trakt client id cannot be empty".to_string()));
      }
      if trakt.client_secret.trim().is_empty() {
        return Err(ConfigError::Invalid("trakt client secret cannot be empty".to_string()));
      }
      if !trakt.base_url.starts_with("http://") && !trakt.base_url.starts_with("https://") {
        return Err(ConfigError::Invalid(
          "trakt base URL must start with http:// or https://".to_string(),
        ));
      }
    }
    Ok(())
  }
}
