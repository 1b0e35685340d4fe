//! Token blob persisted between runs.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::error::TokenError;

/// OAuth token as returned by trakt. Fields we don't use are kept verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredToken {
  pub access_token: String,
  pub refresh_token: String,
  /// Unix timestamp (seconds) of issue.
  pub created_at: u64,
  /// Lifetime in seconds.
  pub expires_in: u64,
  #[serde(flatten)]
  pub extra: Map<String, Value>,
}

impl StoredToken {
  /// Unix timestamp (seconds) at which the token stops being valid.
  pub fn expires_at(&self) -> u64 {
    self.created_at.saturating_add(self.expires_in)
  }

  /// True if the token is invalid at `now + window`.
  pub fn expires_within(&self, now: u64, window: Duration) -> bool {
    self.expires_at() < now.saturating_add(window.as_secs())
  }
}

/// Current time as a Unix timestamp in seconds.
pub(crate) fn unix_now() -> u64 {
  SystemTime::now()
    .duration_since(UNIX_EPOCH)
    .map(|d| d.as_secs())
    .unwrap_or(0)
}

/// JSON file holding one [`StoredToken`].
#[derive(Debug, Clone)]
pub struct TokenStore {
  path: PathBuf,
}

impl TokenStore {
  pub fn new(path: impl AsRef<Path>) -> Self {
    Self {
      path: path.as_ref().to_path_buf(),
    }
  }

  pub fn path(&self) -> &Path {
    &self.path
  }

  /// Read the stored token, `None` if nothing was saved yet.
  pub fn load(&self) -> Result<Option<StoredToken>, TokenError> {
    if !self.path.exists() {
      return Ok(None);
    }
    let text = std::fs::read_to_string(&self.path).map_err(|source| self.io_error(source))?;
    Ok(Some(serde_json::from_str(&text)?))
  }

  pub fn save(&self, token: &StoredToken) -> Result<(), TokenError> {
    if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
      std::fs::create_dir_all(parent).map_err(|source| self.io_error(source))?;
    }
    let text = serde_json::to_string(token)?;
    std::fs::write(&self.path, text).map_err(|source| self.io_error(source))?;
    log::debug!("Saved trakt token to {}", self.path.display());
    Ok(())
  }

  fn io_error(&self, source: std::io::Error) -> TokenError {
    TokenError::Io {
      path: self.path.display().to_string(),
      source,
    }
  }
}
