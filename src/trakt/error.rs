//! trakt token errors.

use thiserror::Error;

/// Errors that can occur while obtaining a trakt access token.
#[derive(Debug, Error)]
pub enum TokenError {
  #[error("HTTP request failed: {0}")]
  Http(#[from] reqwest::Error),

  #[error("JSON serialization error: {0}")]
  Json(#[from] serde_json::Error),

  #[error("Token file {path}: {source}")]
  Io {
    path: String,
    #[source]
    source: std::io::Error,
  },

  #[error("Requesting a device code failed with HTTP {status}: {body}")]
  DeviceCode { status: u16, body: String },

  #[error("Refreshing the token failed with HTTP {status}: {body}")]
  Refresh { status: u16, body: String },

  #[error("Device authorization was not granted before the code expired")]
  AuthorizationTimedOut,
}
