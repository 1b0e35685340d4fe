//! trakt OAuth device authorization and token refresh.

use std::time::{Duration, Instant};

use reqwest::Client;
use serde::Deserialize;

use super::error::TokenError;
use super::token::{unix_now, StoredToken, TokenStore};
use crate::config::TraktConfig;

/// Refresh tokens that would expire within this window.
const REFRESH_WINDOW: Duration = Duration::from_secs(24 * 60 * 60);
const REDIRECT_URI: &str = "urn:ietf:wg:oauth:2.0:oob";

/// Code the user enters at `verification_url` to grant access.
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceCode {
  pub device_code: String,
  pub user_code: String,
  pub verification_url: String,
  /// Seconds until the code expires.
  pub expires_in: u64,
  /// Seconds to wait between polls.
  pub interval: u64,
}

/// Obtains and refreshes trakt access tokens.
pub struct TraktAuth {
  http: Client,
  base_url: String,
  client_id: String,
  client_secret: String,
  store: TokenStore,
}

impl TraktAuth {
  pub fn new(config: &TraktConfig) -> Result<Self, TokenError> {
    Ok(Self {
      http: Client::builder().timeout(Duration::from_secs(30)).build()?,
      base_url: config.base_url.trim_end_matches('/').to_string(),
      client_id: config.client_id.clone(),
      client_secret: config.client_secret.clone(),
      store: TokenStore::new(&config.token_file),
    })
  }

  /// Return a bearer token valid for at least another day.
  ///
  /// Runs the device flow when no token is stored, handing the code to
  /// `on_code` for display, and refreshes a stored token close to expiry.
  pub async fn access_token<F>(&self, on_code: F) -> Result<String, TokenError>
  where
    F: FnOnce(&DeviceCode) + Send,
  {
    let token = match self.store.load()? {
      Some(token) => token,
      None => self.authorize_device(on_code).await?,
    };

    if token.expires_within(unix_now(), REFRESH_WINDOW) {
      log::info!("trakt token expires soon, refreshing");
      let token = self.refresh(&token).await?;
      return Ok(token.access_token);
    }
    Ok(token.access_token)
  }

  /// Run the device authorization grant and persist the resulting token.
  pub async fn authorize_device<F>(&self, on_code: F) -> Result<StoredToken, TokenError>
  where
    F: FnOnce(&DeviceCode) + Send,
  {
    let response = self
      .http
      .post(format!("{}/oauth/device/code", self.base_url))
      .json(&serde_json::json!({ "client_id": self.client_id }))
      .send()
      .await?;

    if !response.status().is_success() {
      let status = response.status().as_u16();
      let body = response.text().await.unwrap_or_default();
      log::error!("Generating a trakt device code failed with HTTP {}", status);
      return Err(TokenError::DeviceCode { status, body });
    }

    let code: DeviceCode = response.json().await?;
    on_code(&code);

    let deadline = Instant::now() + Duration::from_secs(code.expires_in);
    while Instant::now() < deadline {
      tokio::time::sleep(Duration::from_secs(code.interval)).await;

      let response = self
        .http
        .post(format!("{}/oauth/device/token", self.base_url))
        .json(&serde_json::json!({
          "code": code.device_code,
          "client_id": self.client_id,
          "client_secret": self.client_secret,
        }))
        .send()
        .await?;

      if response.status().is_success() {
        let token: StoredToken = response.json().await?;
        self.store.save(&token)?;
        log::info!(
          "Successfully established access to trakt account, token saved to {}",
          self.store.path().display()
        );
        return Ok(token);
      }
      log::debug!("trakt device token poll returned HTTP {}", response.status());
    }

    log::error!("Could not get a trakt access token before the device code expired");
    Err(TokenError::AuthorizationTimedOut)
  }

  /// Exchange the refresh token for a new token and persist it.
  pub async fn refresh(&self, token: &StoredToken) -> Result<StoredToken, TokenError> {
    let response = self
      .http
      .post(format!("{}/oauth/token", self.base_url))
      .json(&serde_json::json!({
        "refresh_token": token.refresh_token,
        "client_id": self.client_id,
        "client_secret": self.client_secret,
        "redirect_uri": REDIRECT_URI,
        "grant_type": "refresh_token",
      }))
      .send()
      .await?;

    if !response.status().is_success() {
      let status = response.status().as_u16();
      let body = response.text().await.unwrap_or_default();
      return Err(TokenError::Refresh { status, body });
    }

    let refreshed: StoredToken = response.json().await?;
    self.store.save(&refreshed)?;
    log::info!("Successfully refreshed trakt token");
    Ok(refreshed)
  }
}
