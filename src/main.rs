use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use mpv_trakt_sync::mpv::{observe_property, MpvCommand, MpvEvent, MpvResponse};
use mpv_trakt_sync::{default_config_path, Config, MonitorHandler, MpvMonitor, TraktAuth};

/// Observer id used for the `pause` property.
const PAUSE_OBSERVER: i64 = 1;

/// Logs what mpv is playing and whether it is paused.
struct PlaybackLogger;

#[async_trait]
impl MonitorHandler for PlaybackLogger {
  async fn on_connected(&self, monitor: &MpvMonitor) {
    for property in ["path", "pause"] {
      if let Err(e) = monitor.send_get_property_command(property).await {
        log::warn!("Failed to query {}: {}", property, e);
      }
    }
    if let Err(e) = monitor.send_command(observe_property(PAUSE_OBSERVER, "pause")).await {
      log::warn!("Failed to observe pause: {}", e);
    }
  }

  async fn on_event(&self, _monitor: &MpvMonitor, event: Value) {
    match MpvEvent::from_message(&event) {
      Some(e) if e.event == "property-change" => {
        log::info!("{} changed to {}", e.name.unwrap_or_default(), e.data.unwrap_or(Value::Null));
      }
      Some(e) => log::info!("mpv event: {}", e.event),
      None => log::info!("mpv event: {}", event),
    }
  }

  async fn on_command_response(&self, _monitor: &MpvMonitor, command: MpvCommand, response: Value) {
    match MpvResponse::from_message(&response) {
      Some(r) if r.is_success() => log::info!(
        "{:?} -> {}",
        command.command,
        r.data.unwrap_or(Value::Null)
      ),
      Some(r) => log::warn!("{:?} failed: {}", command.command, r.error),
      None => log::warn!("{:?} got unexpected response {}", command.command, response),
    }
  }

  async fn on_disconnected(&self) {
    log::info!("mpv went away");
  }
}

#[tokio::main]
async fn main() -> ExitCode {
  env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

  let config_path = std::env::var_os("MPV_TRAKT_SYNC_CONFIG")
    .map(PathBuf::from)
    .unwrap_or_else(default_config_path);
  let config = match Config::load(&config_path) {
    Ok(config) => config,
    Err(e) => {
      log::error!("{}", e);
      return ExitCode::FAILURE;
    }
  };

  if let Some(trakt) = &config.trakt {
    let token = match TraktAuth::new(trakt) {
      Ok(auth) => {
        auth
          .access_token(|code| {
            println!(
              "Please visit {} and enter code {} to grant this app permission to your trakt account.",
              code.verification_url, code.user_code
            )
          })
          .await
      }
      Err(e) => Err(e),
    };
    match token {
      Ok(_) => log::info!("trakt access token available"),
      Err(e) => {
        log::error!("Could not get a trakt access token: {}", e);
        return ExitCode::FAILURE;
      }
    }
  }

  let monitor = Arc::new(MpvMonitor::from_config(&config.monitor, Arc::new(PlaybackLogger)));
  if !monitor.probe().await {
    log::warn!("mpv IPC endpoint is not reachable yet, is mpv running with --input-ipc-server?");
  }

  let session = tokio::spawn({
    let monitor = monitor.clone();
    async move { monitor.run().await }
  });

  match session.await {
    Ok(Ok(())) => ExitCode::SUCCESS,
    Ok(Err(e)) => {
      log::error!("{}", e);
      ExitCode::FAILURE
    }
    Err(e) => {
      log::error!("mpv session task failed: {}", e);
      ExitCode::FAILURE
    }
  }
}
