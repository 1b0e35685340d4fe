//! mpv JSON IPC protocol types.
//!
//! Reference: https://mpv.io/manual/master/#json-ipc

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Command sent to mpv via IPC.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MpvCommand {
  pub command: Vec<Value>,
  pub request_id: i64,
}

impl MpvCommand {
  pub fn new(request_id: i64, command: Vec<Value>) -> Self {
    Self {
      command,
      request_id,
    }
  }

  /// Serialize as one wire line, newline included.
  pub fn to_line(&self) -> Result<Vec<u8>, serde_json::Error> {
    let mut line = serde_json::to_vec(self)?;
    line.push(b'\n');
    Ok(line)
  }
}

/// Elements of a `get_property` command.
pub fn get_property(name: &str) -> Vec<Value> {
  vec!["get_property".into(), name.into()]
}

/// Elements of a `set_property` command.
pub fn set_property(name: &str, value: impl Into<Value>) -> Vec<Value> {
  vec!["set_property".into(), name.into(), value.into()]
}

/// Elements of an `observe_property` command.
/// Changes arrive as `property-change` events carrying `observer_id`.
pub fn observe_property(observer_id: i64, name: &str) -> Vec<Value> {
  vec!["observe_property".into(), observer_id.into(), name.into()]
}

/// Typed view of a command response.
#[derive(Debug, Clone, Deserialize)]
pub struct MpvResponse {
  /// "success" or error message.
  #[serde(default)]
  pub error: String,
  /// Response data (command-specific).
  pub data: Option<Value>,
  /// Matching request ID.
  pub request_id: i64,
}

impl MpvResponse {
  pub fn from_message(message: &Value) -> Option<Self> {
    serde_json::from_value(message.clone()).ok()
  }

  /// Check if the command succeeded.
  pub fn is_success(&self) -> bool {
    self.error == "success"
  }
}

/// Typed view of an event (property changes, playback events, etc.).
#[derive(Debug, Clone, Deserialize)]
pub struct MpvEvent {
  /// Event type (e.g., "property-change", "end-file", "client-message").
  pub event: String,
  /// Observer ID for property-change events.
  pub id: Option<i64>,
  /// Property name for property-change events.
  pub name: Option<String>,
  pub data: Option<Value>,
  /// Reason for end-file events (e.g., "eof", "stop", "quit", "error").
  pub reason: Option<String>,
}

impl MpvEvent {
  pub fn from_message(message: &Value) -> Option<Self> {
    serde_json::from_value(message.clone()).ok()
  }
}

/// Why a line could not be dispatched.
#[derive(Error, Debug)]
pub enum MalformedReason {
  #[error("invalid JSON: {0}")]
  InvalidJson(#[from] serde_json::Error),
  #[error("neither an event nor a command response")]
  UnknownShape,
  #[error("request_id is not an integer: {0}")]
  InvalidRequestId(Value),
}

/// One line received from mpv, classified.
#[derive(Debug)]
pub enum IncomingMessage {
  Event(Value),
  Response { request_id: i64, message: Value },
  Malformed(MalformedReason),
}

impl IncomingMessage {
  /// Classify a line. Every line gets exactly one outcome.
  pub fn classify(line: &str) -> Self {
    let message: Value = match serde_json::from_str(line) {
      Ok(message) => message,
      Err(e) => return IncomingMessage::Malformed(e.into()),
    };

    if message.get("event").is_some() {
      return IncomingMessage::Event(message);
    }

    match message.get("request_id") {
      Some(id) => match id.as_i64() {
        Some(request_id) => IncomingMessage::Response {
          request_id,
          message,
        },
        None => IncomingMessage::Malformed(MalformedReason::InvalidRequestId(id.clone())),
      },
      None => IncomingMessage::Malformed(MalformedReason::UnknownShape),
    }
  }
}
