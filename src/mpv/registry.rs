//! Outstanding commands awaiting a response, keyed by request id.

use std::collections::HashMap;

use parking_lot::Mutex;
use serde_json::Value;

use super::protocol::MpvCommand;

struct RegistryState {
  next_id: i64,
  pending: HashMap<i64, MpvCommand>,
}

/// Id counter and pending-command map behind one lock.
///
/// Each monitor owns its own registry, so id spaces are never shared.
pub struct CommandRegistry {
  state: Mutex<RegistryState>,
}

impl CommandRegistry {
  pub fn new() -> Self {
    Self {
      state: Mutex::new(RegistryState {
        next_id: 1,
        pending: HashMap::new(),
      }),
    }
  }

  /// Allocate the next id and track the command under it.
  pub fn register(&self, elements: Vec<Value>) -> MpvCommand {
    let mut state = self.state.lock();
    let command = MpvCommand::new(state.next_id, elements);
    state.next_id += 1;
    state.pending.insert(command.request_id, command.clone());
    command
  }

  /// Remove and return the command registered under `request_id`.
  pub fn resolve(&self, request_id: i64) -> Option<MpvCommand> {
    self.state.lock().pending.remove(&request_id)
  }

  pub fn len(&self) -> usize {
    self.state.lock().pending.len()
  }

  pub fn is_empty(&self) -> bool {
    self.state.lock().pending.is_empty()
  }

  /// Drop every pending command without resolving it. The counter keeps going.
  pub fn discard_all(&self) -> usize {
    let mut state = self.state.lock();
    let discarded = state.pending.len();
    state.pending.clear();
    discarded
  }
}

impl Default for CommandRegistry {
  fn default() -> Self {
    Self::new()
  }
}
