//! Session driver for one mpv IPC connection.
//!
//! `run()` connects, reads and dispatches lines until the stream ends.
//! `send_command()` may be called concurrently from other tasks while a
//! session is live.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use thiserror::Error;

use super::framer::LineFramer;
use super::protocol::{get_property, IncomingMessage, MpvCommand};
use super::registry::CommandRegistry;
use super::transport::{platform_transport, ConnectionReader, ConnectionWriter, Transport, TransportError};
use crate::config::MonitorConfig;

const READ_CHUNK_SIZE: usize = 512;

#[derive(Error, Debug)]
pub enum MonitorError {
  #[error("Connect failed: {0}")]
  Connect(#[source] TransportError),
  #[error("Transport error: {0}")]
  Transport(#[from] TransportError),
  #[error("Failed to encode command: {0}")]
  Encode(#[from] serde_json::Error),
  #[error("Not connected")]
  NotConnected,
  #[error("Monitor is already running")]
  AlreadyRunning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorState {
  Idle,
  Connecting,
  Connected,
  Closed,
}

/// Callbacks invoked by the monitor. All of them default to doing nothing.
///
/// Callbacks run one at a time on the task executing [`MpvMonitor::run`].
#[async_trait]
pub trait MonitorHandler: Send + Sync {
  async fn on_connected(&self, _monitor: &MpvMonitor) {}

  async fn on_event(&self, _monitor: &MpvMonitor, _event: Value) {}

  async fn on_command_response(&self, _monitor: &MpvMonitor, _command: MpvCommand, _response: Value) {}

  async fn on_disconnected(&self) {}
}

/// Handler that ignores everything.
pub struct NoopHandler;

impl MonitorHandler for NoopHandler {}

/// Resets the monitor when a `run()` ends, however it ends.
struct SessionTeardown<'a> {
  monitor: &'a MpvMonitor,
}

impl Drop for SessionTeardown<'_> {
  fn drop(&mut self) {
    {
      let mut state = self.monitor.state.lock();
      *state = match *state {
        MonitorState::Connecting => MonitorState::Idle,
        _ => MonitorState::Closed,
      };
    }
    self.monitor.writer.lock().take();

    let discarded = self.monitor.registry.discard_all();
    if discarded > 0 {
      log::info!("Discarded {} unanswered mpv commands", discarded);
    }
  }
}

/// mpv IPC monitor.
pub struct MpvMonitor {
  transport: Box<dyn Transport>,
  handler: Arc<dyn MonitorHandler>,
  registry: CommandRegistry,
  state: Mutex<MonitorState>,
  writer: Mutex<Option<Arc<ConnectionWriter>>>,
}

impl MpvMonitor {
  pub fn new(transport: Box<dyn Transport>, handler: Arc<dyn MonitorHandler>) -> Self {
    Self {
      transport,
      handler,
      registry: CommandRegistry::new(),
      state: Mutex::new(MonitorState::Idle),
      writer: Mutex::new(None),
    }
  }

  /// Create a monitor using this platform's transport.
  pub fn from_config(config: &MonitorConfig, handler: Arc<dyn MonitorHandler>) -> Self {
    Self::new(platform_transport(config), handler)
  }

  pub fn state(&self) -> MonitorState {
    *self.state.lock()
  }

  /// Number of commands still waiting for a response.
  pub fn pending_commands(&self) -> usize {
    self.registry.len()
  }

  /// Check whether mpv's IPC endpoint is reachable.
  pub async fn probe(&self) -> bool {
    self.transport.probe().await
  }

  /// Connect and process messages until mpv closes the connection.
  ///
  /// Returns `Ok(())` once the session has ended, whether by end of stream or
  /// by a read error. Only a failed connect is reported as an error.
  ///
  /// Dropping the future mid-session (timeout, abort) still tears the session
  /// down: the monitor ends up `Closed`, the connection is released and pending
  /// commands are discarded. `on_disconnected` only fires when `run()` itself
  /// completes.
  pub async fn run(&self) -> Result<(), MonitorError> {
    {
      let mut state = self.state.lock();
      match *state {
        MonitorState::Idle | MonitorState::Closed => *state = MonitorState::Connecting,
        MonitorState::Connecting | MonitorState::Connected => {
          return Err(MonitorError::AlreadyRunning)
        }
      }
    }
    let session = SessionTeardown { monitor: self };

    let endpoint = self.transport.endpoint().display().to_string();
    log::info!("Connecting to mpv at {}", endpoint);
    let connection = match self.transport.connect().await {
      Ok(connection) => connection,
      Err(e) => {
        log::error!("Failed to connect to mpv at {}: {}", endpoint, e);
        return Err(MonitorError::Connect(e));
      }
    };

    let (mut reader, writer) = connection.into_parts();
    *self.writer.lock() = Some(writer.clone());
    *self.state.lock() = MonitorState::Connected;
    log::info!("mpv IPC connected");
    self.handler.on_connected(self).await;

    self.read_loop(&mut reader).await;

    drop(session);
    writer.close().await;
    drop(reader);
    log::info!("mpv IPC closed");
    self.handler.on_disconnected().await;
    Ok(())
  }

  async fn read_loop(&self, reader: &mut ConnectionReader) {
    let mut framer = LineFramer::new();
    let mut chunk = [0u8; READ_CHUNK_SIZE];

    loop {
      let n = match reader.read_chunk(&mut chunk).await {
        Ok(0) => break,
        Ok(n) => n,
        Err(e) => {
          log::error!("mpv IPC read error: {}", e);
          break;
        }
      };

      for line in framer.push(&chunk[..n]) {
        self.dispatch(&line).await;
      }
      if framer.pending() > 0 {
        log::debug!("Buffered partial line ({} bytes)", framer.pending());
      }
    }

    let dropped = framer.finish();
    if dropped > 0 {
      log::warn!("Dropping {} bytes of unterminated mpv output", dropped);
    }
  }

  async fn dispatch(&self, line: &str) {
    match IncomingMessage::classify(line) {
      IncomingMessage::Event(event) => {
        log::debug!("mpv event: {}", line);
        self.handler.on_event(self, event).await;
      }
      IncomingMessage::Response {
        request_id,
        message,
      } => match self.registry.resolve(request_id) {
        Some(command) => {
          log::debug!("mpv response for request_id={}", request_id);
          self.handler.on_command_response(self, command, message).await;
        }
        None => log::warn!("Got response for unsent command request: {}", line),
      },
      IncomingMessage::Malformed(reason) => {
        log::warn!("Skipping mpv output ({}): {}", reason, line);
      }
    }
  }

  /// Send a command to mpv. Returns the request id it was registered under.
  ///
  /// The response, if any, is delivered to
  /// [`MonitorHandler::on_command_response`]. A write error means the session
  /// is ending; the command then stays registered until the session closes.
  pub async fn send_command(&self, elements: Vec<Value>) -> Result<i64, MonitorError> {
    let writer = self.writer.lock().clone().ok_or(MonitorError::NotConnected)?;

    // Holding the write lock while allocating keeps ids in wire order.
    let mut sink = writer.lock().await;
    let command = self.registry.register(elements);
    let line = match command.to_line() {
      Ok(line) => line,
      Err(e) => {
        self.registry.resolve(command.request_id);
        return Err(e.into());
      }
    };

    log::debug!("Sending mpv command: {}", String::from_utf8_lossy(&line).trim_end());
    if let Err(e) = sink.write(&line).await {
      log::warn!(
        "Failed to send mpv command request_id={}: {}",
        command.request_id,
        e
      );
      return Err(e.into());
    }
    Ok(command.request_id)
  }

  /// Request a property value.
  pub async fn send_get_property_command(&self, name: &str) -> Result<i64, MonitorError> {
    self.send_command(get_property(name)).await
  }

  /// Shut down the write side of the live connection.
  ///
  /// mpv drops the client in response, which ends the running session.
  pub async fn close(&self) {
    let writer = self.writer.lock().clone();
    match writer {
      Some(writer) => writer.close().await,
      None => log::debug!("close() called without a live mpv connection"),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::io;
  use std::path::{Path, PathBuf};
  use std::pin::Pin;
  use std::task::{Context, Poll};
  use std::time::Duration;

  use serde_json::json;
  use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader, DuplexStream, ReadBuf};
  use tokio::sync::Notify;

  use crate::mpv::transport::{Connection, WriteGuard};

  struct MemoryTransport {
    endpoint: PathBuf,
    connection: Mutex<Option<Connection>>,
  }

  impl MemoryTransport {
    fn new(stream: Option<DuplexStream>) -> Self {
      Self::with_connection(stream.map(|stream| Connection::from_stream(stream, WriteGuard::Optimistic)))
    }

    fn with_connection(connection: Option<Connection>) -> Self {
      Self {
        endpoint: PathBuf::from("memory"),
        connection: Mutex::new(connection),
      }
    }
  }

  #[async_trait]
  impl Transport for MemoryTransport {
    fn endpoint(&self) -> &Path {
      &self.endpoint
    }

    async fn probe(&self) -> bool {
      self.connection.lock().is_some()
    }

    async fn connect(&self) -> Result<Connection, TransportError> {
      let connection = self.connection.lock().take();
      connection.ok_or_else(|| TransportError::Connect {
        endpoint: "memory".to_string(),
        source: io::Error::new(io::ErrorKind::NotFound, "no stream"),
      })
    }
  }

  /// Yields one chunk, then fails like a reset socket.
  struct ResetAfter {
    chunk: Option<&'static [u8]>,
  }

  impl AsyncRead for ResetAfter {
    fn poll_read(
      mut self: Pin<&mut Self>,
      _cx: &mut Context<'_>,
      buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
      match self.chunk.take() {
        Some(chunk) => {
          buf.put_slice(chunk);
          Poll::Ready(Ok(()))
        }
        None => Poll::Ready(Err(io::ErrorKind::ConnectionReset.into())),
      }
    }
  }

  #[derive(Debug, Clone, PartialEq)]
  enum Call {
    Connected,
    Event(Value),
    Response(Vec<Value>, Value),
    Disconnected,
  }

  #[derive(Default)]
  struct Recorder {
    calls: Mutex<Vec<Call>>,
    connected: Notify,
  }

  impl Recorder {
    fn calls(&self) -> Vec<Call> {
      self.calls.lock().clone()
    }
  }

  #[async_trait]
  impl MonitorHandler for Recorder {
    async fn on_connected(&self, _monitor: &MpvMonitor) {
      self.calls.lock().push(Call::Connected);
      self.connected.notify_one();
    }

    async fn on_event(&self, _monitor: &MpvMonitor, event: Value) {
      self.calls.lock().push(Call::Event(event));
    }

    async fn on_command_response(&self, _monitor: &MpvMonitor, command: MpvCommand, response: Value) {
      self.calls.lock().push(Call::Response(command.command, response));
    }

    async fn on_disconnected(&self) {
      self.calls.lock().push(Call::Disconnected);
    }
  }

  fn monitor_with(stream: DuplexStream) -> (Arc<MpvMonitor>, Arc<Recorder>) {
    let recorder = Arc::new(Recorder::default());
    let monitor = MpvMonitor::new(Box::new(MemoryTransport::new(Some(stream))), recorder.clone());
    (Arc::new(monitor), recorder)
  }

  fn spawn_run(monitor: &Arc<MpvMonitor>) -> tokio::task::JoinHandle<Result<(), MonitorError>> {
    let monitor = monitor.clone();
    tokio::spawn(async move { monitor.run().await })
  }

  #[tokio::test]
  async fn test_session_dispatches_event_and_response() {
    let (client, server) = tokio::io::duplex(4096);
    let (monitor, recorder) = monitor_with(client);
    let (server_read, mut server_write) = tokio::io::split(server);
    let mut server_lines = BufReader::new(server_read).lines();

    let session = spawn_run(&monitor);
    recorder.connected.notified().await;
    assert_eq!(monitor.state(), MonitorState::Connected);

    let id = monitor.send_get_property_command("pause").await.unwrap();
    assert_eq!(id, 1);
    let sent = server_lines.next_line().await.unwrap().unwrap();
    assert_eq!(
      serde_json::from_str::<Value>(&sent).unwrap(),
      json!({"command": ["get_property", "pause"], "request_id": 1})
    );

    server_write
      .write_all(b"{\"event\":\"pause\"}\n{\"request_id\":1,\"data\":42}\n")
      .await
      .unwrap();
    server_write.shutdown().await.unwrap();

    session.await.unwrap().unwrap();
    assert_eq!(
      recorder.calls(),
      vec![
        Call::Connected,
        Call::Event(json!({"event": "pause"})),
        Call::Response(
          vec![json!("get_property"), json!("pause")],
          json!({"request_id": 1, "data": 42})
        ),
        Call::Disconnected,
      ]
    );
    assert_eq!(monitor.state(), MonitorState::Closed);
  }

  #[tokio::test]
  async fn test_malformed_and_unsolicited_lines_are_skipped() {
    let (client, mut server) = tokio::io::duplex(4096);
    let (monitor, recorder) = monitor_with(client);

    server
      .write_all(b"not json\n{\"foo\":1}\n{\"request_id\":99,\"error\":\"success\"}\n{\"request_id\":\"x\"}\n{\"event\":\"idle\"}\n")
      .await
      .unwrap();
    server.shutdown().await.unwrap();

    monitor.run().await.unwrap();
    assert_eq!(
      recorder.calls(),
      vec![
        Call::Connected,
        Call::Event(json!({"event": "idle"})),
        Call::Disconnected,
      ]
    );
  }

  #[tokio::test]
  async fn test_duplicate_response_is_unsolicited() {
    let (client, server) = tokio::io::duplex(4096);
    let (monitor, recorder) = monitor_with(client);
    let (server_read, mut server_write) = tokio::io::split(server);
    let mut server_lines = BufReader::new(server_read).lines();

    let session = spawn_run(&monitor);
    recorder.connected.notified().await;
    monitor.send_command(vec![json!("get_property"), json!("volume")]).await.unwrap();
    server_lines.next_line().await.unwrap().unwrap();

    server_write
      .write_all(b"{\"request_id\":1,\"data\":50}\n{\"request_id\":1,\"data\":60}\n")
      .await
      .unwrap();
    server_write.shutdown().await.unwrap();
    session.await.unwrap().unwrap();

    let responses = recorder
      .calls()
      .into_iter()
      .filter(|call| matches!(call, Call::Response(..)))
      .count();
    assert_eq!(responses, 1);
  }

  #[tokio::test]
  async fn test_unterminated_tail_is_dropped() {
    let (client, mut server) = tokio::io::duplex(4096);
    let (monitor, recorder) = monitor_with(client);

    server.write_all(b"{\"event\":\"idle\"}\n{\"event\":\"seek\"}").await.unwrap();
    server.shutdown().await.unwrap();

    monitor.run().await.unwrap();
    assert_eq!(
      recorder.calls(),
      vec![
        Call::Connected,
        Call::Event(json!({"event": "idle"})),
        Call::Disconnected,
      ]
    );
  }

  #[tokio::test]
  async fn test_connect_failure_fires_no_callbacks() {
    let recorder = Arc::new(Recorder::default());
    let monitor = MpvMonitor::new(Box::new(MemoryTransport::new(None)), recorder.clone());

    assert!(!monitor.probe().await);
    assert!(matches!(monitor.run().await, Err(MonitorError::Connect(_))));
    assert!(recorder.calls().is_empty());
    assert_eq!(monitor.state(), MonitorState::Idle);
  }

  #[tokio::test]
  async fn test_send_without_connection() {
    let monitor = MpvMonitor::new(Box::new(MemoryTransport::new(None)), Arc::new(NoopHandler));
    assert!(matches!(
      monitor.send_get_property_command("pause").await,
      Err(MonitorError::NotConnected)
    ));
    assert_eq!(monitor.pending_commands(), 0);
  }

  #[tokio::test]
  async fn test_second_run_while_connected_is_rejected() {
    let (client, mut server) = tokio::io::duplex(4096);
    let (monitor, recorder) = monitor_with(client);

    let session = spawn_run(&monitor);
    recorder.connected.notified().await;
    assert!(matches!(monitor.run().await, Err(MonitorError::AlreadyRunning)));

    server.shutdown().await.unwrap();
    session.await.unwrap().unwrap();
    assert_eq!(
      recorder.calls(),
      vec![Call::Connected, Call::Disconnected]
    );
  }

  #[tokio::test]
  async fn test_session_end_discards_pending_commands() {
    let (client, server) = tokio::io::duplex(4096);
    let (monitor, recorder) = monitor_with(client);
    let (server_read, mut server_write) = tokio::io::split(server);
    let mut server_lines = BufReader::new(server_read).lines();

    let session = spawn_run(&monitor);
    recorder.connected.notified().await;
    monitor.send_get_property_command("path").await.unwrap();
    server_lines.next_line().await.unwrap().unwrap();
    assert_eq!(monitor.pending_commands(), 1);

    server_write.shutdown().await.unwrap();
    session.await.unwrap().unwrap();
    assert_eq!(monitor.pending_commands(), 0);
    assert!(matches!(
      monitor.send_get_property_command("path").await,
      Err(MonitorError::NotConnected)
    ));
  }

  #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
  async fn test_concurrent_senders_reach_wire_in_id_order() {
    let (client, server) = tokio::io::duplex(64 * 1024);
    let (monitor, recorder) = monitor_with(client);
    let (server_read, mut server_write) = tokio::io::split(server);
    let mut server_lines = BufReader::new(server_read).lines();

    let session = spawn_run(&monitor);
    recorder.connected.notified().await;

    let senders: Vec<_> = (0..8)
      .map(|task| {
        let monitor = monitor.clone();
        tokio::spawn(async move {
          let mut ids = Vec::new();
          for i in 0..25 {
            let name = format!("prop-{}-{}", task, i);
            ids.push(monitor.send_get_property_command(&name).await.unwrap());
          }
          ids
        })
      })
      .collect();

    let mut wire_ids = Vec::new();
    for _ in 0..200 {
      let line = server_lines.next_line().await.unwrap().unwrap();
      let message: Value = serde_json::from_str(&line).unwrap();
      wire_ids.push(message["request_id"].as_i64().unwrap());
    }
    for sender in senders {
      let ids = sender.await.unwrap();
      assert!(ids.windows(2).all(|w| w[0] < w[1]));
    }
    assert_eq!(wire_ids, (1..=200).collect::<Vec<i64>>());

    server_write.shutdown().await.unwrap();
    session.await.unwrap().unwrap();
  }

  struct QueryOnConnect;

  #[async_trait]
  impl MonitorHandler for QueryOnConnect {
    async fn on_connected(&self, monitor: &MpvMonitor) {
      monitor.send_get_property_command("path").await.unwrap();
    }
  }

  #[tokio::test]
  async fn test_handler_can_send_from_callback() {
    let (client, server) = tokio::io::duplex(4096);
    let monitor = Arc::new(MpvMonitor::new(
      Box::new(MemoryTransport::new(Some(client))),
      Arc::new(QueryOnConnect),
    ));
    let (server_read, mut server_write) = tokio::io::split(server);
    let mut server_lines = BufReader::new(server_read).lines();

    let session = spawn_run(&monitor);
    let sent = server_lines.next_line().await.unwrap().unwrap();
    assert_eq!(
      serde_json::from_str::<Value>(&sent).unwrap(),
      json!({"command": ["get_property", "path"], "request_id": 1})
    );

    server_write.shutdown().await.unwrap();
    session.await.unwrap().unwrap();
  }

  #[tokio::test]
  async fn test_close_ends_session_when_peer_hangs_up() {
    let (client, server) = tokio::io::duplex(4096);
    let (monitor, recorder) = monitor_with(client);
    let (server_read, mut server_write) = tokio::io::split(server);

    let session = spawn_run(&monitor);
    recorder.connected.notified().await;
    monitor.close().await;

    // Peer sees EOF on its read side and hangs up in turn.
    let mut lines = BufReader::new(server_read).lines();
    assert!(lines.next_line().await.unwrap().is_none());
    server_write.shutdown().await.unwrap();

    session.await.unwrap().unwrap();
    assert_eq!(recorder.calls().last(), Some(&Call::Disconnected));
  }

  #[tokio::test]
  async fn test_read_error_ends_session() {
    let connection = Connection::from_parts(
      ResetAfter {
        chunk: Some(&b"{\"event\":\"idle\"}\n"[..]),
      },
      tokio::io::sink(),
      WriteGuard::Optimistic,
    );
    let recorder = Arc::new(Recorder::default());
    let monitor = MpvMonitor::new(
      Box::new(MemoryTransport::with_connection(Some(connection))),
      recorder.clone(),
    );

    monitor.run().await.unwrap();
    assert_eq!(
      recorder.calls(),
      vec![
        Call::Connected,
        Call::Event(json!({"event": "idle"})),
        Call::Disconnected,
      ]
    );
    assert_eq!(monitor.state(), MonitorState::Closed);
  }

  #[tokio::test]
  async fn test_failed_write_leaves_command_registered() {
    let (client, mut server) = tokio::io::duplex(4096);
    let (monitor, recorder) = monitor_with(client);

    let session = spawn_run(&monitor);
    recorder.connected.notified().await;
    monitor.close().await;

    assert!(matches!(
      monitor.send_get_property_command("pause").await,
      Err(MonitorError::Transport(_))
    ));
    assert_eq!(monitor.pending_commands(), 1);

    server.shutdown().await.unwrap();
    session.await.unwrap().unwrap();
    assert_eq!(monitor.pending_commands(), 0);
  }

  #[tokio::test]
  async fn test_cancelled_run_tears_session_down() {
    let (client, _server) = tokio::io::duplex(4096);
    let (monitor, recorder) = monitor_with(client);

    let session = spawn_run(&monitor);
    recorder.connected.notified().await;
    monitor.send_get_property_command("pause").await.unwrap();
    assert_eq!(monitor.pending_commands(), 1);

    session.abort();
    assert!(session.await.unwrap_err().is_cancelled());

    assert_eq!(monitor.state(), MonitorState::Closed);
    assert_eq!(monitor.pending_commands(), 0);
    assert!(matches!(
      monitor.send_get_property_command("pause").await,
      Err(MonitorError::NotConnected)
    ));
    // The memory transport only hands out one connection.
    assert!(matches!(monitor.run().await, Err(MonitorError::Connect(_))));
    assert_eq!(recorder.calls(), vec![Call::Connected]);
  }

  #[tokio::test]
  async fn test_run_dropped_by_timeout_can_run_again() {
    let (client, _server) = tokio::io::duplex(4096);
    let (monitor, _recorder) = monitor_with(client);

    let timed_out = tokio::time::timeout(Duration::from_millis(50), monitor.run()).await;
    assert!(timed_out.is_err());
    assert_eq!(monitor.state(), MonitorState::Closed);
    assert!(!matches!(monitor.run().await, Err(MonitorError::AlreadyRunning)));
  }
}
