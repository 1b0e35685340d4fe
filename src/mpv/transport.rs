//! Byte-stream transports to the mpv IPC server.
//!
//! Unix domain sockets on Linux/macOS, named pipes on Windows. The variant is
//! picked once, when the monitor is built, by [`platform_transport`].

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{Mutex, MutexGuard};

use crate::config::MonitorConfig;

#[derive(Error, Debug)]
pub enum TransportError {
  #[error("Connection to {endpoint} failed: {source}")]
  Connect {
    endpoint: String,
    #[source]
    source: std::io::Error,
  },
  #[error("Read failed: {0}")]
  Read(#[source] std::io::Error),
  #[error("Write failed: {0}")]
  Write(#[source] std::io::Error),
  #[error("Connection closed")]
  Closed,
}

/// How a connection treats writes after it was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteGuard {
  /// Always attempt the write and let the OS report a dead connection.
  /// Sockets have no reliable "is closed" primitive.
  Optimistic,
  /// Refuse writes once the connection is known to be closed.
  CheckClosed,
}

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// A capability to reach the mpv IPC server.
#[async_trait]
pub trait Transport: Send + Sync {
  /// Socket or pipe path this transport connects to.
  fn endpoint(&self) -> &Path;

  /// Check reachability without keeping a connection. Never fails, never hangs.
  async fn probe(&self) -> bool;

  /// Open a connection.
  async fn connect(&self) -> Result<Connection, TransportError>;
}

/// One live connection, split into independently usable directions.
pub struct Connection {
  reader: ConnectionReader,
  writer: Arc<ConnectionWriter>,
}

impl Connection {
  /// Build a connection from a bidirectional stream.
  pub fn from_stream<S>(stream: S, guard: WriteGuard) -> Self
  where
    S: AsyncRead + AsyncWrite + Send + 'static,
  {
    let (reader, writer) = tokio::io::split(stream);
    Self::from_parts(reader, writer, guard)
  }

  /// Build a connection from already split halves.
  pub fn from_parts<R, W>(reader: R, writer: W, guard: WriteGuard) -> Self
  where
    R: AsyncRead + Send + Unpin + 'static,
    W: AsyncWrite + Send + Unpin + 'static,
  {
    Self {
      reader: ConnectionReader {
        inner: Box::new(reader),
      },
      writer: Arc::new(ConnectionWriter {
        sink: Mutex::new(Box::new(writer)),
        guard,
        closed: AtomicBool::new(false),
      }),
    }
  }

  pub fn into_parts(self) -> (ConnectionReader, Arc<ConnectionWriter>) {
    (self.reader, self.writer)
  }
}

/// Read direction of a connection. Owned by the read loop.
pub struct ConnectionReader {
  inner: BoxedReader,
}

impl ConnectionReader {
  /// Read up to `buf.len()` bytes. `Ok(0)` means the peer closed the stream.
  pub async fn read_chunk(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
    self.inner.read(buf).await.map_err(TransportError::Read)
  }
}

/// Write direction of a connection, shareable between tasks.
pub struct ConnectionWriter {
  sink: Mutex<BoxedWriter>,
  guard: WriteGuard,
  closed: AtomicBool,
}

impl ConnectionWriter {
  /// Take exclusive use of the write direction.
  ///
  /// Everything written through one lock reaches the peer contiguously.
  pub async fn lock(&self) -> WriterLock<'_> {
    WriterLock {
      writer: self,
      sink: self.sink.lock().await,
    }
  }

  pub async fn write(&self, data: &[u8]) -> Result<(), TransportError> {
    self.lock().await.write(data).await
  }

  pub fn is_closed(&self) -> bool {
    self.closed.load(Ordering::SeqCst)
  }

  /// Shut the write direction down. Later calls do nothing.
  pub async fn close(&self) {
    if self.closed.swap(true, Ordering::SeqCst) {
      return;
    }
    let mut sink = self.sink.lock().await;
    if let Err(e) = sink.shutdown().await {
      log::debug!("Shutdown of mpv IPC write side failed: {}", e);
    }
  }
}

pub struct WriterLock<'a> {
  writer: &'a ConnectionWriter,
  sink: MutexGuard<'a, BoxedWriter>,
}

impl WriterLock<'_> {
  pub async fn write(&mut self, data: &[u8]) -> Result<(), TransportError> {
    if self.writer.guard == WriteGuard::CheckClosed && self.writer.is_closed() {
      log::warn!(
        "mpv IPC connection was closed, can't send: {}",
        String::from_utf8_lossy(data).trim_end()
      );
      return Err(TransportError::Closed);
    }
    self.sink.write_all(data).await.map_err(TransportError::Write)?;
    self.sink.flush().await.map_err(TransportError::Write)
  }
}

/// Counts connect retries against an optional limit.
#[cfg_attr(not(windows), allow(dead_code))]
#[derive(Debug, Clone, Copy)]
struct RetryBudget {
  remaining: Option<u32>,
}

#[cfg_attr(not(windows), allow(dead_code))]
impl RetryBudget {
  fn new(max_retries: Option<u32>) -> Self {
    Self {
      remaining: max_retries,
    }
  }

  /// Spend one retry. Unlimited budgets never run out.
  fn take(&mut self) -> bool {
    match self.remaining.as_mut() {
      None => true,
      Some(0) => false,
      Some(remaining) => {
        *remaining -= 1;
        true
      }
    }
  }
}

/// Select the transport for this platform.
pub fn platform_transport(config: &MonitorConfig) -> Box<dyn Transport> {
  #[cfg(windows)]
  {
    Box::new(NamedPipeTransport::new(
      &config.pipe_path,
      config.pipe_connect_retries,
    ))
  }
  #[cfg(not(windows))]
  {
    Box::new(UnixSocketTransport::new(&config.socket_path))
  }
}

#[cfg(not(windows))]
pub use unix::UnixSocketTransport;

#[cfg(not(windows))]
mod unix {
  use std::path::{Path, PathBuf};
  use std::time::Duration;

  use async_trait::async_trait;
  use tokio::net::UnixStream;

  use super::{Connection, Transport, TransportError, WriteGuard};

  const PROBE_TIMEOUT: Duration = Duration::from_secs(1);

  /// Stream socket connection to mpv's `--input-ipc-server`.
  pub struct UnixSocketTransport {
    path: PathBuf,
  }

  impl UnixSocketTransport {
    pub fn new(path: impl AsRef<Path>) -> Self {
      Self {
        path: path.as_ref().to_path_buf(),
      }
    }
  }

  #[async_trait]
  impl Transport for UnixSocketTransport {
    fn endpoint(&self) -> &Path {
      &self.path
    }

    async fn probe(&self) -> bool {
      match tokio::time::timeout(PROBE_TIMEOUT, UnixStream::connect(&self.path)).await {
        Ok(Ok(_stream)) => true,
        Ok(Err(e)) => {
          log::debug!("Probe of {} failed: {}", self.path.display(), e);
          false
        }
        Err(_) => {
          log::debug!("Probe of {} timed out", self.path.display());
          false
        }
      }
    }

    async fn connect(&self) -> Result<Connection, TransportError> {
      let stream = UnixStream::connect(&self.path)
        .await
        .map_err(|source| TransportError::Connect {
          endpoint: self.path.display().to_string(),
          source,
        })?;

      let (reader, writer) = stream.into_split();
      Ok(Connection::from_parts(reader, writer, WriteGuard::Optimistic))
    }
  }
}

#[cfg(windows)]
pub use pipe::NamedPipeTransport;

#[cfg(windows)]
mod pipe {
  use std::path::{Path, PathBuf};
  use std::time::Duration;

  use async_trait::async_trait;
  use tokio::net::windows::named_pipe::ClientOptions;

  use super::{Connection, RetryBudget, Transport, TransportError, WriteGuard};

  /// Windows sometimes rejects the first open of a pipe that exists.
  const RETRY_INTERVAL: Duration = Duration::from_millis(10);

  /// Named pipe connection to mpv's `--input-ipc-server`.
  pub struct NamedPipeTransport {
    path: PathBuf,
    max_retries: Option<u32>,
  }

  impl NamedPipeTransport {
    /// `max_retries: None` keeps retrying until the open succeeds.
    pub fn new(path: impl AsRef<Path>, max_retries: Option<u32>) -> Self {
      Self {
        path: path.as_ref().to_path_buf(),
        max_retries,
      }
    }
  }

  #[async_trait]
  impl Transport for NamedPipeTransport {
    fn endpoint(&self) -> &Path {
      &self.path
    }

    async fn probe(&self) -> bool {
      self.path.exists()
    }

    async fn connect(&self) -> Result<Connection, TransportError> {
      let mut budget = RetryBudget::new(self.max_retries);
      loop {
        match ClientOptions::new().open(&self.path) {
          Ok(client) => return Ok(Connection::from_stream(client, WriteGuard::CheckClosed)),
          Err(source) => {
            if !budget.take() {
              return Err(TransportError::Connect {
                endpoint: self.path.display().to_string(),
                source,
              });
            }
            log::debug!("Failed to open pipe ({}), trying again", source);
            tokio::time::sleep(RETRY_INTERVAL).await;
          }
        }
      }
    }
  }
}
