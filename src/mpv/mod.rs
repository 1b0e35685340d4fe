//! mpv JSON IPC client.
//!
//! Architecture:
//! - `transport.rs` - Socket/pipe connections (Unix sockets on Linux/macOS, named pipes on Windows)
//! - `framer.rs` - Splits the byte stream into newline-terminated lines
//! - `protocol.rs` - JSON command/response/event types and line classification
//! - `registry.rs` - Request id allocation and outstanding commands
//! - `monitor.rs` - Connection lifecycle, read loop and command dispatch

mod framer;
mod monitor;
mod protocol;
mod registry;
mod transport;

pub use framer::{LineFramer, Lines};
pub use monitor::{MonitorError, MonitorHandler, MonitorState, MpvMonitor, NoopHandler};
pub use protocol::{
  get_property, observe_property, set_property, IncomingMessage, MalformedReason, MpvCommand,
  MpvEvent, MpvResponse,
};
pub use registry::CommandRegistry;
#[cfg(windows)]
pub use transport::NamedPipeTransport;
#[cfg(not(windows))]
pub use transport::UnixSocketTransport;
pub use transport::{
  platform_transport, Connection, ConnectionReader, ConnectionWriter, Transport, TransportError,
  WriteGuard, WriterLock,
};
