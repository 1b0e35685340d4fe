//! Newline framing for the IPC byte stream.

/// Accumulates raw chunks and hands out complete `\n`-terminated lines.
///
/// Bytes are buffered undecoded, so a UTF-8 sequence split across two reads
/// is reassembled before the line is decoded.
#[derive(Debug, Default)]
pub struct LineFramer {
  buffer: Vec<u8>,
  /// Prefix of `buffer` already known to contain no newline.
  scanned: usize,
}

impl LineFramer {
  pub fn new() -> Self {
    Self::default()
  }

  /// Append a chunk and iterate over every line it completes.
  ///
  /// Lines not consumed from the iterator stay buffered for the next call.
  pub fn push(&mut self, chunk: &[u8]) -> Lines<'_> {
    self.buffer.extend_from_slice(chunk);
    Lines { framer: self }
  }

  /// Number of buffered bytes not yet terminated by a newline.
  pub fn pending(&self) -> usize {
    self.buffer.len()
  }

  /// End the stream, returning how many unterminated bytes were dropped.
  pub fn finish(self) -> usize {
    self.buffer.len()
  }
}

/// Draining iterator over complete lines, newline excluded.
pub struct Lines<'a> {
  framer: &'a mut LineFramer,
}

impl Iterator for Lines<'_> {
  type Item = String;

  fn next(&mut self) -> Option<String> {
    let framer = &mut *self.framer;
    let end = match framer.buffer[framer.scanned..].iter().position(|&b| b == b'\n') {
      Some(offset) => framer.scanned + offset,
      None => {
        framer.scanned = framer.buffer.len();
        return None;
      }
    };
    let line = String::from_utf8_lossy(&framer.buffer[..end]).into_owned();
    framer.buffer.drain(..=end);
    framer.scanned = 0;
    Some(line)
  }
}
