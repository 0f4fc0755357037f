//! Bounded line reader
//!
//! Lines longer than the buffer are truncated at the buffer size; the rest of
//! the line is consumed and discarded so the next read starts on a fresh line.

use std::io::{self, BufRead};

/// Scan buffer size
pub const MAX_LINE: usize = 64 * 1024;

/// Reads lines of at most `max` bytes
pub struct BoundedLines<R> {
    inner: R,
    max: usize,
}

impl<R: BufRead> BoundedLines<R> {
    /// Wrap a reader
    pub fn new(inner: R, max: usize) -> Self {
        Self { inner, max }
    }

    /// Next line without its terminator; `None` at end of input
    pub fn next_line(&mut self) -> io::Result<Option<Vec<u8>>> {
        let mut line = Vec::new();
        let mut seen = false;
        loop {
            let available = match self.inner.fill_buf() {
                Ok(buf) => buf,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };
            if available.is_empty() {
                return Ok(seen.then_some(line));
            }
            seen = true;
            let (chunk, found) = match available.iter().position(|b| *b == b'\n') {
                Some(i) => (&available[..i], Some(i + 1)),
                None => (available, None),
            };
            let room = self.max.saturating_sub(line.len());
            line.extend_from_slice(&chunk[..chunk.len().min(room)]);
            let used = found.unwrap_or(available.len());
            self.inner.consume(used);
            if found.is_some() {
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                return Ok(Some(line));
            }
        }
    }
}
