//! Stream normalization plumbing shared by every driver.
//!
//! A normalizer consumes raw stdout chunks (arbitrary byte boundaries) and
//! produces `ExecutionEvent`s. Normalizers are pure: no I/O, no clocks, so the
//! per-format parsers can be tested with fixtures.

use super::events::ExecutionEvent;

/// Converts one CLI's raw output into engine-agnostic events.
///
/// A fresh normalizer is created for every subprocess invocation.
pub trait StreamNormalizer: Send {
    /// Feed a raw stdout chunk; returns the events completed by it.
    fn feed(&mut self, chunk: &[u8]) -> Vec<ExecutionEvent>;

    /// Flush buffered state at end of stream.
    fn finish(&mut self) -> Vec<ExecutionEvent>;
}

/// Splits a byte stream into complete lines.
///
/// Bytes are kept until a newline arrives so multi-byte UTF-8 sequences split
/// across chunks decode correctly.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and drain every complete line (without `\n` / `\r\n`).
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
            let mut line: Vec<u8> = self.pending.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            lines.push(String::from_utf8_lossy(&line).into_owned());
        }
        lines
    }

    /// Return the trailing partial line, if any.
    pub fn flush(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.pending);
        let text = String::from_utf8_lossy(&rest).trim_end_matches('\r').to_string();
        Some(text)
    }
}

/// Feed a complete output through a normalizer in one go.
pub fn normalize_all(normalizer: &mut dyn StreamNormalizer, output: &[u8]) -> Vec<ExecutionEvent> {
    let mut events = normalizer.feed(output);
    events.extend(normalizer.finish());
    events
}
