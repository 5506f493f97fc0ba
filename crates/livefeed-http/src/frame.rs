//! Line-oriented decoding of the streaming response body.
//!
//! The body is `text/event-stream` shaped: one frame per line, `data:`
//! prefix optional, `:` comment lines as keep-alives.

use serde_json::Value;

use livefeed_core::{DeliveryError, Event};

/// Longest line accepted before the connection is considered broken.
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

const IGNORED_FIELDS: [&str; 3] = ["event:", "id:", "retry:"];

/// A decoded stream frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Server acknowledged the subscription.
    Ack,
    /// Keep-alive.
    Heartbeat,
    /// One event.
    Data(Event),
}

/// Decode one line. `Ok(None)` for separators and ignored SSE fields.
///
/// A line that is neither a control frame nor a valid event is a
/// [`DeliveryError::Frame`]; the caller decides whether to keep reading.
pub fn parse_line(line: &str) -> Result<Option<Frame>, DeliveryError> {
    let line = line.trim_end_matches('\r');
    if line.trim().is_empty() {
        return Ok(None);
    }
    if line.starts_with(':') {
        return Ok(Some(Frame::Heartbeat));
    }
    let payload = match line.strip_prefix("data:") {
        Some(rest) => rest.trim_start(),
        None if IGNORED_FIELDS.iter().any(|f| line.starts_with(f)) => return Ok(None),
        None => line,
    };

    let value: Value = serde_json::from_str(payload)
        .map_err(|e| DeliveryError::Frame(format!("{e} in `{}`", preview(payload))))?;
    if value.get("id").is_none() {
        match value.get("type").and_then(Value::as_str) {
            Some("connected") => return Ok(Some(Frame::Ack)),
            Some("heartbeat") => return Ok(Some(Frame::Heartbeat)),
            _ => {}
        }
    }
    serde_json::from_value(value)
        .map(|event| Some(Frame::Data(event)))
        .map_err(|e| DeliveryError::Frame(format!("not an event: {e}")))
}

fn preview(s: &str) -> String {
    s.chars().take(64).collect()
}

/// Splits network chunks into complete lines, buffering partial ones.
#[derive(Debug, Default)]
pub struct LineDecoder {
    buf: Vec<u8>,
    /// Prefix of `buf` already known to hold no newline.
    scanned: usize,
}

impl LineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk; returns every line it completed.
    ///
    /// Fails when a single line grows past [`MAX_LINE_BYTES`].
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<String>, DeliveryError> {
        self.buf.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(offset) = self.buf[self.scanned..].iter().position(|b| *b == b'\n') {
            let pos = self.scanned + offset;
            self.scanned = 0;
            let raw: Vec<u8> = self.buf.drain(..=pos).collect();
            let raw = &raw[..raw.len() - 1];
            if raw.len() > MAX_LINE_BYTES {
                return Err(oversized(raw.len()));
            }
            lines.push(String::from_utf8_lossy(raw).trim_end_matches('\r').to_string());
        }
        if self.buf.len() > MAX_LINE_BYTES {
            return Err(oversized(self.buf.len()));
        }
        self.scanned = self.buf.len();
        Ok(lines)
    }

    /// Bytes of an unterminated trailing line.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

fn oversized(len: usize) -> DeliveryError {
    DeliveryError::Stream(format!("frame of {len} bytes exceeds {MAX_LINE_BYTES}"))
}
