//! Incremental decoders for the two streaming wire formats.
//!
//! Network reads can split a line or frame anywhere, so both decoders keep a
//! buffer and only yield units once they are complete.

use crate::error::{Capability, CapabilityError};
use crate::event::ProgressEvent;

/// Largest partial unit kept in a buffer (1MB).
pub const MAX_BUFFER_SIZE: usize = 1_048_576;

/// Sentinel closing an SSE chat stream.
pub const DONE_SENTINEL: &str = "[DONE]";

/// Splits an NDJSON byte stream into `ProgressEvent`s.
#[derive(Debug, Default)]
pub struct LineDecoder {
    buffer: Vec<u8>,
}

impl LineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `bytes` and returns every complete event now available.
    pub fn push(&mut self, bytes: &[u8]) -> Result<Vec<ProgressEvent>, CapabilityError> {
        self.buffer.extend_from_slice(bytes);
        let mut events = Vec::new();

        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let event = serde_json::from_str(line).map_err(|e| {
                CapabilityError::invalid(Capability::Search, format!("bad event line: {e}"))
            })?;
            events.push(event);
        }

        if self.buffer.len() > MAX_BUFFER_SIZE {
            return Err(CapabilityError::invalid(
                Capability::Search,
                format!(
                    "buffer overflow: {} bytes exceeds maximum {}",
                    self.buffer.len(),
                    MAX_BUFFER_SIZE
                ),
            ));
        }
        Ok(events)
    }

    /// Bytes held back waiting for a newline.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}

/// One decoded server-sent-event frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseFrame {
    Data(String),
    Done,
}

/// Decodes `data:` frames from a server-sent-event byte stream.
///
/// Comment lines and non-data fields are skipped. Once `[DONE]` has been seen
/// every later byte is ignored.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    finished: bool,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn push(&mut self, bytes: &[u8]) -> Result<Vec<SseFrame>, CapabilityError> {
        if self.finished {
            return Ok(Vec::new());
        }
        self.buffer.extend(bytes.iter().copied().filter(|b| *b != b'\r'));

        let mut frames = Vec::new();
        while let Some(end) = self.buffer.windows(2).position(|w| w == b"\n\n") {
            let raw: Vec<u8> = self.buffer.drain(..end + 2).collect();
            if let Some(frame) = parse_frame(&String::from_utf8_lossy(&raw)) {
                let done = frame == SseFrame::Done;
                frames.push(frame);
                if done {
                    self.finished = true;
                    self.buffer.clear();
                    break;
                }
            }
        }

        if self.buffer.len() > MAX_BUFFER_SIZE {
            return Err(CapabilityError::invalid(
                Capability::Generation,
                "SSE frame exceeds buffer limit",
            ));
        }
        Ok(frames)
    }
}

fn parse_frame(raw: &str) -> Option<SseFrame> {
    let data: Vec<&str> = raw
        .lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(|value| value.strip_prefix(' ').unwrap_or(value))
        .collect();
    if data.is_empty() {
        return None;
    }
    let data = data.join("\n");
    if data.trim() == DONE_SENTINEL {
        Some(SseFrame::Done)
    } else {
        Some(SseFrame::Data(data))
    }
}

/// Encodes one SSE data frame.
pub fn sse_frame(data: &str) -> String {
    let mut frame = String::with_capacity(data.len() + 8);
    for line in data.split('\n') {
        frame.push_str("data: ");
        frame.push_str(line);
        frame.push('\n');
    }
    frame.push('\n');
    frame
}
