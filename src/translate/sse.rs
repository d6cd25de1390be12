//! Line framing and per-event rewriting for `text/event-stream` bodies.
//!
//! [`LineDecoder`] turns arbitrary upstream byte chunks into complete lines.
//! [`EventRewriter`] turns each line into at most one downstream event.

use super::reasoning::ReasoningFormat;
use bytes::BytesMut;
use thiserror::Error;

/// Prefix of an event-stream data line, without the optional space.
pub const DATA_PREFIX: &str = "data:";

/// Payload that marks the end of an OpenAI-style completion stream.
pub const DONE_SENTINEL: &str = "[DONE]";

/// Blank line terminating every emitted event.
const EVENT_TERMINATOR: &str = "\n\n";

/// Incremental newline splitter over a byte stream.
///
/// Bytes are buffered raw and only decoded once a full line is available. `\n`
/// never occurs inside a multi-byte UTF-8 sequence, so a character split across
/// two chunks is always reassembled before decoding.
#[derive(Debug, Default)]
pub struct LineDecoder {
    buffer: BytesMut,
    /// Prefix of `buffer` already known to hold no newline.
    scanned: usize,
    max_line: Option<usize>,
}

/// An unterminated line grew past the decoder's limit.
#[derive(Debug, Error)]
#[error("Upstream event line exceeds {limit} bytes.")]
pub struct LineTooLong {
    pub limit: usize,
}

impl LineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse to buffer an unterminated line longer than `limit` bytes.
    pub fn with_max_line(mut self, limit: Option<usize>) -> Self {
        self.max_line = limit;
        self
    }

    /// Append a chunk and return an iterator over the lines it completes.
    ///
    /// Lines are yielded lazily with surrounding whitespace (including `\r`)
    /// trimmed. Whatever follows the last newline stays buffered.
    pub fn push(&mut self, chunk: &[u8]) -> Result<CompleteLines<'_>, LineTooLong> {
        if let Some(limit) = self.max_line {
            let tail = match chunk.iter().rposition(|b| *b == b'\n') {
                Some(last) => chunk.len() - last - 1,
                None => self.buffer.len() + chunk.len(),
            };
            if tail > limit {
                return Err(LineTooLong { limit });
            }
        }
        self.buffer.extend_from_slice(chunk);
        Ok(CompleteLines { decoder: self })
    }

    /// Bytes currently held that are not yet newline-terminated.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Consume the trailing partial line at end of stream.
    ///
    /// Only a data line is returned; any other unterminated remainder is
    /// discarded.
    pub fn finish(&mut self) -> Option<String> {
        let rest = self.buffer.split();
        self.scanned = 0;
        let line = decode_line(&rest);
        if line.starts_with(DATA_PREFIX) {
            Some(line)
        } else {
            None
        }
    }
}

/// Lines completed by the most recent [`LineDecoder::push`].
#[derive(Debug)]
pub struct CompleteLines<'a> {
    decoder: &'a mut LineDecoder,
}

impl Iterator for CompleteLines<'_> {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        let decoder = &mut *self.decoder;
        let Some(offset) = decoder.buffer[decoder.scanned..]
            .iter()
            .position(|b| *b == b'\n')
        else {
            decoder.scanned = decoder.buffer.len();
            return None;
        };
        let newline = decoder.scanned + offset;
        let raw = decoder.buffer.split_to(newline + 1);
        decoder.scanned = 0;
        Some(decode_line(&raw[..newline]))
    }
}

fn decode_line(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw).trim().to_string()
}

/// What the rewriter made of one upstream line.
#[derive(Debug)]
pub enum Rewritten {
    /// A complete downstream event, terminator included.
    Event(String),
    /// Blank separator line; nothing to emit.
    Blank,
    /// A data line whose payload was not valid JSON. Nothing is emitted.
    Dropped {
        payload: String,
        error: serde_json::Error,
    },
}

/// Rewrites event-stream lines, applying the configured [`ReasoningFormat`] to
/// each JSON data payload.
#[derive(Debug, Clone, Copy)]
pub struct EventRewriter {
    format: ReasoningFormat,
}

impl EventRewriter {
    pub fn new(format: ReasoningFormat) -> Self {
        Self { format }
    }

    pub fn rewrite_line(&self, line: &str) -> Rewritten {
        let line = line.trim();
        if line.is_empty() {
            return Rewritten::Blank;
        }

        // Comments, `event:` and `id:` lines pass through untouched.
        let Some(data) = line.strip_prefix(DATA_PREFIX) else {
            return Rewritten::Event(format!("{line}{EVENT_TERMINATOR}"));
        };
        let data = data.trim_start();

        if data == DONE_SENTINEL {
            return Rewritten::Event(format!("data: {DONE_SENTINEL}{EVENT_TERMINATOR}"));
        }

        let mut payload: serde_json::Value = match serde_json::from_str(data) {
            Ok(value) => value,
            Err(error) => {
                return Rewritten::Dropped {
                    payload: data.to_string(),
                    error,
                }
            }
        };

        self.format.apply_to_payload(&mut payload);
        Rewritten::Event(format!("data: {payload}{EVENT_TERMINATOR}"))
    }
}
