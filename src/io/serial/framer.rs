// src/io/serial/framer.rs
//
// Newline framing for the serial byte stream.
// Splits raw reads into whitespace-trimmed text lines, dropping bytes that
// do not decode as UTF-8.

/// Max buffered bytes before a forced split.
/// Guards against a stream that never sends a newline.
const DEFAULT_MAX_LINE_LENGTH: usize = 4096;

/// Stateful line framer for streaming serial data.
/// Feed it raw read chunks; it returns complete lines as they appear.
/// Partial line data is carried across feeds. Empty and whitespace-only
/// lines are swallowed — the watchdog only cares about lines with content.
pub struct LineFramer {
    buffer: Vec<u8>,
    max_length: usize,
}

impl LineFramer {
    pub fn new() -> Self {
        Self::with_max_length(DEFAULT_MAX_LINE_LENGTH)
    }

    pub fn with_max_length(max_length: usize) -> Self {
        LineFramer {
            buffer: Vec::new(),
            max_length,
        }
    }

    /// Feed raw bytes into the framer.
    /// Returns the non-empty, trimmed lines completed by this chunk.
    pub fn feed(&mut self, data: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();

        for &byte in data {
            if byte == b'\n' {
                let raw: Vec<u8> = self.buffer.drain(..).collect();
                if let Some(line) = finish_line(&raw) {
                    lines.push(line);
                }
                continue;
            }

            self.buffer.push(byte);

            // Force split on max length
            if self.buffer.len() >= self.max_length {
                let raw: Vec<u8> = self.buffer.drain(..).collect();
                if let Some(line) = finish_line(&raw) {
                    lines.push(line);
                }
            }
        }

        lines
    }
}

impl Default for LineFramer {
    fn default() -> Self {
        Self::new()
    }
}

/// Decode and trim one raw line. Returns None if nothing printable remains.
fn finish_line(raw: &[u8]) -> Option<String> {
    let text = decode_dropping_invalid(raw);
    let trimmed = text.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Decode bytes as UTF-8, dropping undecodable byte sequences entirely.
/// Decode anomalies are not errors — malformed bytes on a noisy serial line
/// are expected and must never kill the session.
fn decode_dropping_invalid(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len());
    let mut rest = bytes;

    while !rest.is_empty() {
        match std::str::from_utf8(rest) {
            Ok(s) => {
                out.push_str(s);
                break;
            }
            Err(e) => {
                let valid = e.valid_up_to();
                // The prefix is known-valid UTF-8, so this borrows without replacement
                out.push_str(&String::from_utf8_lossy(&rest[..valid]));
                let skip = e.error_len().unwrap_or(rest.len() - valid);
                rest = &rest[valid + skip..];
            }
        }
    }

    out
}
