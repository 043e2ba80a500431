//! Worker sub-protocol: one script line in, one marker line out.
//!
//! The worker answers every submitted line with exactly one terminal line made of
//! a marker token followed by the base64 encoding of UTF-8 text. Anything else it
//! prints before that line is ordinary captured output.

use autocode_core::next_hex_id;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;

pub const DECODE_ERROR_PLACEHOLDER: &str = "<base64 decode error>";
pub const TIMEOUT_MESSAGE: &str = "Timeout waiting for response";
/// Scripts longer than this (in characters) are shipped base64-wrapped.
pub const WRAP_THRESHOLD_CHARS: usize = 800;
const MARKER_NONCE_LEN: usize = 16;

/// Marker tokens for one worker session.
///
/// A fresh nonce is minted per worker start so a script printing a fixed
/// `<<<RESULT>>>` line cannot impersonate a protocol reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerMarkers {
    result: String,
    error: String,
}

impl WorkerMarkers {
    pub fn generate() -> Self {
        Self::with_nonce(&next_hex_id(MARKER_NONCE_LEN))
    }

    pub fn with_nonce(nonce: &str) -> Self {
        Self {
            result: format!("<<<RESULT:{nonce}>>>"),
            error: format!("<<<ERROR:{nonce}>>>"),
        }
    }

    pub fn result(&self) -> &str {
        &self.result
    }

    pub fn error(&self) -> &str {
        &self.error
    }

    /// Classifies one raw output line (trailing `\r\n` ignored).
    pub fn classify(&self, raw: &str) -> WorkerLine {
        let line = raw.trim_end_matches(['\r', '\n']);
        if let Some(encoded) = line.strip_prefix(self.result.as_str()) {
            return WorkerLine::Result(decode_payload(encoded));
        }
        if let Some(encoded) = line.strip_prefix(self.error.as_str()) {
            return WorkerLine::Error(decode_payload(encoded));
        }
        WorkerLine::Output(line.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerLine {
    Result(String),
    Error(String),
    Output(String),
}

impl WorkerLine {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Output(_))
    }
}

/// Decodes a marker payload; malformed base64 yields [`DECODE_ERROR_PLACEHOLDER`].
pub fn decode_payload(encoded: &str) -> String {
    match STANDARD.decode(encoded.trim()) {
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(_) => DECODE_ERROR_PLACEHOLDER.to_string(),
    }
}

pub fn encode_payload(text: &str) -> String {
    STANDARD.encode(text.as_bytes())
}

/// Multi-line or very long scripts must be wrapped to keep one-line framing.
pub fn needs_wrapping(script: &str) -> bool {
    script.contains('\n') || script.chars().count() > WRAP_THRESHOLD_CHARS
}
