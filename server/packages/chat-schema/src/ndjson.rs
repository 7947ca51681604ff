use thiserror::Error;

use crate::UiMessage;

pub const NDJSON_CONTENT_TYPE: &str = "application/x-ndjson";

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("line is not valid utf-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),
    #[error("line is not a chat message: {0}")]
    Json(#[from] serde_json::Error),
}

/// Serializes one message as a JSON object followed by `\n`.
pub fn encode_line(message: &UiMessage) -> Result<Vec<u8>, serde_json::Error> {
    let mut line = serde_json::to_vec(message)?;
    line.push(b'\n');
    Ok(line)
}

/// Callers skip blank lines before decoding; they are not errors.
pub fn is_blank_line(line: &str) -> bool {
    line.trim().is_empty()
}

pub fn decode_line(line: &str) -> Result<UiMessage, DecodeError> {
    Ok(serde_json::from_str(line.trim_end_matches('\r'))?)
}

pub fn decode_line_bytes(line: &[u8]) -> Result<UiMessage, DecodeError> {
    decode_line(std::str::from_utf8(line)?)
}
