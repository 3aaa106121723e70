//! Message framing over tool server output.
//!
//! Messages are newline-delimited JSON. Tool servers routinely interleave
//! banners, log chatter and half-written fragments with the protocol lines,
//! so decoding is permissive about noise and strict about what counts as a
//! response: a JSON object carrying a version tag (`jsonrpc` or `version`),
//! an `id`, and exactly one of `result` or `error`.

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, trace};

use crate::error::McpError;
use crate::protocol::{RequestId, Response, ResponseOutcome};

/// Field names accepted as the protocol version tag.
const VERSION_KEYS: [&str; 2] = ["jsonrpc", "version"];

/// Upper bound on diagnostic text attached to errors.
const MAX_DIAGNOSTIC_BYTES: usize = 2048;

/// Encode a message as a single line, newline included.
pub fn encode_message<T: Serialize>(message: &T) -> Result<String, McpError> {
    let mut line = serde_json::to_string(message)?;
    line.push('\n');
    Ok(line)
}

/// Decode one line as a response envelope.
///
/// Returns `None` for anything that is not a well-formed response: non-JSON
/// text, partial JSON, requests and notifications, objects without a version
/// tag or id, and objects carrying both or neither of `result`/`error`.
pub fn parse_line(line: &str) -> Option<Response> {
    let line = line.trim();
    if !line.starts_with('{') {
        return None;
    }

    let Value::Object(mut object) = serde_json::from_str::<Value>(line).ok()? else {
        return None;
    };

    let has_version = VERSION_KEYS
        .iter()
        .any(|key| object.get(*key).map(Value::is_string).unwrap_or(false));
    if !has_version {
        return None;
    }

    let id: RequestId = serde_json::from_value(object.remove("id")?).ok()?;

    let outcome = match (object.remove("result"), object.remove("error")) {
        (Some(result), None) => ResponseOutcome::Result(result),
        (None, Some(error)) => ResponseOutcome::Error(serde_json::from_value(error).ok()?),
        _ => return None,
    };

    Some(Response { id, outcome })
}

/// Find the first response in `text` answering request `id`.
///
/// Well-formed responses carrying a different id are skipped.
pub fn find_response(text: &str, id: &RequestId) -> Option<Response> {
    for line in text.lines() {
        match parse_line(line) {
            Some(response) if &response.id == id => return Some(response),
            Some(response) => {
                debug!(expected = %id, got = %response.id, "Skipping response for another request");
            }
            None => {
                trace!(line = line, "Skipping non-protocol output");
            }
        }
    }
    None
}

/// Locate the first response in a captured output stream.
///
/// Fails with [`McpError::ProtocolParse`] when no line qualifies; the error
/// carries a tail excerpt of the text for debugging.
pub fn parse_response(text: &str) -> Result<Response, McpError> {
    text.lines()
        .find_map(parse_line)
        .ok_or_else(|| McpError::protocol("no valid response found", excerpt(text)))
}

/// Trimmed tail of `text`, bounded to a few kilobytes.
pub(crate) fn excerpt(text: &str) -> String {
    let text = text.trim();
    if text.len() <= MAX_DIAGNOSTIC_BYTES {
        return text.to_string();
    }

    let mut start = text.len() - MAX_DIAGNOSTIC_BYTES;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    format!("...{}", &text[start..])
}
