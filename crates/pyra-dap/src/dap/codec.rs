//! `Content-Length` framing shared by the async reader/writer.
//!
//! ```text
//! Content-Length: 123\r\n
//! \r\n
//! { ...json... }
//! ```

use super::messages::ProtocolMessage;
use super::MAX_DAP_MESSAGE_BYTES;
use crate::dap_tokio::DapError;

pub(crate) fn sanitize_json_error_message(message: &str) -> String {
    // `serde_json::Error` display strings can include scalar values from the
    // payload (`invalid type: string "..."`). Adapter payloads carry program
    // output and variable values, so keep them out of error messages.
    let mut out = String::with_capacity(message.len());
    let mut rest = message;
    while let Some(start) = rest.find('"') {
        out.push_str(&rest[..start + 1]);
        rest = &rest[start + 1..];

        let Some(end) = rest.find('"') else {
            out.push_str(rest);
            return out;
        };
        out.push_str("<redacted>\"");
        rest = &rest[end + 1..];
    }
    out.push_str(rest);

    // `unknown field `secret`, expected ...`: redact only the first backticked
    // segment so the expected list stays actionable.
    if let Some(start) = out.find('`') {
        if let Some(end_rel) = out[start + 1..].find('`') {
            let end = start + 1 + end_rel;
            out.replace_range(start + 1..end, "<redacted>");
        }
    }

    out
}

/// Serialize and frame one message.
pub fn encode(message: &ProtocolMessage) -> Result<Vec<u8>, DapError> {
    let body = serde_json::to_vec(message)?;
    let mut framed = format!("Content-Length: {}\r\n\r\n", body.len()).into_bytes();
    framed.extend_from_slice(&body);
    Ok(framed)
}

/// Parse a message body. Errors never echo payload values.
pub fn decode_body(bytes: &[u8]) -> Result<ProtocolMessage, DapError> {
    serde_json::from_slice(bytes).map_err(|err| {
        DapError::Protocol(format!(
            "invalid DAP message: {}",
            sanitize_json_error_message(&err.to_string())
        ))
    })
}

/// Inspect one header line (terminator already stripped).
///
/// Returns the body length for `Content-Length`; other headers are ignored.
pub(crate) fn parse_header_line(line: &str) -> Result<Option<usize>, DapError> {
    let Some((name, value)) = line.split_once(':') else {
        return Err(DapError::Protocol(format!(
            "malformed DAP header line ({} bytes)",
            line.len()
        )));
    };
    if !name.trim().eq_ignore_ascii_case("Content-Length") {
        return Ok(None);
    }

    let value = value.trim();
    let len = value
        .parse::<usize>()
        .map_err(|err| DapError::Protocol(format!("invalid Content-Length {value:?}: {err}")))?;
    if len > MAX_DAP_MESSAGE_BYTES {
        return Err(DapError::Protocol(format!(
            "DAP message Content-Length {len} exceeds maximum allowed size {MAX_DAP_MESSAGE_BYTES}"
        )));
    }
    Ok(Some(len))
}
