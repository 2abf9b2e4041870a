//! Control channel protocol types and framing.
//!
//! The wrapper and the backend speak newline-delimited UTF-8 JSON over a
//! loopback TCP socket. Each line is one frame:
//!
//! - Request: `{"id": string, "method": string, "params"?: object}`
//! - Response: `{"id": string, "result"?: any}` or
//!   `{"id": string, "error": {"message": string}}`
//!
//! Request ids are chosen by the caller and echoed verbatim; the backend
//! never generates its own.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io;
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Maximum accepted frame length. A line longer than this is a protocol
/// violation, not a legitimate request.
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

/// Method names recognized by the control channel.
pub const METHOD_PING: &str = "ping";
pub const METHOD_LIST_TOOLS: &str = "list_tools";
pub const METHOD_CALL_TOOL: &str = "call_tool";
pub const METHOD_STATUS: &str = "status";
pub const METHOD_SHUTDOWN: &str = "shutdown";

/// Request envelope sent from the wrapper to the backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    /// Correlation id, echoed back on the response.
    pub id: String,
    /// The method to invoke.
    pub method: String,
    /// Method-specific parameters.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl Request {
    pub fn new(id: impl Into<String>, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            id: id.into(),
            method: method.into(),
            params,
        }
    }
}

/// Response envelope sent from the backend to the wrapper.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    /// Correlation id of the request this answers.
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

/// Wire shape of a response error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub message: String,
}

impl Response {
    /// A successful response carrying `result`.
    pub fn ok(id: impl Into<String>, result: impl Serialize) -> Self {
        Self {
            id: id.into(),
            result: Some(serde_json::to_value(result).unwrap_or(Value::Null)),
            error: None,
        }
    }

    /// An error response carrying `message`.
    pub fn err(id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            result: None,
            error: Some(ErrorBody {
                message: message.into(),
            }),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Serialize `frame` and write it as one newline-terminated line.
pub async fn write_frame<W, T>(writer: &mut W, frame: &T) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut line = serde_json::to_vec(frame).map_err(io::Error::other)?;
    line.push(b'\n');
    writer.write_all(&line).await?;
    writer.flush().await?;
    Ok(())
}

/// Decode one frame from a complete line. Empty/whitespace lines decode to
/// `None`; malformed JSON is an error the caller decides how to handle.
pub fn decode_line<T: for<'de> Deserialize<'de>>(line: &str) -> io::Result<Option<T>> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    if trimmed.len() > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame too large: {} bytes (max {})", trimmed.len(), MAX_FRAME_LEN),
        ));
    }
    serde_json::from_str(trimmed)
        .map(Some)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

/// Pull the `id` out of a line that failed full decoding, so a malformed
/// request can still get an addressed error response.
pub fn salvage_id(line: &str) -> Option<String> {
    let value: Value = serde_json::from_str(line.trim()).ok()?;
    value.get("id")?.as_str().map(String::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_roundtrip() {
        let request = Request::new("7", METHOD_CALL_TOOL, Some(serde_json::json!({"name": "x"})));
        let json = serde_json::to_string(&request).unwrap();
        let decoded: Request = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded.id, "7");
        assert_eq!(decoded.method, METHOD_CALL_TOOL);
        assert_eq!(decoded.params.unwrap()["name"], "x");
    }

    #[test]
    fn request_without_params_omits_field() {
        let request = Request::new("1", METHOD_PING, None);
        let json = serde_json::to_string(&request).unwrap();
        assert!(!json.contains("params"));
    }

    #[test]
    fn response_ok_roundtrip() {
        let response = Response::ok("42", serde_json::json!({"ok": true}));
        let json = serde_json::to_string(&response).unwrap();
        assert!(!json.contains("error"));

        let decoded: Response = serde_json::from_str(&json).unwrap();
        assert!(decoded.is_ok());
        assert_eq!(decoded.id, "42");
        assert_eq!(decoded.result.unwrap()["ok"], true);
    }

    #[test]
    fn response_err_roundtrip() {
        let response = Response::err("9", "Unknown method");
        let json = serde_json::to_string(&response).unwrap();
        assert!(!json.contains("result"));

        let decoded: Response = serde_json::from_str(&json).unwrap();
        assert!(!decoded.is_ok());
        assert_eq!(decoded.error.unwrap().message, "Unknown method");
    }

    #[tokio::test]
    async fn write_frame_emits_one_line() {
        let mut buf = Vec::new();
        write_frame(&mut buf, &Request::new("1", METHOD_PING, None)).await.unwrap();
        write_frame(&mut buf, &Request::new("2", METHOD_PING, None)).await.unwrap();

        let text = String::from_utf8(buf).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: Request = decode_line(lines[0]).unwrap().unwrap();
        assert_eq!(first.id, "1");
    }

    #[test]
    fn decode_line_skips_blank_lines() {
        let decoded: Option<Request> = decode_line("   \n").unwrap();
        assert!(decoded.is_none());
    }

    #[test]
    fn decode_line_rejects_malformed_json() {
        let result: io::Result<Option<Request>> = decode_line("{not json");
        assert!(result.is_err());
    }

    #[test]
    fn salvage_id_from_malformed_request() {
        // Valid JSON but not a valid Request (method missing).
        assert_eq!(salvage_id(r#"{"id":"abc"}"#), Some("abc".to_string()));
        assert_eq!(salvage_id("{broken"), None);
        assert_eq!(salvage_id(r#"{"id":17}"#), None);
    }
}
