//! Envelope types for the gateway wire protocol.
//!
//! Every frame is a JSON text message of the shape
//! `{"type": string, "id": string, "data": any}`:
//!
//! - Outbound query: `{"type":"mcp-query","id":"q1","data":{"method":...,"data":...}}`
//! - Inbound response: `{"type":"mcp-response","id":"q1","data":{"success":bool,"data"|"error":...}}`
//! - Keepalive: `{"type":"ping"/"pong","id":string,"data":any}`
//!
//! Anything else is an unsolicited event (e.g. `job-progress`) routed to the
//! registered event handler.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const TYPE_QUERY: &str = "mcp-query";
pub const TYPE_RESPONSE: &str = "mcp-response";
pub const TYPE_PING: &str = "ping";
pub const TYPE_PONG: &str = "pong";

/// Generic gateway frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub data: Value,
}

/// Payload of an outbound query envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryData {
    pub method: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
}

/// Payload of an inbound response envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseData {
    pub success: bool,
    #[serde(default)]
    pub data: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Envelope {
    pub fn query(id: impl Into<String>, method: impl Into<String>, data: Value) -> Self {
        Self {
            kind: TYPE_QUERY.to_string(),
            id: id.into(),
            data: serde_json::to_value(QueryData {
                method: method.into(),
                data,
            })
            .unwrap_or(Value::Null),
        }
    }

    pub fn pong(id: impl Into<String>) -> Self {
        Self {
            kind: TYPE_PONG.to_string(),
            id: id.into(),
            data: Value::Null,
        }
    }

    /// Interpret this envelope's data as a query response.
    pub fn response_data(&self) -> Option<ResponseData> {
        serde_json::from_value(self.data.clone()).ok()
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_envelope_wire_shape() {
        let envelope = Envelope::query("q7", "get-scene", serde_json::json!({"name": "tavern"}));
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["type"], "mcp-query");
        assert_eq!(json["id"], "q7");
        assert_eq!(json["data"]["method"], "get-scene");
        assert_eq!(json["data"]["data"]["name"], "tavern");
    }

    #[test]
    fn query_without_data_omits_inner_field() {
        let envelope = Envelope::query("q1", "list-scenes", Value::Null);
        let json = envelope.to_json();
        assert!(json.contains("\"method\":\"list-scenes\""));
        assert!(!json.contains("\"data\":{\"data\""));
    }

    #[test]
    fn response_envelope_parses() {
        let raw = r#"{"type":"mcp-response","id":"q3","data":{"success":true,"data":{"ok":1}}}"#;
        let envelope: Envelope = serde_json::from_str(raw).unwrap();
        assert_eq!(envelope.kind, TYPE_RESPONSE);

        let data = envelope.response_data().unwrap();
        assert!(data.success);
        assert_eq!(data.data["ok"], 1);
        assert!(data.error.is_none());
    }

    #[test]
    fn failed_response_carries_error() {
        let raw = r#"{"type":"mcp-response","id":"q4","data":{"success":false,"error":"no scene"}}"#;
        let envelope: Envelope = serde_json::from_str(raw).unwrap();
        let data = envelope.response_data().unwrap();
        assert!(!data.success);
        assert_eq!(data.error.as_deref(), Some("no scene"));
    }

    #[test]
    fn event_envelope_without_id_defaults_empty() {
        let raw = r#"{"type":"job-progress","data":{"job_id":"job-1","percent":40}}"#;
        let envelope: Envelope = serde_json::from_str(raw).unwrap();
        assert_eq!(envelope.kind, "job-progress");
        assert!(envelope.id.is_empty());
    }
}
