//! Tool registry: the seam between the control channel and tool handlers.
//!
//! Tool identifiers are a closed enum, and the registry is validated at
//! startup: a backend missing a handler for any known tool refuses to start
//! instead of failing on the first call. Handler faults never escape as
//! transport errors; they become an error-flagged content payload so the
//! caller always receives a well-formed response.

pub mod jobs;

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::Serialize;
use serde_json::Value;

use crate::error::{Result, ScryError};

/// Closed set of tool identifiers this backend serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ToolName {
    GenerateMap,
    JobStatus,
    CancelJob,
    QueueMetrics,
}

impl ToolName {
    /// All known tools, in catalogue order.
    pub const ALL: [ToolName; 4] = [
        ToolName::GenerateMap,
        ToolName::JobStatus,
        ToolName::CancelJob,
        ToolName::QueueMetrics,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::GenerateMap => "generate-map",
            Self::JobStatus => "job-status",
            Self::CancelJob => "cancel-job",
            Self::QueueMetrics => "queue-metrics",
        }
    }
}

impl std::str::FromStr for ToolName {
    type Err = ScryError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "generate-map" => Ok(Self::GenerateMap),
            "job-status" => Ok(Self::JobStatus),
            "cancel-job" => Ok(Self::CancelJob),
            "queue-metrics" => Ok(Self::QueueMetrics),
            other => Err(ScryError::UnknownTool(other.to_string())),
        }
    }
}

impl std::fmt::Display for ToolName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Catalogue entry returned by `list_tools`.
#[derive(Debug, Clone, Serialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
}

/// One block of tool output.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ContentBlock {
    Text { text: String },
}

/// Result payload of a tool call. `is_error` flags handler faults without
/// breaking the response envelope.
#[derive(Debug, Clone, Serialize)]
pub struct ToolContent {
    pub content: Vec<ContentBlock>,
    #[serde(rename = "isError", skip_serializing_if = "std::ops::Not::not")]
    pub is_error: bool,
}

impl ToolContent {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![ContentBlock::Text { text: text.into() }],
            is_error: false,
        }
    }

    /// Successful output rendered as pretty JSON text.
    pub fn json(value: &impl Serialize) -> Self {
        let text = serde_json::to_string_pretty(value).unwrap_or_else(|_| "null".to_string());
        Self::text(text)
    }

    pub fn error(message: impl std::fmt::Display) -> Self {
        Self {
            content: vec![ContentBlock::Text {
                text: format!("Error: {message}"),
            }],
            is_error: true,
        }
    }
}

/// A registered tool implementation.
pub trait ToolHandler: Send + Sync {
    fn descriptor(&self) -> ToolDescriptor;
    fn call(&self, args: Value) -> BoxFuture<'_, Result<Value>>;
}

/// Maps each [`ToolName`] to its handler.
#[derive(Default)]
pub struct ToolRegistry {
    handlers: HashMap<ToolName, Arc<dyn ToolHandler>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: ToolName, handler: Arc<dyn ToolHandler>) {
        self.handlers.insert(name, handler);
    }

    /// Fail fast when any known tool lacks a handler. Called once at backend
    /// startup.
    pub fn validate(&self) -> Result<()> {
        for name in ToolName::ALL {
            if !self.handlers.contains_key(&name) {
                return Err(ScryError::UnregisteredTool(name.as_str().to_string()));
            }
        }
        Ok(())
    }

    /// The tool catalogue, in [`ToolName::ALL`] order.
    pub fn list_tools(&self) -> Vec<ToolDescriptor> {
        ToolName::ALL
            .iter()
            .filter_map(|name| self.handlers.get(name))
            .map(|handler| handler.descriptor())
            .collect()
    }

    /// Dispatch a call. Unknown names and handler faults both come back as
    /// error-flagged content, never as a transport failure.
    pub async fn call_tool(&self, name: &str, args: Value) -> ToolContent {
        let tool: ToolName = match name.parse() {
            Ok(tool) => tool,
            Err(e) => {
                tracing::warn!(tool = name, "Call to unknown tool");
                return ToolContent::error(e);
            }
        };

        let Some(handler) = self.handlers.get(&tool) else {
            return ToolContent::error(ScryError::UnregisteredTool(name.to_string()));
        };

        match handler.call(args).await {
            Ok(value) => ToolContent::json(&value),
            Err(e) => {
                tracing::warn!(tool = name, error = %e, "Tool call failed");
                ToolContent::error(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoTool;

    impl ToolHandler for EchoTool {
        fn descriptor(&self) -> ToolDescriptor {
            ToolDescriptor {
                name: ToolName::QueueMetrics.as_str().to_string(),
                description: "echo".to_string(),
                input_schema: serde_json::json!({"type": "object"}),
            }
        }

        fn call(&self, args: Value) -> BoxFuture<'_, Result<Value>> {
            Box::pin(async move { Ok(args) })
        }
    }

    struct FailingTool;

    impl ToolHandler for FailingTool {
        fn descriptor(&self) -> ToolDescriptor {
            ToolDescriptor {
                name: ToolName::CancelJob.as_str().to_string(),
                description: "always fails".to_string(),
                input_schema: serde_json::json!({"type": "object"}),
            }
        }

        fn call(&self, _args: Value) -> BoxFuture<'_, Result<Value>> {
            Box::pin(async move { Err(ScryError::InvalidArgument("boom".to_string())) })
        }
    }

    #[test]
    fn tool_name_parses_wire_names() {
        assert_eq!("generate-map".parse::<ToolName>().unwrap(), ToolName::GenerateMap);
        assert!(matches!(
            "reticulate-splines".parse::<ToolName>(),
            Err(ScryError::UnknownTool(_))
        ));
    }

    #[test]
    fn validate_rejects_incomplete_registry() {
        let mut registry = ToolRegistry::new();
        registry.register(ToolName::QueueMetrics, Arc::new(EchoTool));

        let err = registry.validate().unwrap_err();
        assert!(matches!(err, ScryError::UnregisteredTool(_)));
    }

    #[tokio::test]
    async fn unknown_tool_yields_error_content() {
        let registry = ToolRegistry::new();
        let content = registry.call_tool("nonsense", Value::Null).await;
        assert!(content.is_error);
    }

    #[tokio::test]
    async fn handler_fault_becomes_error_content() {
        let mut registry = ToolRegistry::new();
        registry.register(ToolName::CancelJob, Arc::new(FailingTool));

        let content = registry.call_tool("cancel-job", Value::Null).await;
        assert!(content.is_error);
        let ContentBlock::Text { text } = &content.content[0];
        assert!(text.contains("boom"));
    }

    #[tokio::test]
    async fn successful_call_returns_json_content() {
        let mut registry = ToolRegistry::new();
        registry.register(ToolName::QueueMetrics, Arc::new(EchoTool));

        let content = registry.call_tool("queue-metrics", serde_json::json!({"n": 3})).await;
        assert!(!content.is_error);
        let ContentBlock::Text { text } = &content.content[0];
        assert!(text.contains("\"n\": 3"));
    }

    #[test]
    fn error_content_serializes_is_error_flag() {
        let content = ToolContent::error("bad input");
        let json = serde_json::to_value(&content).unwrap();
        assert_eq!(json["isError"], true);
        assert_eq!(json["content"][0]["type"], "text");

        // The flag is omitted entirely on success.
        let ok = ToolContent::text("fine");
        let json = serde_json::to_value(&ok).unwrap();
        assert!(json.get("isError").is_none());
    }
}
