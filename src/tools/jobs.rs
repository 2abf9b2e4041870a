//! Built-in job-orchestration tools.
//!
//! These are the tools the backend itself owns: submitting, inspecting, and
//! cancelling generation jobs, plus queue metrics. Tabletop content tools
//! (actors, journals, and so on) are registered by their own modules through
//! the same registry seam.

use std::sync::Arc;

use futures::future::BoxFuture;
use serde::Deserialize;
use serde_json::{Value, json};

use crate::error::{Result, ScryError};
use crate::jobs::JobQueue;
use crate::tools::{ToolDescriptor, ToolHandler, ToolName, ToolRegistry};

/// Build the registry with every built-in tool wired to `queue`, validated.
pub fn job_tool_registry(queue: Arc<JobQueue>) -> Result<ToolRegistry> {
    let mut registry = ToolRegistry::new();
    registry.register(ToolName::GenerateMap, Arc::new(GenerateMapTool { queue: queue.clone() }));
    registry.register(ToolName::JobStatus, Arc::new(JobStatusTool { queue: queue.clone() }));
    registry.register(ToolName::CancelJob, Arc::new(CancelJobTool { queue: queue.clone() }));
    registry.register(ToolName::QueueMetrics, Arc::new(QueueMetricsTool { queue }));
    registry.validate()?;
    Ok(registry)
}

fn parse_args<T: for<'de> Deserialize<'de>>(args: Value) -> Result<T> {
    serde_json::from_value(args).map_err(|e| ScryError::InvalidArgument(e.to_string()))
}

/// Submit a map-generation job. Idempotent per normalized prompt/size/grid.
struct GenerateMapTool {
    queue: Arc<JobQueue>,
}

impl ToolHandler for GenerateMapTool {
    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor {
            name: ToolName::GenerateMap.as_str().to_string(),
            description: "Queue asynchronous generation of a battle map image".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "prompt": {
                        "type": "string",
                        "description": "Scene description for the generator",
                    },
                    "size": {
                        "type": "string",
                        "enum": ["small", "medium", "large"],
                        "default": "medium",
                    },
                    "grid_size": {
                        "type": "integer",
                        "description": "Pixels per grid square",
                    },
                },
                "required": ["prompt"],
            }),
        }
    }

    fn call(&self, args: Value) -> BoxFuture<'_, Result<Value>> {
        Box::pin(async move {
            let request: crate::jobs::GenerationRequest = parse_args(args)?;
            if request.prompt.trim().is_empty() {
                return Err(ScryError::InvalidArgument("prompt must not be empty".to_string()));
            }
            let job = self.queue.create_job(request).await;
            Ok(json!({
                "job_id": job.id,
                "status": job.status,
                "estimated_duration_ms": job.estimated_duration_ms,
            }))
        })
    }
}

#[derive(Deserialize)]
struct JobIdArgs {
    job_id: String,
}

/// Report the full state of one job.
struct JobStatusTool {
    queue: Arc<JobQueue>,
}

impl ToolHandler for JobStatusTool {
    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor {
            name: ToolName::JobStatus.as_str().to_string(),
            description: "Check the status of a generation job".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "job_id": {"type": "string"},
                },
                "required": ["job_id"],
            }),
        }
    }

    fn call(&self, args: Value) -> BoxFuture<'_, Result<Value>> {
        Box::pin(async move {
            let args: JobIdArgs = parse_args(args)?;
            let job = self
                .queue
                .get_job(&args.job_id)
                .await
                .ok_or(ScryError::JobNotFound(args.job_id))?;
            Ok(serde_json::to_value(&job)?)
        })
    }
}

/// Cancel an active job.
struct CancelJobTool {
    queue: Arc<JobQueue>,
}

impl ToolHandler for CancelJobTool {
    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor {
            name: ToolName::CancelJob.as_str().to_string(),
            description: "Cancel a queued or running generation job".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "job_id": {"type": "string"},
                },
                "required": ["job_id"],
            }),
        }
    }

    fn call(&self, args: Value) -> BoxFuture<'_, Result<Value>> {
        Box::pin(async move {
            let args: JobIdArgs = parse_args(args)?;
            let cancelled = self.queue.cancel_job(&args.job_id).await;
            Ok(json!({"job_id": args.job_id, "cancelled": cancelled}))
        })
    }
}

/// Queue counters and averages.
struct QueueMetricsTool {
    queue: Arc<JobQueue>,
}

impl ToolHandler for QueueMetricsTool {
    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor {
            name: ToolName::QueueMetrics.as_str().to_string(),
            description: "Report generation queue totals and averages".to_string(),
            input_schema: json!({"type": "object", "properties": {}}),
        }
    }

    fn call(&self, _args: Value) -> BoxFuture<'_, Result<Value>> {
        Box::pin(async move {
            let metrics = self.queue.queue_metrics().await;
            Ok(serde_json::to_value(&metrics)?)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::JobConfig;
    use crate::tools::ContentBlock;

    fn registry() -> ToolRegistry {
        let queue = Arc::new(JobQueue::new(JobConfig::default()));
        job_tool_registry(queue).unwrap()
    }

    fn text_of(content: &crate::tools::ToolContent) -> &str {
        let ContentBlock::Text { text } = &content.content[0];
        text
    }

    #[test]
    fn registry_is_complete() {
        let registry = registry();
        let catalogue = registry.list_tools();
        assert_eq!(catalogue.len(), ToolName::ALL.len());
        assert_eq!(catalogue[0].name, "generate-map");
    }

    #[tokio::test]
    async fn generate_map_submits_and_dedupes() {
        let registry = registry();

        let first = registry
            .call_tool("generate-map", json!({"prompt": "a dark forest"}))
            .await;
        assert!(!first.is_error);
        let first_json: Value = serde_json::from_str(text_of(&first)).unwrap();
        assert_eq!(first_json["status"], "queued");

        // Identical submission returns the same job id.
        let second = registry
            .call_tool("generate-map", json!({"prompt": "  A Dark Forest "}))
            .await;
        let second_json: Value = serde_json::from_str(text_of(&second)).unwrap();
        assert_eq!(first_json["job_id"], second_json["job_id"]);
    }

    #[tokio::test]
    async fn generate_map_rejects_empty_prompt() {
        let registry = registry();
        let content = registry.call_tool("generate-map", json!({"prompt": "   "})).await;
        assert!(content.is_error);
    }

    #[tokio::test]
    async fn job_status_unknown_id_is_error_content() {
        let registry = registry();
        let content = registry
            .call_tool("job-status", json!({"job_id": "job-missing1"}))
            .await;
        assert!(content.is_error);
        assert!(text_of(&content).contains("job-missing1"));
    }

    #[tokio::test]
    async fn cancel_job_roundtrip() {
        let queue = Arc::new(JobQueue::new(JobConfig::default()));
        let registry = job_tool_registry(queue.clone()).unwrap();

        let job = queue
            .create_job(crate::jobs::GenerationRequest {
                prompt: "crypt".to_string(),
                size: Default::default(),
                grid_size: None,
            })
            .await;

        let content = registry.call_tool("cancel-job", json!({"job_id": job.id})).await;
        assert!(!content.is_error);
        let parsed: Value = serde_json::from_str(text_of(&content)).unwrap();
        assert_eq!(parsed["cancelled"], true);

        // Second cancel is rejected: the job is already terminal.
        let content = registry.call_tool("cancel-job", json!({"job_id": job.id})).await;
        let parsed: Value = serde_json::from_str(text_of(&content)).unwrap();
        assert_eq!(parsed["cancelled"], false);
    }

    #[tokio::test]
    async fn queue_metrics_reports_totals() {
        let queue = Arc::new(JobQueue::new(JobConfig::default()));
        let registry = job_tool_registry(queue.clone()).unwrap();

        queue
            .create_job(crate::jobs::GenerationRequest {
                prompt: "keep".to_string(),
                size: Default::default(),
                grid_size: None,
            })
            .await;

        let content = registry.call_tool("queue-metrics", Value::Null).await;
        assert!(!content.is_error);
        let parsed: Value = serde_json::from_str(text_of(&content)).unwrap();
        assert_eq!(parsed["total"], 1);
        assert_eq!(parsed["queued"], 1);
    }
}
