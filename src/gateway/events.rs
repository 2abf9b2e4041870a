//! Routing between gateway traffic and the job queue.
//!
//! The tabletop module pushes unsolicited job events (`job-started`,
//! `job-progress`, `job-complete`, `job-failed`) over the gateway;
//! [`JobEventRouter`] turns them into queue transitions. In the other
//! direction, [`SceneCompletionSink`] forwards a finished job's artifact to
//! the module so it can build a scene from the generated map.

use std::sync::Arc;

use futures::future::BoxFuture;
use serde::Deserialize;
use serde_json::Value;

use crate::error::Result;
use crate::gateway::connector::{Connector, EventHandler};
use crate::gateway::message::Envelope;
use crate::jobs::{CompletionPayload, CompletionSink, JobQueue, MapArtifact};

pub const EVENT_JOB_STARTED: &str = "job-started";
pub const EVENT_JOB_PROGRESS: &str = "job-progress";
pub const EVENT_JOB_PROCESSING: &str = "job-processing";
pub const EVENT_JOB_COMPLETE: &str = "job-complete";
pub const EVENT_JOB_FAILED: &str = "job-failed";

/// Gateway query method used to create a scene from a completed map.
pub const METHOD_CREATE_SCENE: &str = "create-map-scene";

#[derive(Debug, Deserialize)]
struct StartedEvent {
    job_id: String,
}

#[derive(Debug, Deserialize)]
struct ProgressEvent {
    job_id: String,
    percent: i64,
    #[serde(default)]
    stage: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProcessingEvent {
    job_id: String,
    #[serde(default)]
    stage: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CompleteEvent {
    job_id: String,
    #[serde(flatten)]
    artifact: MapArtifact,
}

#[derive(Debug, Deserialize)]
struct FailedEvent {
    job_id: String,
    #[serde(default)]
    error: Option<String>,
}

/// Applies pushed job events to the queue. Malformed payloads are logged and
/// dropped; they never disturb the connection.
pub struct JobEventRouter {
    queue: Arc<JobQueue>,
}

impl JobEventRouter {
    pub fn new(queue: Arc<JobQueue>) -> Self {
        Self { queue }
    }

    async fn route(&self, envelope: Envelope) {
        let kind = envelope.kind.as_str();
        let outcome = match kind {
            EVENT_JOB_STARTED => match parse::<StartedEvent>(envelope.data) {
                Some(event) => self.queue.mark_job_started(&event.job_id).await,
                None => return,
            },
            EVENT_JOB_PROGRESS => match parse::<ProgressEvent>(envelope.data) {
                Some(event) => {
                    let stage = event.stage.as_deref().unwrap_or("generating");
                    self.queue.update_job_progress(&event.job_id, event.percent, stage).await
                }
                None => return,
            },
            EVENT_JOB_PROCESSING => match parse::<ProcessingEvent>(envelope.data) {
                Some(event) => {
                    let stage = event.stage.as_deref().unwrap_or("processing");
                    self.queue.mark_job_processing(&event.job_id, stage).await
                }
                None => return,
            },
            EVENT_JOB_COMPLETE => match parse::<CompleteEvent>(envelope.data) {
                Some(event) => self.queue.mark_job_complete(&event.job_id, event.artifact).await,
                None => return,
            },
            EVENT_JOB_FAILED => match parse::<FailedEvent>(envelope.data) {
                Some(event) => {
                    let error = event.error.as_deref().unwrap_or("generation failed");
                    self.queue.mark_job_failed(&event.job_id, error).await
                }
                None => return,
            },
            other => {
                tracing::debug!(kind = other, "Dropping unrecognized gateway event");
                return;
            }
        };

        if let Err(e) = outcome {
            tracing::warn!(kind, error = %e, "Job event did not apply");
        }
    }
}

impl EventHandler for JobEventRouter {
    fn on_event(&self, envelope: Envelope) -> BoxFuture<'_, ()> {
        Box::pin(self.route(envelope))
    }
}

fn parse<T: for<'de> Deserialize<'de>>(data: Value) -> Option<T> {
    match serde_json::from_value(data) {
        Ok(event) => Some(event),
        Err(e) => {
            tracing::warn!(error = %e, "Dropping malformed job event payload");
            None
        }
    }
}

/// Completion sink that asks the tabletop module to build a scene from the
/// finished map. Failures propagate to the queue, which logs and swallows
/// them: scene creation is best-effort.
pub struct SceneCompletionSink {
    connector: Arc<Connector>,
}

impl SceneCompletionSink {
    pub fn new(connector: Arc<Connector>) -> Self {
        Self { connector }
    }
}

impl CompletionSink for SceneCompletionSink {
    fn on_job_completed(
        &self,
        job_id: String,
        payload: CompletionPayload,
    ) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let mut data = serde_json::to_value(&payload)?;
            if let Some(object) = data.as_object_mut() {
                object.insert("job_id".to_string(), Value::String(job_id));
            }
            self.connector.query(METHOD_CREATE_SCENE, data).await?;
            Ok(())
        })
    }
}
