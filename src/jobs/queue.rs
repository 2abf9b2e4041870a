//! The in-memory job queue.
//!
//! The queue exclusively owns every [`Job`] record and the content-hash dedup
//! index; nothing else mutates a job. All methods take `&self` and serialize
//! access through one `RwLock`, so interleaved async callers cannot lose
//! updates.
//!
//! Jobs are best-effort: nothing is persisted, and a periodic sweep evicts
//! records older than the configured TTL so abandoned requests cannot grow
//! memory without bound.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use futures::future::BoxFuture;
use serde::Serialize;
use tokio::sync::RwLock;

use crate::config::JobConfig;
use crate::error::{Result, ScryError};
use crate::jobs::job::{GenerationRequest, Job, JobStatus, MapArtifact};

/// Error string recorded on jobs that were cancelled rather than failed.
const CANCELLED_ERROR: &str = "Cancelled by caller";

/// Metadata handed to the completion sink when a job finishes.
#[derive(Debug, Clone, Serialize)]
pub struct CompletionPayload {
    pub prompt: String,
    pub image_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_width: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_height: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grid_size: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub walls: Option<serde_json::Value>,
}

/// Collaborator notified when a job completes (e.g. downstream scene
/// creation). Sink failures are logged by the queue, never propagated.
pub trait CompletionSink: Send + Sync {
    fn on_job_completed(&self, job_id: String, payload: CompletionPayload)
    -> BoxFuture<'_, Result<()>>;
}

/// Aggregate queue counters and averages.
///
/// Averages are computed only over jobs that reached the relevant milestone:
/// completion time over completed jobs, queue time over started jobs.
#[derive(Debug, Clone, Serialize)]
pub struct QueueMetrics {
    pub total: usize,
    pub queued: usize,
    pub generating: usize,
    pub processing: usize,
    pub complete: usize,
    pub failed: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avg_completion_time_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avg_queue_time_ms: Option<i64>,
}

struct QueueState {
    jobs: HashMap<String, Job>,
    /// Content hash → job id of the most recent submission with that hash.
    by_hash: HashMap<String, String>,
}

/// Tracks generation jobs end-to-end: creation, dedup, progress, completion,
/// retry, cancellation, and expiry.
pub struct JobQueue {
    state: RwLock<QueueState>,
    config: JobConfig,
    sink: Option<Arc<dyn CompletionSink>>,
}

impl JobQueue {
    pub fn new(config: JobConfig) -> Self {
        Self {
            state: RwLock::new(QueueState {
                jobs: HashMap::new(),
                by_hash: HashMap::new(),
            }),
            config,
            sink: None,
        }
    }

    /// Attach the completion sink. Called once during backend wiring.
    pub fn with_sink(mut self, sink: Arc<dyn CompletionSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Submit a request. Idempotent per content hash: while an active job
    /// with the same normalized parameters exists, that job is returned
    /// unchanged instead of creating a duplicate.
    pub async fn create_job(&self, request: GenerationRequest) -> Job {
        let hash = request.content_hash();
        let mut state = self.state.write().await;

        if let Some(existing_id) = state.by_hash.get(&hash)
            && let Some(existing) = state.jobs.get(existing_id)
            && existing.is_active()
        {
            tracing::debug!(job_id = %existing.id, "Duplicate submission, returning active job");
            return existing.clone();
        }

        let job = Job::new(request, self.config.max_attempts);
        tracing::info!(job_id = %job.id, size = %job.request.size.as_str(), "Job created");
        state.by_hash.insert(hash, job.id.clone());
        state.jobs.insert(job.id.clone(), job.clone());
        job
    }

    /// Look up a job by id.
    pub async fn get_job(&self, id: &str) -> Option<Job> {
        self.state.read().await.jobs.get(id).cloned()
    }

    /// Transition a queued job to `generating` and stamp its start time.
    pub async fn mark_job_started(&self, id: &str) -> Result<()> {
        let mut state = self.state.write().await;
        let job = state.jobs.get_mut(id).ok_or_else(|| ScryError::JobNotFound(id.to_string()))?;
        if job.status.is_terminal() {
            tracing::warn!(job_id = %id, status = %job.status, "Ignoring start on terminal job");
            return Ok(());
        }
        job.status = JobStatus::Generating;
        job.started_at = Some(Utc::now());
        job.stage = "generating".to_string();
        Ok(())
    }

    /// Record a progress update. The percentage is clamped to [0, 100]
    /// whatever the input.
    pub async fn update_job_progress(&self, id: &str, percent: i64, stage: &str) -> Result<()> {
        let mut state = self.state.write().await;
        let job = state.jobs.get_mut(id).ok_or_else(|| ScryError::JobNotFound(id.to_string()))?;
        if job.status.is_terminal() {
            tracing::warn!(job_id = %id, status = %job.status, "Ignoring progress on terminal job");
            return Ok(());
        }
        job.progress_percent = percent.clamp(0, 100) as u8;
        job.stage = stage.to_string();
        if job.status == JobStatus::Queued {
            job.status = JobStatus::Generating;
        }
        Ok(())
    }

    /// Mark a job `processing` (generation done, post-processing underway).
    pub async fn mark_job_processing(&self, id: &str, stage: &str) -> Result<()> {
        let mut state = self.state.write().await;
        let job = state.jobs.get_mut(id).ok_or_else(|| ScryError::JobNotFound(id.to_string()))?;
        if job.status.is_terminal() {
            return Ok(());
        }
        job.status = JobStatus::Processing;
        job.stage = stage.to_string();
        Ok(())
    }

    /// Complete a job with its artifact and notify the completion sink.
    ///
    /// The sink runs on its own task so completion never blocks the caller
    /// (the caller may be the gateway reader the sink wants to talk
    /// through). Sink failures are logged and never surfaced.
    pub async fn mark_job_complete(&self, id: &str, artifact: MapArtifact) -> Result<()> {
        let payload = {
            let mut state = self.state.write().await;
            let job =
                state.jobs.get_mut(id).ok_or_else(|| ScryError::JobNotFound(id.to_string()))?;
            if job.status.is_terminal() {
                tracing::warn!(job_id = %id, status = %job.status, "Ignoring completion on terminal job");
                return Ok(());
            }
            job.status = JobStatus::Complete;
            job.completed_at = Some(Utc::now());
            job.progress_percent = 100;
            job.stage = "complete".to_string();
            job.result = Some(artifact.clone());
            job.error = None;

            CompletionPayload {
                prompt: job.request.prompt.clone(),
                image_path: artifact.image_path,
                image_width: artifact.image_width,
                image_height: artifact.image_height,
                grid_size: artifact.grid_size,
                walls: artifact.walls,
            }
        };

        tracing::info!(job_id = %id, "Job complete");

        if let Some(sink) = &self.sink {
            let sink = Arc::clone(sink);
            let job_id = id.to_string();
            tokio::spawn(async move {
                if let Err(e) = sink.on_job_completed(job_id.clone(), payload).await {
                    tracing::warn!(job_id = %job_id, error = %e, "Completion sink failed");
                }
            });
        }
        Ok(())
    }

    /// Record a failed attempt. Below the attempt ceiling the job returns to
    /// `queued` for an implicit retry; at the ceiling it becomes terminally
    /// `failed` with the error preserved.
    pub async fn mark_job_failed(&self, id: &str, error: &str) -> Result<()> {
        let mut state = self.state.write().await;
        let job = state.jobs.get_mut(id).ok_or_else(|| ScryError::JobNotFound(id.to_string()))?;
        if job.status.is_terminal() {
            tracing::warn!(job_id = %id, status = %job.status, "Ignoring failure on terminal job");
            return Ok(());
        }

        job.attempts += 1;
        if job.attempts < job.max_attempts {
            tracing::info!(
                job_id = %id,
                attempt = job.attempts,
                max_attempts = job.max_attempts,
                error,
                "Attempt failed, requeueing"
            );
            job.status = JobStatus::Queued;
            job.progress_percent = 0;
            job.stage = "queued".to_string();
            job.started_at = None;
            job.error = Some(error.to_string());
        } else {
            tracing::warn!(job_id = %id, attempts = job.attempts, error, "Job failed terminally");
            job.status = JobStatus::Failed;
            job.completed_at = Some(Utc::now());
            job.stage = "failed".to_string();
            job.error = Some(error.to_string());
        }
        Ok(())
    }

    /// Cancel an active job. Returns `false` (and changes nothing) when the
    /// job is already terminal or unknown.
    pub async fn cancel_job(&self, id: &str) -> bool {
        let mut state = self.state.write().await;
        let Some(job) = state.jobs.get_mut(id) else {
            return false;
        };
        if job.status.is_terminal() {
            return false;
        }
        job.status = JobStatus::Failed;
        job.completed_at = Some(Utc::now());
        job.stage = "cancelled".to_string();
        job.error = Some(CANCELLED_ERROR.to_string());
        tracing::info!(job_id = %id, "Job cancelled");
        true
    }

    /// Current queue counters and averages.
    pub async fn queue_metrics(&self) -> QueueMetrics {
        let state = self.state.read().await;
        compute_metrics(state.jobs.values())
    }

    /// Evict jobs older than the TTL: mark them expired and remove them and
    /// their hash-index entries from the live maps. Returns the eviction
    /// count. Driven by the backend on a fixed interval.
    pub async fn sweep_expired(&self) -> usize {
        let ttl = chrono::Duration::from_std(self.config.ttl).unwrap_or(chrono::Duration::hours(1));
        let now = Utc::now();
        let mut state = self.state.write().await;

        let expired_ids: Vec<String> = state
            .jobs
            .values()
            .filter(|job| job.age(now) > ttl)
            .map(|job| job.id.clone())
            .collect();

        for id in &expired_ids {
            if let Some(mut job) = state.jobs.remove(id) {
                job.status = JobStatus::Expired;
                tracing::info!(job_id = %id, "Job expired and evicted");
                if state.by_hash.get(&job.prompt_hash) == Some(id) {
                    state.by_hash.remove(&job.prompt_hash);
                }
            }
        }
        expired_ids.len()
    }

    /// Number of live job records.
    pub async fn len(&self) -> usize {
        self.state.read().await.jobs.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.read().await.jobs.is_empty()
    }
}

/// Counters and milestone-gated averages over a set of jobs.
fn compute_metrics<'a>(jobs: impl Iterator<Item = &'a Job>) -> QueueMetrics {
    let mut metrics = QueueMetrics {
        total: 0,
        queued: 0,
        generating: 0,
        processing: 0,
        complete: 0,
        failed: 0,
        avg_completion_time_ms: None,
        avg_queue_time_ms: None,
    };

    let mut completion_ms: Vec<i64> = Vec::new();
    let mut queue_ms: Vec<i64> = Vec::new();

    for job in jobs {
        metrics.total += 1;
        match job.status {
            JobStatus::Queued => metrics.queued += 1,
            JobStatus::Generating => metrics.generating += 1,
            JobStatus::Processing => metrics.processing += 1,
            JobStatus::Complete => metrics.complete += 1,
            JobStatus::Failed => metrics.failed += 1,
            JobStatus::Expired => {}
        }

        if let (Some(started), Some(completed)) = (job.started_at, job.completed_at)
            && job.status == JobStatus::Complete
        {
            completion_ms.push((completed - started).num_milliseconds());
        }
        if let Some(started) = job.started_at {
            queue_ms.push((started - job.created_at).num_milliseconds());
        }
    }

    metrics.avg_completion_time_ms = average(&completion_ms);
    metrics.avg_queue_time_ms = average(&queue_ms);
    metrics
}

fn average(samples: &[i64]) -> Option<i64> {
    if samples.is_empty() {
        return None;
    }
    Some(samples.iter().sum::<i64>() / samples.len() as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::job::SizeTier;
    use chrono::Duration as ChronoDuration;
    use std::sync::Mutex;

    fn queue() -> JobQueue {
        JobQueue::new(JobConfig::default())
    }

    fn request(prompt: &str) -> GenerationRequest {
        GenerationRequest {
            prompt: prompt.to_string(),
            size: SizeTier::Small,
            grid_size: None,
        }
    }

    fn artifact() -> MapArtifact {
        MapArtifact {
            image_path: "maps/out.webp".to_string(),
            image_width: Some(1024),
            image_height: Some(1024),
            grid_size: Some(100),
            walls: None,
        }
    }

    #[tokio::test]
    async fn create_job_dedupes_active_submissions() {
        let queue = queue();
        let first = queue.create_job(request("  A Cave ")).await;
        let second = queue.create_job(request("a cave")).await;
        assert_eq!(first.id, second.id);
        assert_eq!(queue.len().await, 1);
    }

    #[tokio::test]
    async fn create_job_after_terminal_creates_fresh_job() {
        let queue = queue();
        let first = queue.create_job(request("ruins")).await;
        queue.mark_job_complete(&first.id, artifact()).await.unwrap();

        let second = queue.create_job(request("ruins")).await;
        assert_ne!(first.id, second.id);
        assert_eq!(second.status, JobStatus::Queued);
    }

    #[tokio::test]
    async fn progress_is_clamped() {
        let queue = queue();
        let job = queue.create_job(request("swamp")).await;

        queue.update_job_progress(&job.id, 150, "rendering").await.unwrap();
        assert_eq!(queue.get_job(&job.id).await.unwrap().progress_percent, 100);

        queue.update_job_progress(&job.id, -5, "rendering").await.unwrap();
        assert_eq!(queue.get_job(&job.id).await.unwrap().progress_percent, 0);
    }

    #[tokio::test]
    async fn progress_promotes_queued_to_generating() {
        let queue = queue();
        let job = queue.create_job(request("keep")).await;
        queue.update_job_progress(&job.id, 10, "rendering").await.unwrap();

        let job = queue.get_job(&job.id).await.unwrap();
        assert_eq!(job.status, JobStatus::Generating);
        assert_eq!(job.stage, "rendering");
    }

    #[tokio::test]
    async fn failure_requeues_until_attempt_ceiling() {
        let queue = queue(); // max_attempts = 3
        let job = queue.create_job(request("tower")).await;

        queue.mark_job_failed(&job.id, "gpu oom").await.unwrap();
        assert_eq!(queue.get_job(&job.id).await.unwrap().status, JobStatus::Queued);

        queue.mark_job_failed(&job.id, "gpu oom").await.unwrap();
        assert_eq!(queue.get_job(&job.id).await.unwrap().status, JobStatus::Queued);

        queue.mark_job_failed(&job.id, "gpu oom").await.unwrap();
        let job = queue.get_job(&job.id).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempts, 3);
        assert_eq!(job.error.as_deref(), Some("gpu oom"));
    }

    #[tokio::test]
    async fn requeued_job_resets_progress_and_stage() {
        let queue = queue();
        let job = queue.create_job(request("bridge")).await;
        queue.mark_job_started(&job.id).await.unwrap();
        queue.update_job_progress(&job.id, 80, "rendering").await.unwrap();

        queue.mark_job_failed(&job.id, "timeout").await.unwrap();
        let job = queue.get_job(&job.id).await.unwrap();
        assert_eq!(job.progress_percent, 0);
        assert_eq!(job.stage, "queued");
        assert!(job.started_at.is_none());
    }

    #[tokio::test]
    async fn cancel_rejects_terminal_jobs() {
        let queue = queue();
        let job = queue.create_job(request("harbor")).await;
        queue.mark_job_complete(&job.id, artifact()).await.unwrap();

        assert!(!queue.cancel_job(&job.id).await);
        assert_eq!(queue.get_job(&job.id).await.unwrap().status, JobStatus::Complete);
    }

    #[tokio::test]
    async fn cancel_active_job_forces_failed() {
        let queue = queue();
        let job = queue.create_job(request("mines")).await;
        queue.mark_job_started(&job.id).await.unwrap();

        assert!(queue.cancel_job(&job.id).await);
        let job = queue.get_job(&job.id).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error.as_deref(), Some(CANCELLED_ERROR));
    }

    #[tokio::test]
    async fn cancel_unknown_job_returns_false() {
        assert!(!queue().cancel_job("job-missing1").await);
    }

    #[tokio::test]
    async fn completion_notifies_sink_and_swallows_sink_errors() {
        struct RecordingSink {
            calls: Mutex<Vec<(String, String)>>,
        }

        impl CompletionSink for RecordingSink {
            fn on_job_completed(
                &self,
                job_id: String,
                payload: CompletionPayload,
            ) -> BoxFuture<'_, crate::error::Result<()>> {
                Box::pin(async move {
                    self.calls.lock().unwrap().push((job_id, payload.image_path));
                    Err(ScryError::Gateway("scene creation failed".to_string()))
                })
            }
        }

        let sink = Arc::new(RecordingSink {
            calls: Mutex::new(Vec::new()),
        });
        let queue = JobQueue::new(JobConfig::default()).with_sink(sink.clone());
        let job = queue.create_job(request("citadel")).await;

        // The sink error must not reach the caller.
        queue.mark_job_complete(&job.id, artifact()).await.unwrap();

        // The notification runs on its own task; give it a moment.
        for _ in 0..50 {
            if !sink.calls.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }

        let calls = sink.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, job.id);
        assert_eq!(calls[0].1, "maps/out.webp");
    }

    #[tokio::test]
    async fn sweep_evicts_old_jobs_and_frees_hash_index() {
        let config = JobConfig {
            ttl: std::time::Duration::from_secs(60),
            ..JobConfig::default()
        };
        let queue = JobQueue::new(config);
        let job = queue.create_job(request("forest")).await;

        // Age the record past the TTL.
        {
            let mut state = queue.state.write().await;
            state.jobs.get_mut(&job.id).unwrap().created_at =
                Utc::now() - ChronoDuration::seconds(120);
        }

        assert_eq!(queue.sweep_expired().await, 1);
        assert!(queue.get_job(&job.id).await.is_none());
        assert!(queue.is_empty().await);

        // The hash slot is free again: same request creates a new job.
        let fresh = queue.create_job(request("forest")).await;
        assert_ne!(fresh.id, job.id);
    }

    #[tokio::test]
    async fn sweep_keeps_young_jobs() {
        let queue = queue();
        queue.create_job(request("village")).await;
        assert_eq!(queue.sweep_expired().await, 0);
        assert_eq!(queue.len().await, 1);
    }

    #[test]
    fn metrics_average_completion_time() {
        let now = Utc::now();
        let mut a = Job::new(request("one"), 3);
        a.status = JobStatus::Complete;
        a.started_at = Some(now);
        a.completed_at = Some(now + ChronoDuration::milliseconds(1000));

        let mut b = Job::new(request("two"), 3);
        b.status = JobStatus::Complete;
        b.started_at = Some(now);
        b.completed_at = Some(now + ChronoDuration::milliseconds(3000));

        let metrics = compute_metrics([&a, &b].into_iter());
        assert_eq!(metrics.total, 2);
        assert_eq!(metrics.complete, 2);
        assert_eq!(metrics.avg_completion_time_ms, Some(2000));
    }

    #[test]
    fn metrics_skip_jobs_without_milestones() {
        let queued = Job::new(request("three"), 3);
        let metrics = compute_metrics([&queued].into_iter());
        assert_eq!(metrics.queued, 1);
        assert_eq!(metrics.avg_completion_time_ms, None);
        assert_eq!(metrics.avg_queue_time_ms, None);
    }
}
