//! In-memory tracking for asynchronous map-generation jobs.
//!
//! - [`job`]: the `Job` record, status machine, and request hashing
//! - [`queue`]: the queue owning all job state (dedup, retry, TTL sweep)

pub mod job;
pub mod queue;

pub use job::{GenerationRequest, Job, JobStatus, MapArtifact, SizeTier};
pub use queue::{CompletionPayload, CompletionSink, JobQueue, QueueMetrics};
