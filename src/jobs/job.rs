//! Job records for asynchronous map generation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Alphabet for job id suffixes: lowercase alphanumerics, no lookalikes.
const ID_ALPHABET: [char; 31] = [
    '2', '3', '4', '5', '6', '7', '8', '9', 'a', 'b', 'c', 'd', 'e', 'f', 'g', 'h', 'j', 'k', 'm',
    'n', 'p', 'q', 'r', 's', 't', 'u', 'v', 'w', 'x', 'y', 'z',
];

/// Generate a job id of the form `job-<8 chars>`.
pub fn generate_job_id() -> String {
    format!("job-{}", nanoid::nanoid!(8, &ID_ALPHABET))
}

/// Lifecycle states of a generation job.
///
/// Transitions are monotonic except the retry path: a failed attempt below
/// the attempt ceiling returns the job to `Queued`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Queued,
    Generating,
    Processing,
    Complete,
    Failed,
    Expired,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Generating => "generating",
            Self::Processing => "processing",
            Self::Complete => "complete",
            Self::Failed => "failed",
            Self::Expired => "expired",
        }
    }

    /// Terminal states accept no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed | Self::Expired)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Output size tier. Drives the duration estimate shown to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SizeTier {
    Small,
    #[default]
    Medium,
    Large,
}

impl SizeTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Small => "small",
            Self::Medium => "medium",
            Self::Large => "large",
        }
    }

    /// Rough wall-clock estimate for a generation at this tier.
    pub fn estimated_duration_ms(&self) -> u64 {
        match self {
            Self::Small => 15_000,
            Self::Medium => 30_000,
            Self::Large => 60_000,
        }
    }
}

impl std::str::FromStr for SizeTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "small" => Ok(Self::Small),
            "medium" => Ok(Self::Medium),
            "large" => Ok(Self::Large),
            other => Err(format!("unknown size tier: {other:?}")),
        }
    }
}

/// Parameters of a map-generation request, as submitted over the control
/// channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub prompt: String,
    #[serde(default)]
    pub size: SizeTier,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grid_size: Option<u32>,
}

impl GenerationRequest {
    /// Content hash over the normalized parameters. Two requests that differ
    /// only in prompt whitespace or letter case hash identically, which is
    /// what drives submission dedup.
    pub fn content_hash(&self) -> String {
        let normalized = format!(
            "{}|{}|{}",
            self.prompt.trim().to_lowercase(),
            self.size.as_str(),
            self.grid_size.map_or_else(|| "-".to_string(), |g| g.to_string()),
        );
        let digest = Sha256::digest(normalized.as_bytes());
        hex::encode(digest)
    }
}

/// Result artifact reported by the downstream generator on completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MapArtifact {
    pub image_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_width: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_height: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grid_size: Option<u32>,
    /// Wall geometry passed through untouched.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub walls: Option<Value>,
}

/// One tracked unit of asynchronous generation work.
#[derive(Debug, Clone, Serialize)]
pub struct Job {
    /// Unique identifier: `job-<8 chars>`.
    pub id: String,
    /// Content hash of the normalized request; key of the dedup index.
    pub prompt_hash: String,
    /// The request as submitted.
    pub request: GenerationRequest,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Always within [0, 100].
    pub progress_percent: u8,
    /// Human-readable stage label, e.g. "queued", "rendering".
    pub stage: String,
    /// Failed attempts so far.
    pub attempts: u32,
    pub max_attempts: u32,
    pub estimated_duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<MapArtifact>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Job {
    pub fn new(request: GenerationRequest, max_attempts: u32) -> Self {
        let prompt_hash = request.content_hash();
        let estimated_duration_ms = request.size.estimated_duration_ms();
        Self {
            id: generate_job_id(),
            prompt_hash,
            request,
            status: JobStatus::Queued,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            progress_percent: 0,
            stage: "queued".to_string(),
            attempts: 0,
            max_attempts,
            estimated_duration_ms,
            result: None,
            error: None,
        }
    }

    pub fn is_active(&self) -> bool {
        !self.status.is_terminal()
    }

    /// Age of the job record.
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.created_at
    }
}
