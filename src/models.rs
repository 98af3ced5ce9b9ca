use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Reference to the produced file, attached to a job once it completes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobArtifact {
    pub file_path: PathBuf,
    pub size_bytes: u64,
    pub from_cache: bool,
}

/// One fetch-and-deliver unit of work. Mutated only by the worker that
/// owns it and by cancellation; everyone else reads snapshots.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: String,
    pub owner_id: String,
    pub channel_id: String,
    pub source_url: String,
    pub variant_id: String,
    pub priority: u8,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub status: JobState,
    pub error: Option<String>,
    pub result: Option<JobArtifact>,
    /// Set when the entry turns into a tombstone. The terminal status stays
    /// readable until the tombstone expires, so a slow poller never sees a
    /// finished job simply vanish.
    pub reaped_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(
        owner_id: String,
        channel_id: String,
        source_url: String,
        variant_id: String,
        priority: u8,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            owner_id,
            channel_id,
            source_url,
            variant_id,
            priority,
            created_at: now,
            updated_at: now,
            status: JobState::Pending,
            error: None,
            result: None,
            reaped_at: None,
        }
    }

    pub fn to_response(&self) -> JobStatusResponse {
        JobStatusResponse {
            job_id: self.id.clone(),
            status: self.status,
            source_url: self.source_url.clone(),
            variant_id: self.variant_id.clone(),
            priority: self.priority,
            created_at: self.created_at,
            updated_at: self.updated_at,
            error: self.error.clone(),
            artifact: self.result.as_ref().map(|artifact| ArtifactResponse {
                download_url: format!("/v1/downloads/{}/file", self.id),
                size_bytes: artifact.size_bytes,
                from_cache: artifact.from_cache,
            }),
        }
    }
}

/// Terminal outcome published by a worker onto the result channel.
#[derive(Debug, Clone)]
pub struct JobResult {
    pub job_id: String,
    pub status: JobState,
    pub artifact: Option<JobArtifact>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitRequest {
    pub source_url: String,
    pub variant_id: String,
    pub owner_id: String,
    #[serde(default)]
    pub channel_id: Option<String>,
    #[serde(default)]
    pub priority: Option<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitAcceptedResponse {
    pub job_id: String,
    pub status: JobState,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactResponse {
    pub download_url: String,
    pub size_bytes: u64,
    pub from_cache: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatusResponse {
    pub job_id: String,
    pub status: JobState,
    pub source_url: String,
    pub variant_id: String,
    pub priority: u8,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub error: Option<String>,
    pub artifact: Option<ArtifactResponse>,
}
