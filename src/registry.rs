use std::{collections::HashMap, sync::Arc};

use chrono::Utc;
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::{
    error::ServiceError,
    models::{Job, JobResult, JobState},
};

/// Concurrent map of job id to job state. Writers are the queue (submit,
/// worker pickup, result handling) and cancellation; any number of
/// pollers read snapshots. Terminal entries linger as tombstones until
/// purged, so `status` keeps answering with the last known terminal
/// state instead of an ambiguous "not found".
#[derive(Clone, Default)]
pub struct JobRegistry {
    jobs: Arc<RwLock<HashMap<String, Job>>>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryStats {
    pub live: usize,
    pub tombstones: usize,
    pub by_status: HashMap<String, usize>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, job: Job) {
        let mut jobs = self.jobs.write().await;
        jobs.insert(job.id.clone(), job);
    }

    pub async fn remove(&self, job_id: &str) -> Option<Job> {
        let mut jobs = self.jobs.write().await;
        jobs.remove(job_id)
    }

    /// Read-only snapshot, tombstones included.
    pub async fn status(&self, job_id: &str) -> Option<Job> {
        let jobs = self.jobs.read().await;
        jobs.get(job_id).cloned()
    }

    /// Claims a dequeued job for a worker. Returns None when the job is
    /// gone or was cancelled while still queued; the worker discards it.
    pub async fn begin_processing(&self, job_id: &str) -> Option<Job> {
        let mut jobs = self.jobs.write().await;
        let job = jobs.get_mut(job_id)?;

        if job.status == JobState::Cancelled {
            debug!(job_id = %job_id, "Skipping cancelled job at dequeue");
            return None;
        }

        job.status = JobState::Processing;
        job.updated_at = Utc::now();
        Some(job.clone())
    }

    /// Advisory cancellation: a job that has not reached a terminal state
    /// is marked `Cancelled`. In-flight fetches are not interrupted; their
    /// results are discarded by `apply_result`.
    pub async fn cancel(&self, job_id: &str) -> Result<Job, ServiceError> {
        let mut jobs = self.jobs.write().await;
        let job = jobs.get_mut(job_id).ok_or(ServiceError::JobNotFound)?;

        if job.status.is_terminal() {
            return Err(ServiceError::AlreadyTerminal);
        }

        job.status = JobState::Cancelled;
        job.updated_at = Utc::now();
        info!(job_id = %job_id, "Job cancelled");
        Ok(job.clone())
    }

    /// Applies a worker's terminal result. A job cancelled mid-flight
    /// keeps its `Cancelled` status and the late result is dropped.
    pub async fn apply_result(&self, result: &JobResult) -> bool {
        let mut jobs = self.jobs.write().await;
        let Some(job) = jobs.get_mut(&result.job_id) else {
            warn!(job_id = %result.job_id, "Result arrived for unknown job");
            return false;
        };

        if job.status == JobState::Cancelled {
            info!(job_id = %result.job_id, "Discarding result of cancelled job");
            return true;
        }

        job.status = result.status;
        job.result = result.artifact.clone();
        job.error = result.error.clone();
        job.updated_at = Utc::now();
        debug!(job_id = %result.job_id, status = result.status.as_str(), "Job reached terminal state");
        true
    }

    /// Turns a terminal entry into a tombstone. Called by the poller that
    /// consumed the outcome (immediate) and by the delayed reaper (the
    /// fallback for jobs nobody is watching). Idempotent.
    pub async fn reap(&self, job_id: &str) {
        let mut jobs = self.jobs.write().await;
        let Some(job) = jobs.get_mut(job_id) else {
            return;
        };
        if !job.status.is_terminal() || job.reaped_at.is_some() {
            return;
        }
        job.reaped_at = Some(Utc::now());
        debug!(job_id = %job_id, "Job reaped to tombstone");
    }

    /// Drops an entry once its tombstone has served its purpose.
    pub async fn purge(&self, job_id: &str) {
        let mut jobs = self.jobs.write().await;
        if jobs.get(job_id).is_some_and(|job| job.reaped_at.is_some()) {
            jobs.remove(job_id);
            debug!(job_id = %job_id, "Tombstone purged");
        }
    }

    /// Live (not yet reaped) jobs belonging to one owner.
    pub async fn jobs_for_owner(&self, owner_id: &str) -> Vec<Job> {
        let jobs = self.jobs.read().await;
        jobs.values()
            .filter(|job| job.owner_id == owner_id && job.reaped_at.is_none())
            .cloned()
            .collect()
    }

    pub async fn stats(&self) -> RegistryStats {
        let jobs = self.jobs.read().await;
        let mut by_status: HashMap<String, usize> = HashMap::new();
        let mut tombstones = 0;
        for job in jobs.values() {
            if job.reaped_at.is_some() {
                tombstones += 1;
                continue;
            }
            *by_status.entry(job.status.as_str().to_string()).or_default() += 1;
        }
        RegistryStats {
            live: jobs.len() - tombstones,
            tombstones,
            by_status,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::JobRegistry;
    use crate::{
        error::ServiceError,
        models::{Job, JobArtifact, JobResult, JobState},
    };
    use std::path::PathBuf;

    fn job(owner: &str) -> Job {
        Job::new(
            owner.to_string(),
            owner.to_string(),
            "https://youtube.com/watch?v=dQw4w9WgXcQ".to_string(),
            "137".to_string(),
            5,
        )
    }

    fn completed(job_id: &str) -> JobResult {
        JobResult {
            job_id: job_id.to_string(),
            status: JobState::Completed,
            artifact: Some(JobArtifact {
                file_path: PathBuf::from("/tmp/out.mp4"),
                size_bytes: 42,
                from_cache: false,
            }),
            error: None,
        }
    }

    #[tokio::test]
    async fn pickup_marks_processing_and_skips_cancelled() {
        let registry = JobRegistry::new();
        let j = job("alice");
        let id = j.id.clone();
        registry.insert(j).await;

        let claimed = registry.begin_processing(&id).await.expect("claimable");
        assert_eq!(claimed.status, JobState::Processing);

        let cancelled = job("bob");
        let cancelled_id = cancelled.id.clone();
        registry.insert(cancelled).await;
        registry.cancel(&cancelled_id).await.unwrap();
        assert!(registry.begin_processing(&cancelled_id).await.is_none());
    }

    #[tokio::test]
    async fn cancel_rejects_terminal_and_unknown_jobs() {
        let registry = JobRegistry::new();
        let j = job("alice");
        let id = j.id.clone();
        registry.insert(j).await;
        registry.begin_processing(&id).await.unwrap();
        registry.apply_result(&completed(&id)).await;

        assert!(matches!(
            registry.cancel(&id).await,
            Err(ServiceError::AlreadyTerminal)
        ));
        assert!(matches!(
            registry.cancel("missing").await,
            Err(ServiceError::JobNotFound)
        ));
    }

    #[tokio::test]
    async fn late_result_of_cancelled_job_is_discarded() {
        let registry = JobRegistry::new();
        let j = job("alice");
        let id = j.id.clone();
        registry.insert(j).await;
        registry.begin_processing(&id).await.unwrap();
        registry.cancel(&id).await.unwrap();

        assert!(registry.apply_result(&completed(&id)).await);
        let snapshot = registry.status(&id).await.unwrap();
        assert_eq!(snapshot.status, JobState::Cancelled);
        assert!(snapshot.result.is_none());
    }

    #[tokio::test]
    async fn tombstone_keeps_terminal_status_until_purged() {
        let registry = JobRegistry::new();
        let j = job("alice");
        let id = j.id.clone();
        registry.insert(j).await;
        registry.begin_processing(&id).await.unwrap();
        registry.apply_result(&completed(&id)).await;

        registry.reap(&id).await;
        let tombstone = registry.status(&id).await.expect("tombstone readable");
        assert_eq!(tombstone.status, JobState::Completed);
        assert!(tombstone.reaped_at.is_some());

        registry.purge(&id).await;
        assert!(registry.status(&id).await.is_none());
    }

    #[tokio::test]
    async fn reap_ignores_non_terminal_jobs() {
        let registry = JobRegistry::new();
        let j = job("alice");
        let id = j.id.clone();
        registry.insert(j).await;

        registry.reap(&id).await;
        assert!(registry.status(&id).await.unwrap().reaped_at.is_none());
        // Purge without a tombstone is a no-op as well.
        registry.purge(&id).await;
        assert!(registry.status(&id).await.is_some());
    }

    #[tokio::test]
    async fn owner_listing_excludes_tombstones() {
        let registry = JobRegistry::new();
        let first = job("alice");
        let first_id = first.id.clone();
        registry.insert(first).await;
        registry.insert(job("alice")).await;
        registry.insert(job("carol")).await;

        registry.begin_processing(&first_id).await.unwrap();
        registry.apply_result(&completed(&first_id)).await;
        registry.reap(&first_id).await;

        let alice_jobs = registry.jobs_for_owner("alice").await;
        assert_eq!(alice_jobs.len(), 1);

        let stats = registry.stats().await;
        assert_eq!(stats.live, 2);
        assert_eq!(stats.tombstones, 1);
    }
}
