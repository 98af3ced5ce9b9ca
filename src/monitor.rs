use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::{sync::RwLock, task, time};
use tracing::{info, warn};

use crate::{
    cache::CacheStore,
    identity,
    models::{Job, JobArtifact, JobState},
    queue::DownloadQueue,
};

/// The single outcome a monitor reports for one submission.
#[derive(Debug, Clone)]
pub enum DeliveryOutcome {
    Completed {
        channel_id: String,
        artifact: JobArtifact,
    },
    Failed {
        channel_id: String,
        message: String,
    },
    TimedOut {
        channel_id: String,
    },
}

/// Boundary to the messaging transport that notifies the end user.
#[async_trait]
pub trait DeliverySink: Send + Sync {
    async fn deliver(&self, job_id: &str, outcome: DeliveryOutcome);
}

/// Default sink for deployments without a transport wired in: outcomes
/// land in the log and the artifact stays available over HTTP.
pub struct LogSink;

#[async_trait]
impl DeliverySink for LogSink {
    async fn deliver(&self, job_id: &str, outcome: DeliveryOutcome) {
        match outcome {
            DeliveryOutcome::Completed {
                channel_id,
                artifact,
            } => info!(
                job_id = %job_id,
                channel_id = %channel_id,
                file_path = %artifact.file_path.display(),
                from_cache = artifact.from_cache,
                "Download ready for delivery"
            ),
            DeliveryOutcome::Failed {
                channel_id,
                message,
            } => warn!(job_id = %job_id, channel_id = %channel_id, "Download failed: {message}"),
            DeliveryOutcome::TimedOut { channel_id } => {
                warn!(job_id = %job_id, channel_id = %channel_id, "Timed out waiting for download")
            }
        }
    }
}

/// Owner id -> active job id bookkeeping, cleared by the monitor once its
/// delivery is done.
#[derive(Clone, Default)]
pub struct OwnerJobs {
    inner: Arc<RwLock<HashMap<String, String>>>,
}

impl OwnerJobs {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn track(&self, owner_id: &str, job_id: &str) {
        let mut inner = self.inner.write().await;
        inner.insert(owner_id.to_string(), job_id.to_string());
    }

    pub async fn active(&self, owner_id: &str) -> Option<String> {
        let inner = self.inner.read().await;
        inner.get(owner_id).cloned()
    }

    pub async fn clear(&self, owner_id: &str) {
        let mut inner = self.inner.write().await;
        inner.remove(owner_id);
    }
}

/// Per-submission watcher owned by the caller, not the queue. Polls the
/// job on a fixed interval until a terminal state or the overall deadline,
/// performs exactly one delivery through the sink, acknowledges the
/// terminal entry, and clears the owner bookkeeping.
pub struct StatusMonitor {
    queue: DownloadQueue,
    cache: CacheStore,
    sink: Arc<dyn DeliverySink>,
    owner_jobs: OwnerJobs,
    poll_interval: Duration,
    timeout: Duration,
}

impl StatusMonitor {
    pub fn new(
        queue: DownloadQueue,
        cache: CacheStore,
        sink: Arc<dyn DeliverySink>,
        owner_jobs: OwnerJobs,
        poll_interval: Duration,
        timeout: Duration,
    ) -> Self {
        Self {
            queue,
            cache,
            sink,
            owner_jobs,
            poll_interval,
            timeout,
        }
    }

    pub fn spawn(self, job: Job) {
        tokio::spawn(self.watch(job));
    }

    async fn watch(self, job: Job) {
        let deadline = time::Instant::now() + self.timeout;
        let mut interval = time::interval(self.poll_interval);

        let outcome = loop {
            interval.tick().await;

            if time::Instant::now() >= deadline {
                warn!(job_id = %job.id, "Gave up waiting for job");
                break DeliveryOutcome::TimedOut {
                    channel_id: job.channel_id.clone(),
                };
            }

            match self.queue.status(&job.id).await {
                Some(snapshot) if snapshot.status.is_terminal() => {
                    self.queue.acknowledge(&job.id).await;
                    break outcome_for(&snapshot);
                }
                Some(_) => continue,
                None => {
                    // The entry was already purged. A cached artifact is the
                    // usual explanation (hits finish almost instantly), so
                    // consult the store before declaring the job lost.
                    break self.vanished_outcome(&job).await;
                }
            }
        };

        self.sink.deliver(&job.id, outcome).await;
        self.owner_jobs.clear(&job.owner_id).await;
    }

    async fn vanished_outcome(&self, job: &Job) -> DeliveryOutcome {
        let identity = identity::derive(&job.source_url);
        let cache = self.cache.clone();
        let resource_id = identity.resource_id.clone();
        let variant = job.variant_id.clone();

        let cached = task::spawn_blocking(move || {
            cache.lookup(&resource_id, identity.platform, &variant)
        })
        .await;

        match cached {
            Ok(Ok(Some(entry))) => {
                info!(job_id = %job.id, "Job already reaped, served from cache fast path");
                DeliveryOutcome::Completed {
                    channel_id: job.channel_id.clone(),
                    artifact: JobArtifact {
                        size_bytes: entry.size_bytes.max(0) as u64,
                        file_path: entry.file_path,
                        from_cache: true,
                    },
                }
            }
            Ok(Ok(None)) => {
                warn!(job_id = %job.id, "Job vanished before a terminal state was observed");
                DeliveryOutcome::Failed {
                    channel_id: job.channel_id.clone(),
                    message: "job is no longer tracked".to_string(),
                }
            }
            Ok(Err(err)) => {
                warn!(job_id = %job.id, "Cache fast path failed: {err:#}");
                DeliveryOutcome::Failed {
                    channel_id: job.channel_id.clone(),
                    message: "job is no longer tracked".to_string(),
                }
            }
            Err(err) => {
                warn!(job_id = %job.id, "Cache fast path join error: {err}");
                DeliveryOutcome::Failed {
                    channel_id: job.channel_id.clone(),
                    message: "job is no longer tracked".to_string(),
                }
            }
        }
    }
}

fn outcome_for(job: &Job) -> DeliveryOutcome {
    match job.status {
        JobState::Completed => match &job.result {
            Some(artifact) => DeliveryOutcome::Completed {
                channel_id: job.channel_id.clone(),
                artifact: artifact.clone(),
            },
            None => DeliveryOutcome::Failed {
                channel_id: job.channel_id.clone(),
                message: "completed without an artifact".to_string(),
            },
        },
        JobState::Failed => DeliveryOutcome::Failed {
            channel_id: job.channel_id.clone(),
            message: job
                .error
                .clone()
                .unwrap_or_else(|| "download failed".to_string()),
        },
        JobState::Cancelled => DeliveryOutcome::Failed {
            channel_id: job.channel_id.clone(),
            message: "download was cancelled".to_string(),
        },
        // Non-terminal states never reach delivery.
        JobState::Pending | JobState::Processing => DeliveryOutcome::Failed {
            channel_id: job.channel_id.clone(),
            message: "internal state error".to_string(),
        },
    }
}
