use std::{sync::Arc, time::Duration};

use serde::Serialize;
use tokio::{
    sync::{mpsc, Mutex},
    task, time,
};
use tracing::{debug, error, info, warn};

use crate::{
    cache::{CacheEntry, CacheStore, NewCacheEntry},
    error::ServiceError,
    fetch::{FetchRequest, MediaFetcher},
    identity::{self, ResourceIdentity},
    models::{Job, JobArtifact, JobResult, JobState},
    registry::{JobRegistry, RegistryStats},
};

#[derive(Debug, Clone)]
pub struct QueueOptions {
    pub workers: usize,
    pub queue_capacity: usize,
    pub fetch_timeout: Duration,
    pub reap_grace: Duration,
    pub tombstone_ttl: Duration,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            workers: 3,
            queue_capacity: 100,
            fetch_timeout: Duration::from_secs(600),
            reap_grace: Duration::from_secs(5),
            tombstone_ttl: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub workers: usize,
    pub queue_capacity: usize,
    pub queue_free: usize,
    pub registry: RegistryStats,
}

/// Bounded download queue over a fixed pool of worker tasks.
///
/// Submission never blocks: a saturated intake fails fast with
/// `QueueFull`. Workers serve cache hits without touching the extractor,
/// register fresh artifacts before publishing success, and report every
/// outcome through one result channel drained by a single handler task.
#[derive(Clone)]
pub struct DownloadQueue {
    intake_tx: mpsc::Sender<String>,
    registry: JobRegistry,
    workers: usize,
    queue_capacity: usize,
    reap_grace: Duration,
    tombstone_ttl: Duration,
}

#[derive(Clone)]
struct WorkerContext {
    registry: JobRegistry,
    cache: CacheStore,
    fetcher: Arc<dyn MediaFetcher>,
    results_tx: mpsc::Sender<JobResult>,
    fetch_timeout: Duration,
}

impl DownloadQueue {
    /// Spawns the worker pool and the result handler, returning a cloneable
    /// handle. The queue runs until the handle (and thus the intake sender)
    /// is dropped.
    pub fn start(
        options: QueueOptions,
        registry: JobRegistry,
        cache: CacheStore,
        fetcher: Arc<dyn MediaFetcher>,
    ) -> Self {
        let (intake_tx, intake_rx) = mpsc::channel::<String>(options.queue_capacity);
        let (results_tx, results_rx) = mpsc::channel::<JobResult>(options.queue_capacity);

        let shared_rx = Arc::new(Mutex::new(intake_rx));
        for worker_id in 0..options.workers {
            let ctx = WorkerContext {
                registry: registry.clone(),
                cache: cache.clone(),
                fetcher: fetcher.clone(),
                results_tx: results_tx.clone(),
                fetch_timeout: options.fetch_timeout,
            };
            tokio::spawn(run_worker(worker_id, shared_rx.clone(), ctx));
        }

        tokio::spawn(run_result_handler(
            results_rx,
            registry.clone(),
            options.reap_grace,
            options.tombstone_ttl,
        ));

        info!(workers = options.workers, capacity = options.queue_capacity, "Download queue started");

        Self {
            intake_tx,
            registry,
            workers: options.workers,
            queue_capacity: options.queue_capacity,
            reap_grace: options.reap_grace,
            tombstone_ttl: options.tombstone_ttl,
        }
    }

    /// Enqueues a pending job and returns its snapshot without blocking.
    pub async fn submit(
        &self,
        owner_id: String,
        channel_id: String,
        source_url: String,
        variant_id: String,
        priority: u8,
    ) -> Result<Job, ServiceError> {
        let job = Job::new(owner_id, channel_id, source_url, variant_id, priority);
        let job_id = job.id.clone();
        let snapshot = job.clone();
        self.registry.insert(job).await;

        match self.intake_tx.try_send(job_id.clone()) {
            Ok(()) => {
                info!(
                    job_id = %job_id,
                    owner_id = %snapshot.owner_id,
                    priority = snapshot.priority,
                    "Job queued"
                );
                Ok(snapshot)
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.registry.remove(&job_id).await;
                warn!(job_id = %job_id, "Intake buffer full, rejecting submission");
                Err(ServiceError::QueueFull)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.registry.remove(&job_id).await;
                Err(ServiceError::QueueClosed)
            }
        }
    }

    /// Non-blocking snapshot; `None` once the tombstone has been purged
    /// (or for an id that never existed).
    pub async fn status(&self, job_id: &str) -> Option<Job> {
        self.registry.status(job_id).await
    }

    /// Advisory cancel; the entry is reaped on the usual schedule since no
    /// worker result will arrive for a job cancelled before dequeue.
    pub async fn cancel(&self, job_id: &str) -> Result<Job, ServiceError> {
        let job = self.registry.cancel(job_id).await?;
        schedule_reap(
            self.registry.clone(),
            job_id.to_string(),
            self.reap_grace,
            self.tombstone_ttl,
        );
        Ok(job)
    }

    /// Called by a poller that has consumed a terminal state: the entry
    /// becomes a tombstone right away instead of waiting out the grace
    /// period.
    pub async fn acknowledge(&self, job_id: &str) {
        self.registry.reap(job_id).await;
    }

    pub fn registry(&self) -> &JobRegistry {
        &self.registry
    }

    pub async fn stats(&self) -> QueueStats {
        QueueStats {
            workers: self.workers,
            queue_capacity: self.queue_capacity,
            queue_free: self.intake_tx.capacity(),
            registry: self.registry.stats().await,
        }
    }
}

async fn run_worker(
    worker_id: usize,
    intake: Arc<Mutex<mpsc::Receiver<String>>>,
    ctx: WorkerContext,
) {
    info!(worker_id, "Download worker started");
    loop {
        // Hold the lock only for the dequeue itself.
        let job_id = { intake.lock().await.recv().await };
        let Some(job_id) = job_id else {
            info!(worker_id, "Intake closed, worker stopping");
            return;
        };

        let Some(job) = ctx.registry.begin_processing(&job_id).await else {
            continue;
        };

        info!(
            worker_id,
            job_id = %job_id,
            source_url = %job.source_url,
            variant_id = %job.variant_id,
            "Worker picked job"
        );

        let result = process_job(worker_id, &job, &ctx).await;
        if ctx.results_tx.send(result).await.is_err() {
            warn!(worker_id, job_id = %job_id, "Result channel closed, dropping outcome");
            return;
        }
    }
}

async fn process_job(worker_id: usize, job: &Job, ctx: &WorkerContext) -> JobResult {
    let identity = identity::derive(&job.source_url);

    if let Some(entry) = cached_artifact(ctx, &identity, &job.variant_id).await {
        record_hit(ctx, &identity, &job.variant_id).await;
        info!(worker_id, job_id = %job.id, "Cache hit, serving cached artifact");
        return JobResult {
            job_id: job.id.clone(),
            status: JobState::Completed,
            artifact: Some(JobArtifact {
                file_path: entry.file_path,
                size_bytes: entry.size_bytes.max(0) as u64,
                from_cache: true,
            }),
            error: None,
        };
    }

    let request = FetchRequest {
        source_url: job.source_url.clone(),
        variant_id: job.variant_id.clone(),
        resource_id: identity.resource_id.clone(),
        platform: identity.platform,
    };

    // The deadline is owned by the worker so a hung extractor cannot pin
    // a worker slot forever.
    let media = match time::timeout(ctx.fetch_timeout, ctx.fetcher.fetch(&request)).await {
        Ok(Ok(media)) => media,
        Ok(Err(err)) => {
            let reason = ServiceError::FetchFailed(format!("{err:#}")).to_string();
            error!(worker_id, job_id = %job.id, "Fetch failed: {reason}");
            return failure(job, reason);
        }
        Err(_) => {
            let reason = ServiceError::FetchTimeout(ctx.fetch_timeout.as_secs()).to_string();
            error!(worker_id, job_id = %job.id, "{reason}");
            return failure(job, reason);
        }
    };

    let entry = NewCacheEntry {
        resource_id: identity.resource_id,
        platform: identity.platform,
        variant_id: job.variant_id.clone(),
        source_url: job.source_url.clone(),
        title: media.title.unwrap_or_else(|| job.source_url.clone()),
        resolution: media.resolution.unwrap_or_else(|| job.variant_id.clone()),
        file_path: media.file_path.clone(),
        size_bytes: media.size_bytes as i64,
    };
    let cache = ctx.cache.clone();
    match task::spawn_blocking(move || cache.insert(entry)).await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => warn!(job_id = %job.id, "Could not register artifact in cache: {err:#}"),
        Err(err) => warn!(job_id = %job.id, "Cache insert task join error: {err}"),
    }

    info!(
        worker_id,
        job_id = %job.id,
        file_path = %media.file_path.display(),
        size_bytes = media.size_bytes,
        "Download finished"
    );

    JobResult {
        job_id: job.id.clone(),
        status: JobState::Completed,
        artifact: Some(JobArtifact {
            file_path: media.file_path,
            size_bytes: media.size_bytes,
            from_cache: false,
        }),
        error: None,
    }
}

/// Index or file problems degrade to a miss; re-fetching beats failing
/// the job over cache state.
async fn cached_artifact(
    ctx: &WorkerContext,
    identity: &ResourceIdentity,
    variant_id: &str,
) -> Option<CacheEntry> {
    let cache = ctx.cache.clone();
    let resource_id = identity.resource_id.clone();
    let platform = identity.platform;
    let variant = variant_id.to_string();

    match task::spawn_blocking(move || cache.lookup(&resource_id, platform, &variant)).await {
        Ok(Ok(entry)) => entry,
        Ok(Err(err)) => {
            warn!("Cache lookup failed, treating as miss: {err:#}");
            None
        }
        Err(err) => {
            warn!("Cache lookup task join error: {err}");
            None
        }
    }
}

async fn record_hit(ctx: &WorkerContext, identity: &ResourceIdentity, variant_id: &str) {
    let cache = ctx.cache.clone();
    let resource_id = identity.resource_id.clone();
    let platform = identity.platform;
    let variant = variant_id.to_string();

    match task::spawn_blocking(move || cache.increment_hit(&resource_id, platform, &variant)).await
    {
        Ok(Ok(())) => {}
        Ok(Err(err)) => warn!("Could not record cache hit: {err:#}"),
        Err(err) => warn!("Cache hit task join error: {err}"),
    }
}

fn failure(job: &Job, reason: String) -> JobResult {
    JobResult {
        job_id: job.id.clone(),
        status: JobState::Failed,
        artifact: None,
        error: Some(reason),
    }
}

async fn run_result_handler(
    mut results_rx: mpsc::Receiver<JobResult>,
    registry: JobRegistry,
    reap_grace: Duration,
    tombstone_ttl: Duration,
) {
    info!("Result handler started");
    while let Some(result) = results_rx.recv().await {
        debug!(job_id = %result.job_id, status = result.status.as_str(), "Result received");
        if registry.apply_result(&result).await {
            schedule_reap(registry.clone(), result.job_id, reap_grace, tombstone_ttl);
        }
    }
    info!("Result channel closed, handler stopping");
}

/// Grace period first (one last read for slow pollers), tombstone next,
/// full removal once the tombstone has expired.
fn schedule_reap(registry: JobRegistry, job_id: String, grace: Duration, ttl: Duration) {
    tokio::spawn(async move {
        time::sleep(grace).await;
        registry.reap(&job_id).await;
        time::sleep(ttl).await;
        registry.purge(&job_id).await;
    });
}
