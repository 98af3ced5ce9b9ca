mod api;
mod artifact_store;
mod auth;
mod cache;
mod config;
mod error;
mod fetch;
mod identity;
mod models;
mod monitor;
mod queue;
mod registry;

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    routing::{get, post},
    Router,
};
use config::Config;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{info, warn};

use crate::{
    cache::CacheStore,
    fetch::YtDlpFetcher,
    monitor::{DeliverySink, LogSink, OwnerJobs},
    queue::{DownloadQueue, QueueOptions},
    registry::JobRegistry,
};

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub queue: DownloadQueue,
    pub cache: CacheStore,
    pub owner_jobs: OwnerJobs,
    pub sink: Arc<dyn DeliverySink>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mediafetch_api=info,tower_http=info".into()),
        )
        .init();

    let config = Config::from_env()?;
    if config.api_key_is_fallback {
        warn!("Running with a generated API key; set MEDIAFETCH_API_KEY for stable auth");
    }

    artifact_store::ensure_dir(&config.download_dir).await?;

    let cache = {
        let cache_dir = config.cache_dir.clone();
        let max_bytes = config.max_cache_bytes;
        let retention = config.cache_retention;
        tokio::task::spawn_blocking(move || CacheStore::open(&cache_dir, max_bytes, retention))
            .await
            .context("Cache open task failed")??
    };

    let fetcher = Arc::new(YtDlpFetcher::new(&config));
    let registry = JobRegistry::new();
    let queue = DownloadQueue::start(
        QueueOptions {
            workers: config.workers,
            queue_capacity: config.queue_capacity,
            fetch_timeout: config.fetch_timeout,
            reap_grace: config.reap_grace,
            tombstone_ttl: config.tombstone_ttl,
        },
        registry,
        cache.clone(),
        fetcher,
    );

    let state = AppState {
        config: config.clone(),
        queue,
        cache,
        owner_jobs: OwnerJobs::new(),
        sink: Arc::new(LogSink),
    };

    let app = Router::new()
        .route("/healthz", get(api::healthz))
        .route("/v1/downloads", post(api::create_download))
        .route(
            "/v1/downloads/{job_id}",
            get(api::get_download).delete(api::cancel_download),
        )
        .route("/v1/downloads/{job_id}/file", get(api::download_file))
        .route("/v1/owners/{owner_id}/downloads", get(api::owner_downloads))
        .route("/v1/cache/popular", get(api::popular_cache_entries))
        .route("/v1/queue/stats", get(api::queue_stats))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    info!("mediafetch-api listening on {}", config.bind_addr);
    axum::serve(listener, app).await?;
    Ok(())
}
