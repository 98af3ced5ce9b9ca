use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{header, HeaderMap, Response, StatusCode},
    response::IntoResponse,
    Json,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use tokio::{fs, task};
use tracing::warn;

use crate::{
    auth::verify_bearer,
    error::ServiceError,
    models::{JobState, SubmitAcceptedResponse, SubmitRequest},
    monitor::StatusMonitor,
    AppState,
};

pub async fn healthz() -> impl IntoResponse {
    Json(json!({ "ok": true, "timestamp": Utc::now() }))
}

pub async fn create_download(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<SubmitRequest>,
) -> impl IntoResponse {
    if let Err(err) = verify_bearer(&headers, &state.config.api_key) {
        return err.into_response();
    }

    if payload.source_url.trim().is_empty() || payload.variant_id.trim().is_empty() {
        return error_response(
            StatusCode::BAD_REQUEST,
            "INVALID_DOWNLOAD_REQUEST",
            "Request must include sourceUrl and variantId.",
        );
    }

    let channel_id = payload
        .channel_id
        .clone()
        .unwrap_or_else(|| payload.owner_id.clone());

    let job = match state
        .queue
        .submit(
            payload.owner_id.clone(),
            channel_id,
            payload.source_url.trim().to_string(),
            payload.variant_id.trim().to_string(),
            payload.priority.unwrap_or(5),
        )
        .await
    {
        Ok(job) => job,
        Err(ServiceError::QueueFull) => {
            return error_response(
                StatusCode::SERVICE_UNAVAILABLE,
                "QUEUE_FULL",
                "Download queue is full, try again later.",
            );
        }
        Err(err) => {
            return error_response(
                StatusCode::SERVICE_UNAVAILABLE,
                "QUEUE_UNAVAILABLE",
                &err.to_string(),
            );
        }
    };

    state.owner_jobs.track(&job.owner_id, &job.id).await;

    let response = SubmitAcceptedResponse {
        job_id: job.id.clone(),
        status: JobState::Pending,
        created_at: job.created_at,
    };

    StatusMonitor::new(
        state.queue.clone(),
        state.cache.clone(),
        state.sink.clone(),
        state.owner_jobs.clone(),
        state.config.poll_interval,
        state.config.monitor_timeout,
    )
    .spawn(job);

    (StatusCode::ACCEPTED, Json(response)).into_response()
}

pub async fn get_download(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(job_id): Path<String>,
) -> impl IntoResponse {
    if let Err(err) = verify_bearer(&headers, &state.config.api_key) {
        return err.into_response();
    }

    match state.queue.status(&job_id).await {
        Some(job) => (StatusCode::OK, Json(job.to_response())).into_response(),
        None => error_response(
            StatusCode::NOT_FOUND,
            "JOB_NOT_FOUND",
            "Download job not found.",
        ),
    }
}

pub async fn cancel_download(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(job_id): Path<String>,
) -> impl IntoResponse {
    if let Err(err) = verify_bearer(&headers, &state.config.api_key) {
        return err.into_response();
    }

    match state.queue.cancel(&job_id).await {
        Ok(job) => (StatusCode::OK, Json(job.to_response())).into_response(),
        Err(ServiceError::JobNotFound) => error_response(
            StatusCode::NOT_FOUND,
            "JOB_NOT_FOUND",
            "Download job not found.",
        ),
        Err(ServiceError::AlreadyTerminal) => error_response(
            StatusCode::CONFLICT,
            "ALREADY_TERMINAL",
            "Download job already finished.",
        ),
        Err(err) => error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "CANCEL_FAILED",
            &err.to_string(),
        ),
    }
}

pub async fn download_file(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(job_id): Path<String>,
) -> impl IntoResponse {
    if let Err(err) = verify_bearer(&headers, &state.config.api_key) {
        return err.into_response();
    }

    let (path, file_name) = {
        let Some(job) = state.queue.status(&job_id).await else {
            return error_response(
                StatusCode::NOT_FOUND,
                "JOB_NOT_FOUND",
                "Download job not found.",
            );
        };

        if job.status != JobState::Completed {
            return error_response(
                StatusCode::CONFLICT,
                "ARTIFACT_NOT_READY",
                "Download is not finished yet.",
            );
        }

        let Some(artifact) = &job.result else {
            return error_response(
                StatusCode::GONE,
                "ARTIFACT_MISSING",
                "Download artifact has been removed.",
            );
        };

        let file_name = artifact
            .file_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| format!("{job_id}.mp4"));
        (artifact.file_path.clone(), file_name)
    };

    let bytes = match fs::read(&path).await {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return error_response(
                StatusCode::GONE,
                "ARTIFACT_MISSING",
                "Download artifact no longer exists.",
            );
        }
        Err(err) => {
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "ARTIFACT_READ_FAILED",
                &format!("Failed to read artifact: {err}"),
            );
        }
    };

    let content_disposition = format!("attachment; filename=\"{file_name}\"");
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .header(header::CONTENT_DISPOSITION, content_disposition)
        .body(Body::from(bytes))
        .unwrap_or_else(|_| {
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "RESPONSE_BUILD_FAILED",
                "Failed to build download response.",
            )
        })
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PopularQuery {
    #[serde(default = "default_min_downloads")]
    pub min_downloads: i64,
}

fn default_min_downloads() -> i64 {
    5
}

pub async fn popular_cache_entries(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<PopularQuery>,
) -> impl IntoResponse {
    if let Err(err) = verify_bearer(&headers, &state.config.api_key) {
        return err.into_response();
    }

    let cache = state.cache.clone();
    let min = query.min_downloads;
    match task::spawn_blocking(move || cache.popular(min)).await {
        Ok(Ok(entries)) => (StatusCode::OK, Json(json!({ "entries": entries }))).into_response(),
        Ok(Err(err)) => {
            warn!("Popular cache query failed: {err:#}");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "CACHE_QUERY_FAILED",
                "Could not query the cache index.",
            )
        }
        Err(err) => {
            warn!("Popular cache task join error: {err}");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "CACHE_QUERY_FAILED",
                "Could not query the cache index.",
            )
        }
    }
}

pub async fn owner_downloads(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(owner_id): Path<String>,
) -> impl IntoResponse {
    if let Err(err) = verify_bearer(&headers, &state.config.api_key) {
        return err.into_response();
    }

    let jobs = state.queue.registry().jobs_for_owner(&owner_id).await;
    let responses: Vec<_> = jobs.iter().map(|job| job.to_response()).collect();
    (StatusCode::OK, Json(json!({ "jobs": responses }))).into_response()
}

pub async fn queue_stats(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> impl IntoResponse {
    if let Err(err) = verify_bearer(&headers, &state.config.api_key) {
        return err.into_response();
    }

    (StatusCode::OK, Json(state.queue.stats().await)).into_response()
}

fn error_response(status: StatusCode, code: &str, message: &str) -> Response<Body> {
    (
        status,
        Json(json!({
            "error": {
                "code": code,
                "message": message
            }
        })),
    )
        .into_response()
}
