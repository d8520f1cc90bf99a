// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! API server
//!
//! HTTP surface the browser client talks to. Creating a download returns
//! immediately with a `pending` record; the client polls the status route
//! until the record turns terminal, then fetches the artifact.
//!
//! # Endpoints
//!
//! - `GET /health` - Health check
//! - `GET /api/video-info/:video_id` - Probe title, duration, formats
//! - `POST /api/downloads` - Create a download job
//! - `GET /api/downloads` - List all jobs
//! - `GET /api/downloads/:id` - Poll one job
//! - `GET /api/downloads/:id/file` - Fetch the finished artifact
//!
//! # Example
//!
//! ```no_run
//! use tubedrop::{Config, Server};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let server = Server::new(Config::default());
//! server.start().await?;
//! # Ok(())
//! # }
//! ```

use std::net::SocketAddr;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::{
    body::Body,
    extract::{DefaultBodyLimit, Path as UrlPath, State},
    http::header,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tokio_util::io::ReaderStream;
use tower_governor::{
    governor::GovernorConfigBuilder, key_extractor::SmartIpKeyExtractor, GovernorLayer,
};

use crate::config::Config;
use crate::errors::{ApiError, ApiResult};
use crate::job::{Job, JobId, JobRunner, JobStatus, JobStore};
use crate::youtube;

// Maximum request body size (64KB is plenty: the only body is a create request)
const MAX_BODY_SIZE: usize = 64 * 1024;
// Maximum accepted title length
const MAX_TITLE_LENGTH: usize = 200;
// Health probe timeout for the downloader binary
const DOWNLOADER_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Server state shared across handlers.
pub struct AppState {
    /// Runtime configuration.
    pub config: Config,
    /// Job registry.
    pub store: JobStore,
    /// Download runner.
    pub runner: JobRunner,
}

/// API server configuration.
#[derive(Debug)]
pub struct Server {
    config: Config,
}

impl Server {
    /// Create a server from a config.
    /// By default the config binds 127.0.0.1 (localhost only) for security.
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Port the server will listen on.
    pub fn port(&self) -> u16 {
        self.config.port
    }

    /// Build the router with all routes and a fresh store/runner pair.
    pub fn build_router(&self) -> Router {
        let store = JobStore::new(self.config.retain_max);
        let runner = JobRunner::new(store.clone(), self.config.clone());

        let state = Arc::new(AppState {
            config: self.config.clone(),
            store,
            runner,
        });

        Self::router(state)
    }

    /// Wire routes and middleware over existing state.
    fn router(state: Arc<AppState>) -> Router {
        // Rate limiting: bursts of 30, refilling 5 per second per client IP.
        // Generous enough for 1s status polling, tight enough to keep one
        // client from queueing unbounded downloader processes.
        let governor_conf = Arc::new(
            GovernorConfigBuilder::default()
                .per_second(5)
                .burst_size(30)
                .key_extractor(SmartIpKeyExtractor)
                .finish()
                .expect("Failed to build governor config"),
        );

        Router::new()
            .route("/health", get(health_handler))
            .route("/api/video-info/:video_id", get(video_info_handler))
            .route("/api/downloads", post(create_download_handler).get(list_downloads_handler))
            .route("/api/downloads/:id", get(get_download_handler))
            .route("/api/downloads/:id/file", get(download_file_handler))
            .layer(DefaultBodyLimit::max(MAX_BODY_SIZE))
            .layer(GovernorLayer {
                config: governor_conf,
            })
            .with_state(state)
    }

    /// Start the server with graceful shutdown.
    pub async fn start(&self) -> Result<()> {
        let router = self.build_router();
        let addr = format!("{}:{}", self.config.bind_address, self.config.port);

        tracing::info!("Starting server on {}", addr);
        tracing::info!(
            "Artifacts will be written to {}",
            self.config.output_dir.display()
        );

        // Security warning if binding to all interfaces
        if self.config.bind_address == "0.0.0.0" {
            tracing::warn!(
                "Server is binding to 0.0.0.0 which exposes the API to the network. \
                Use 127.0.0.1 (default) for local-only access."
            );
        }

        let listener = tokio::net::TcpListener::bind(&addr).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::AddrInUse {
                anyhow::anyhow!(
                    "Port {} is already in use. This usually means another tubedrop \
                    server is running. Stop other instances or pass a different --port.",
                    self.config.port
                )
            } else {
                anyhow::anyhow!("Failed to bind to {}: {}", addr, e)
            }
        })?;

        // Connect info is what lets the rate limiter key on the peer address
        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown_signal())
        .await?;

        Ok(())
    }
}

// =============================================================================
// Request/Response Types
// =============================================================================

/// Health check response.
#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: &'static str,
    downloader_status: String,
    jobs: JobCounts,
}

#[derive(Serialize)]
struct JobCounts {
    pending: usize,
    downloading: usize,
    completed: usize,
    failed: usize,
}

/// Create download request body.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateDownloadRequest {
    video_id: String,
    format: String,
    #[serde(default)]
    title: Option<String>,
}

// =============================================================================
// Handlers
// =============================================================================

/// Health check handler.
///
/// Probes the downloader binary and reports degraded status if it is missing.
async fn health_handler(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let downloader_status = match check_downloader(&state.config.ytdlp_bin).await {
        true => "ok".to_string(),
        false => "unavailable".to_string(),
    };

    let (pending, downloading, completed, failed) = state.store.status_counts();

    let status = if downloader_status == "ok" {
        "ok".to_string()
    } else {
        "degraded".to_string()
    };

    Json(HealthResponse {
        status,
        version: env!("CARGO_PKG_VERSION"),
        downloader_status,
        jobs: JobCounts {
            pending,
            downloading,
            completed,
            failed,
        },
    })
}

/// Check the downloader binary resolves and runs, with a short timeout.
async fn check_downloader(bin: &Path) -> bool {
    let mut cmd = tokio::process::Command::new(bin);
    cmd.arg("--version")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());

    matches!(
        tokio::time::timeout(DOWNLOADER_PROBE_TIMEOUT, cmd.status()).await,
        Ok(Ok(status)) if status.success()
    )
}

/// Video metadata handler.
async fn video_info_handler(
    State(state): State<Arc<AppState>>,
    UrlPath(video_id): UrlPath<String>,
) -> ApiResult<Json<youtube::VideoInfo>> {
    if !youtube::is_valid_video_id(&video_id) {
        return Err(ApiError::invalid_request(
            "Invalid video ID format",
            Some("videoId"),
            None,
        ));
    }

    match youtube::probe_video_info(&state.config, &video_id).await {
        Ok(info) => Ok(Json(info)),
        Err(e) => {
            // The probe failing almost always means a bad or private video,
            // so this is reported as a client error with a readable message.
            tracing::warn!(video_id = %video_id, error = %e, "metadata probe failed");
            Err(ApiError::invalid_request(
                "Failed to get video information. Please check if the video exists and is public.",
                Some("videoId"),
                Some(&e.to_string()),
            ))
        }
    }
}

/// Create download handler. Returns the `pending` record immediately;
/// the runner proceeds in the background.
async fn create_download_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CreateDownloadRequest>,
) -> ApiResult<Json<Job>> {
    if !youtube::is_valid_video_id(&request.video_id) {
        return Err(ApiError::invalid_request(
            "Invalid video ID format",
            Some("videoId"),
            None,
        ));
    }

    if !youtube::is_valid_format_selector(&request.format) {
        return Err(ApiError::invalid_request(
            "Invalid format selector",
            Some("format"),
            None,
        ));
    }

    if let Some(title) = &request.title {
        if title.len() > MAX_TITLE_LENGTH {
            return Err(ApiError::invalid_request(
                "Title too long",
                Some("title"),
                None,
            ));
        }
    }

    let job = state
        .store
        .create(&request.video_id, &request.format, request.title.clone());

    tracing::info!(job_id = job.id, video_id = %job.video_id, format = %job.format, "download queued");
    state.runner.spawn(job.id);

    Ok(Json(job))
}

/// Poll one download job.
async fn get_download_handler(
    State(state): State<Arc<AppState>>,
    UrlPath(id): UrlPath<JobId>,
) -> ApiResult<Json<Job>> {
    state
        .store
        .get(id)
        .map(Json)
        .map_err(|_| ApiError::not_found("download"))
}

/// List every known download job, oldest first.
async fn list_downloads_handler(State(state): State<Arc<AppState>>) -> Json<Vec<Job>> {
    Json(state.store.list_all())
}

/// Stream the finished artifact.
///
/// 404 unless the job is completed and its file is still on disk. A record
/// whose artifact was deleted out-of-band must 404, not crash.
async fn download_file_handler(
    State(state): State<Arc<AppState>>,
    UrlPath(id): UrlPath<JobId>,
) -> ApiResult<Response> {
    let job = state.store.get(id).map_err(|_| ApiError::not_found("download"))?;

    if job.status != JobStatus::Completed {
        return Err(ApiError::not_found("download"));
    }
    let Some(path) = job.artifact_path else {
        return Err(ApiError::not_found("download"));
    };

    let file = match tokio::fs::File::open(&path).await {
        Ok(file) => file,
        Err(e) => {
            tracing::warn!(job_id = id, path = %path.display(), error = %e, "artifact missing on disk");
            return Err(ApiError::not_found("file"));
        }
    };

    let filename = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("download.mp4")
        .to_string();

    let stream = ReaderStream::new(file);
    let headers = [
        (header::CONTENT_TYPE, "video/mp4".to_string()),
        (
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{}\"", filename),
        ),
    ];

    Ok((headers, Body::from_stream(stream)).into_response())
}

// =============================================================================
// Utilities
// =============================================================================

/// Graceful shutdown signal handler.
///
/// Waits for SIGINT/SIGTERM. In-flight downloader processes are dropped with
/// the runtime; their partial files are skipped by the artifact scan anyway.
async fn shutdown_signal() {
    // On Unix, listen for SIGINT and SIGTERM
    // On Windows, fall back to Ctrl+C only
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");

        tokio::select! {
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM, initiating graceful shutdown...");
            }
            _ = sigint.recv() => {
                tracing::info!("Received SIGINT (Ctrl+C), initiating graceful shutdown...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
        tracing::info!("Received Ctrl+C, initiating graceful shutdown...");
    }

    tracing::info!("Shutting down server");
}
