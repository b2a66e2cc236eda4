//! HTTP API surface for photo restoration.
//!
//! This module owns request parsing, authentication, and response formatting
//! while delegating the restoration workflow to the [`Orchestrator`].

use std::sync::Arc;

use axum::extract::{DefaultBodyLimit, Multipart, Path, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};

use crate::cancel::CancelToken;
use crate::config::AppConfig;
use crate::error::AppError;
use crate::orchestrator::Orchestrator;

/// Human-readable service name returned by health endpoints.
pub const APP_NAME: &str = env!("CARGO_PKG_NAME");
/// Service version string returned by health endpoints.
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Shared state injected into all route handlers.
pub struct AppState {
    /// Runtime configuration loaded at startup.
    pub cfg: AppConfig,
    /// Restoration workflow driver.
    pub orchestrator: Arc<Orchestrator>,
    /// Cancelled when the server begins shutting down.
    pub shutdown: CancelToken,
}

impl AppState {
    /// Constructs shared handler state.
    pub fn new(cfg: AppConfig, orchestrator: Arc<Orchestrator>, shutdown: CancelToken) -> Self {
        Self {
            cfg,
            orchestrator,
            shutdown,
        }
    }
}

/// Builds the Axum router for all public endpoints.
pub fn build_router(state: Arc<AppState>) -> Router {
    let body_limit = state.cfg.max_upload_bytes;
    let cors = cors_layer(&state.cfg);

    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/photo-restore", post(photo_restore))
        .route("/avatar/:filename", get(avatar))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn cors_layer(cfg: &AppConfig) -> CorsLayer {
    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if cfg.cors_origins.iter().any(|origin| origin == "*") {
        return layer.allow_origin(Any);
    }

    let origins = cfg
        .cors_origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin = %origin, "ignoring invalid CORS origin");
                None
            }
        })
        .collect::<Vec<_>>();

    layer.allow_origin(origins)
}

/// Root status endpoint (`GET /`).
pub async fn root(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, AppError> {
    require_auth(&state.cfg, &headers)?;
    Ok(Json(json!({
        "status": "ok",
        "name": APP_NAME,
        "version": APP_VERSION,
    })))
}

/// Alias status endpoint (`GET /health`).
pub async fn health(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, AppError> {
    root(State(state), headers).await
}

/// Restores an uploaded photo (`POST /photo-restore`).
///
/// The job runs on its own task; if this handler is dropped because the
/// client went away, the request guard cancels the job's polling.
pub async fn photo_restore(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Result<Json<serde_json::Value>, AppError> {
    require_auth(&state.cfg, &headers)?;
    let form = parse_image_form(&mut multipart).await?;

    let (_request_guard, cancel) = state.shutdown.child();
    let orchestrator = state.orchestrator.clone();
    let job = tokio::spawn(async move {
        orchestrator
            .submit(form.bytes, &form.filename, &form.content_type, cancel)
            .await
    });

    let outcome = job
        .await
        .map_err(|err| AppError::internal(format!("restoration task failed: {err}")))??;
    debug!(job_id = %outcome.job_id, "restoration response ready");

    Ok(Json(json!({
        "restored_url": format!("/avatar/{}", outcome.result_name),
    })))
}

/// Serves a restored image by name (`GET /avatar/{filename}`).
///
/// Unauthenticated so the returned URL can be used directly as an image source.
pub async fn avatar(
    State(state): State<Arc<AppState>>,
    Path(filename): Path<String>,
) -> Result<Response, AppError> {
    let artifact = state.orchestrator.store().retrieve(&filename).await?;
    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, artifact.media_type)],
        artifact.bytes,
    )
        .into_response())
}

struct ImageForm {
    filename: String,
    content_type: String,
    bytes: Vec<u8>,
}

/// Parses and validates the multipart `file` field.
async fn parse_image_form(multipart: &mut Multipart) -> Result<ImageForm, AppError> {
    let mut form: Option<ImageForm> = None;

    while let Some(field) = multipart.next_field().await.map_err(|err| {
        if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
            AppError::PayloadTooLarge(format!("upload exceeds size limit: {err}"))
        } else {
            AppError::bad_multipart(format!("invalid multipart body: {err}"))
        }
    })? {
        if field.name() != Some("file") {
            continue;
        }

        let filename = field
            .file_name()
            .map(ToOwned::to_owned)
            .ok_or_else(|| AppError::bad_multipart("file field is missing filename"))?;
        let content_type = field
            .content_type()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .unwrap_or(DEFAULT_CONTENT_TYPE)
            .to_string();
        let bytes = field.bytes().await.map_err(|err| {
            if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
                AppError::PayloadTooLarge(format!("upload exceeds size limit: {err}"))
            } else {
                AppError::bad_multipart(format!("failed to read file bytes: {err}"))
            }
        })?;

        form = Some(ImageForm {
            filename,
            content_type,
            bytes: bytes.to_vec(),
        });
    }

    let form = form
        .ok_or_else(|| AppError::invalid_request("missing required multipart field: file", None))?;
    if form.bytes.is_empty() {
        return Err(AppError::invalid_request(
            "uploaded file is empty",
            Some("empty_file"),
        ));
    }
    Ok(form)
}

/// Enforces optional bearer-token authentication.
fn require_auth(cfg: &AppConfig, headers: &HeaderMap) -> Result<(), AppError> {
    let Some(expected_api_key) = cfg.api_key.as_deref() else {
        return Ok(());
    };

    let Some(raw) = headers.get(header::AUTHORIZATION) else {
        return Err(AppError::unauthorized("missing bearer token"));
    };

    let value = raw
        .to_str()
        .map_err(|_| AppError::unauthorized("invalid authorization header"))?;

    let mut parts = value.split_whitespace();
    let scheme = parts
        .next()
        .ok_or_else(|| AppError::unauthorized("missing bearer token"))?;
    let token = parts
        .next()
        .filter(|v| !v.is_empty())
        .ok_or_else(|| AppError::unauthorized("missing bearer token"))?;
    if parts.next().is_some() || !scheme.eq_ignore_ascii_case("bearer") {
        return Err(AppError::unauthorized("missing bearer token"));
    }

    if token != expected_api_key {
        return Err(AppError::unauthorized("invalid token"));
    }

    Ok(())
}
