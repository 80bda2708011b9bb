//! HTTP API: background scrape sessions, locations, image download, health.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;

use crate::browser::SessionLauncher;
use crate::config::{normalize_target_url, GeoTable, ScrapeConfig};
use crate::controller::{AttemptSummary, ConnectionController};
use crate::crawler::ScrapeResult;
use crate::download::{attachment_filename, ImageDownloader};
use crate::error::ScrapeError;
use crate::proxy::ProxyDescriptor;

// ============================================================================
// State
// ============================================================================

pub struct AppState {
    pub sessions: RwLock<HashMap<String, ScrapeSession>>,
    pub geo_table: GeoTable,
    pub launcher: Arc<dyn SessionLauncher>,
}

/// How long a finished session stays queryable.
const SESSION_TTL_MINUTES: i64 = 60;

impl AppState {
    pub fn new(launcher: Arc<dyn SessionLauncher>, geo_table: GeoTable) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            geo_table,
            launcher,
        }
    }
}

/// Drop finished sessions whose results have been kept for longer than the
/// TTL. Running sessions are never evicted.
fn prune_expired(sessions: &mut HashMap<String, ScrapeSession>, now: DateTime<Utc>) {
    let ttl = chrono::Duration::minutes(SESSION_TTL_MINUTES);
    let before = sessions.len();
    sessions.retain(|_, s| {
        let finished_at = s.started_at + chrono::Duration::milliseconds(s.duration_ms.unwrap_or(0));
        s.status == SessionStatus::Running || now - finished_at < ttl
    });
    if sessions.len() < before {
        tracing::debug!("🧹 Evicted {} expired sessions", before - sessions.len());
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Running,
    Completed,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ProgressEntry {
    pub timestamp: DateTime<Utc>,
    pub message: String,
}

/// A background scrape started through `POST /api/scrape`.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ScrapeSession {
    pub id: String,
    pub url: String,
    /// Country code of the selected location.
    pub location: String,
    pub status: SessionStatus,
    pub progress: Vec<ProgressEntry>,
    pub results: Option<ScrapeResult>,
    pub attempts: Vec<AttemptSummary>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub duration_ms: Option<i64>,
}

// ============================================================================
// Request / Response Types
// ============================================================================

#[derive(Debug, Deserialize, ToSchema)]
pub struct ScrapeRequest {
    pub url: Option<String>,
    /// Location id, 1-10 (see `GET /api/locations`). Defaults to 1.
    pub location: Option<usize>,
    pub headless: Option<bool>,
    pub skip_proxy: Option<bool>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ScrapeResponse {
    pub success: bool,
    pub session_id: String,
    pub message: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct LocationInfo {
    pub id: usize,
    pub code: String,
    pub name: String,
}

#[derive(Debug, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct DownloadQuery {
    /// Absolute image URL.
    pub url: Option<String>,
    pub filename: Option<String>,
    /// Country code forwarded to the proxy on fallback.
    pub country: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub active_sessions: usize,
    pub timestamp: DateTime<Utc>,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (status, Json(ErrorResponse { error: message.into() }))
}

// ============================================================================
// Handlers
// ============================================================================

/// Start a background scrape session
#[utoipa::path(
    post,
    path = "/api/scrape",
    request_body = ScrapeRequest,
    responses(
        (status = 200, description = "Session started", body = ScrapeResponse),
        (status = 400, description = "Missing or invalid url/location", body = ErrorResponse)
    ),
    tag = "scrape"
)]
pub async fn start_scrape(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ScrapeRequest>,
) -> Result<Json<ScrapeResponse>, ApiError> {
    let url = req
        .url
        .as_deref()
        .map(str::trim)
        .filter(|u| !u.is_empty())
        .ok_or_else(|| api_error(StatusCode::BAD_REQUEST, "url is required"))?;
    let url = normalize_target_url(url);
    if reqwest::Url::parse(&url).map(|u| u.host_str().is_none()).unwrap_or(true) {
        return Err(api_error(StatusCode::BAD_REQUEST, format!("invalid url: {}", url)));
    }

    let location_id = req.location.unwrap_or(1);
    let geo = state.geo_table.by_id(location_id).cloned().ok_or_else(|| {
        api_error(
            StatusCode::BAD_REQUEST,
            format!("location must be between 1 and {}", state.geo_table.entries().count()),
        )
    })?;

    let config = ScrapeConfig::new(&url, &geo.code, &state.geo_table)
        .with_headless(req.headless.unwrap_or(true))
        .with_skip_proxy(req.skip_proxy.unwrap_or(false));

    let id = Uuid::new_v4().to_string();
    let session = ScrapeSession {
        id: id.clone(),
        url: url.clone(),
        location: geo.code.clone(),
        status: SessionStatus::Running,
        progress: Vec::new(),
        results: None,
        attempts: Vec::new(),
        error: None,
        started_at: Utc::now(),
        duration_ms: None,
    };
    {
        let mut sessions = state.sessions.write().await;
        prune_expired(&mut sessions, Utc::now());
        sessions.insert(id.clone(), session);
    }

    tracing::info!("🚀 Session {} started for {} ({})", id, url, geo.code);
    tokio::spawn(run_session(state.clone(), id.clone(), config));

    Ok(Json(ScrapeResponse {
        success: true,
        session_id: id,
        message: format!("Scraping {} from {}", url, geo.name),
    }))
}

async fn run_session(state: Arc<AppState>, id: String, config: ScrapeConfig) {
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<String>();

    let progress_state = state.clone();
    let progress_id = id.clone();
    let forwarder = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if let Some(session) = progress_state.sessions.write().await.get_mut(&progress_id) {
                session.progress.push(ProgressEntry {
                    timestamp: Utc::now(),
                    message,
                });
            }
        }
    });

    let controller = ConnectionController::new(state.launcher.clone()).with_progress(tx);
    let outcome = controller.run(&config).await;
    // Dropping the controller closes the channel and ends the forwarder
    drop(controller);
    let _ = forwarder.await;

    let mut sessions = state.sessions.write().await;
    let Some(session) = sessions.get_mut(&id) else {
        return;
    };
    session.duration_ms = Some((Utc::now() - session.started_at).num_milliseconds());
    match outcome {
        Ok(report) => {
            tracing::info!("✅ Session {} completed: {} banners", id, report.result.total());
            session.status = SessionStatus::Completed;
            session.results = Some(report.result);
            session.attempts = report.attempts;
        }
        Err(e) => {
            tracing::error!("❌ Session {} failed: {}", id, e);
            session.status = SessionStatus::Error;
            session.error = Some(e.to_string());
        }
    }
}

/// Get the status and results of a scrape session
#[utoipa::path(
    get,
    path = "/api/scrape/{id}",
    params(("id" = String, Path, description = "Session id")),
    responses(
        (status = 200, description = "Session state", body = ScrapeSession),
        (status = 404, description = "Unknown session")
    ),
    tag = "scrape"
)]
pub async fn get_scrape_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<ScrapeSession>, StatusCode> {
    state
        .sessions
        .read()
        .await
        .get(&id)
        .cloned()
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

/// List the selectable scrape locations
#[utoipa::path(
    get,
    path = "/api/locations",
    responses((status = 200, description = "Location table", body = [LocationInfo])),
    tag = "scrape"
)]
pub async fn list_locations(State(state): State<Arc<AppState>>) -> Json<Vec<LocationInfo>> {
    Json(
        state
            .geo_table
            .entries()
            .map(|(id, geo)| LocationInfo {
                id,
                code: geo.code.clone(),
                name: geo.name.clone(),
            })
            .collect(),
    )
}

/// Download a banner image, retrying through the proxy when blocked
#[utoipa::path(
    get,
    path = "/api/download",
    params(DownloadQuery),
    responses(
        (status = 200, description = "Image bytes"),
        (status = 400, description = "Missing, malformed or internal url", body = ErrorResponse),
        (status = 502, description = "Image could not be fetched", body = ErrorResponse)
    ),
    tag = "download"
)]
pub async fn download_image(Query(query): Query<DownloadQuery>) -> Response {
    let Some(url) = query.url.as_deref().map(str::trim).filter(|u| !u.is_empty()) else {
        return api_error(StatusCode::BAD_REQUEST, "url is required").into_response();
    };

    let proxy = ProxyDescriptor::from_env(query.country.as_deref().unwrap_or("US"));
    match ImageDownloader::new(proxy).fetch(url).await {
        Ok(image) => {
            let filename = attachment_filename(url, query.filename.as_deref());
            tracing::info!(
                "📦 Serving {} as {} ({})",
                url,
                filename,
                if image.via_proxy { "via proxy" } else { "direct" }
            );
            (
                StatusCode::OK,
                [
                    (header::CONTENT_TYPE, image.content_type),
                    (header::CONTENT_DISPOSITION, format!("attachment; filename=\"{}\"", filename)),
                    (header::CACHE_CONTROL, "no-store".to_string()),
                ],
                image.bytes,
            )
                .into_response()
        }
        Err(e @ ScrapeError::InvalidUrl { .. }) => api_error(StatusCode::BAD_REQUEST, e.to_string()).into_response(),
        Err(e) => {
            tracing::warn!("Download failed for {}: {}", url, e);
            api_error(StatusCode::BAD_GATEWAY, e.to_string()).into_response()
        }
    }
}

/// Service health
#[utoipa::path(
    get,
    path = "/api/health",
    responses((status = 200, description = "Service is up", body = HealthResponse)),
    tag = "system"
)]
pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let active_sessions = state
        .sessions
        .read()
        .await
        .values()
        .filter(|s| s.status == SessionStatus::Running)
        .count();
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        active_sessions,
        timestamp: Utc::now(),
    })
}
