//! HTTP ingress: platform events, health, metrics and link management.

use axum::{
    extract::{Json, Query, State},
    http::{HeaderMap, StatusCode},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::events::{Id, PlatformEvent};
use crate::links::ChannelLink;
use crate::metrics::MetricsReport;
use crate::pipeline::RelayPipeline;
use crate::security::{header_matches, API_KEY_HEADER, RELAY_SECRET_HEADER};

/// Application state
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub pipeline: Arc<RelayPipeline>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub breaker: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Debug, Deserialize)]
pub struct GuildQuery {
    pub guild_id: Id,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateLinkRequest {
    pub guild_id: Id,
    pub channel_a: Id,
    pub lang_a: String,
    pub channel_b: Id,
    pub lang_b: String,
}

/// Both channels: unlink the pair. One channel: unlink everything touching it.
/// No channel: unlink the whole guild.
#[derive(Debug, Serialize, Deserialize)]
pub struct DeleteLinkRequest {
    pub guild_id: Id,
    #[serde(default)]
    pub channel_a: Option<Id>,
    #[serde(default)]
    pub channel_b: Option<Id>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DeleteLinkResponse {
    pub removed: u64,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
}

fn require_api_key(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    let expected = state.config.admin_api_key.as_deref().unwrap_or_default();
    if header_matches(headers, API_KEY_HEADER, expected) {
        Ok(())
    } else {
        warn!("Rejected link management request with missing or invalid API key");
        Err(api_error(StatusCode::UNAUTHORIZED, "invalid API key"))
    }
}

/// Health check handler
async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        breaker: state.pipeline.breaker().state().as_str().to_string(),
    })
}

async fn metrics(State(state): State<AppState>) -> Json<MetricsReport> {
    Json(state.pipeline.metrics_report())
}

/// Accept a platform event and process it in the background
async fn ingest_event(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(event): Json<PlatformEvent>,
) -> StatusCode {
    if !header_matches(&headers, RELAY_SECRET_HEADER, &state.config.relay_webhook_secret) {
        warn!("Rejected event with missing or invalid relay secret");
        return StatusCode::UNAUTHORIZED;
    }

    state.pipeline.handle_event(event).await;
    StatusCode::ACCEPTED
}

async fn list_links(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<GuildQuery>,
) -> Result<Json<Vec<ChannelLink>>, ApiError> {
    require_api_key(&state, &headers)?;
    state
        .pipeline
        .links()
        .list_links(query.guild_id)
        .await
        .map(Json)
        .map_err(|e| {
            error!("Failed to list links for guild {}: {}", query.guild_id, e);
            api_error(StatusCode::INTERNAL_SERVER_ERROR, "failed to list links")
        })
}

async fn create_link(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<CreateLinkRequest>,
) -> Result<StatusCode, ApiError> {
    require_api_key(&state, &headers)?;

    if req.channel_a == req.channel_b {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            "a channel cannot be linked to itself",
        ));
    }
    if req.lang_a.trim().is_empty() || req.lang_b.trim().is_empty() {
        return Err(api_error(StatusCode::BAD_REQUEST, "both languages are required"));
    }

    state
        .pipeline
        .links()
        .link_pair(
            req.guild_id,
            req.channel_a,
            req.lang_a.trim(),
            req.channel_b,
            req.lang_b.trim(),
        )
        .await
        .map_err(|e| {
            error!("Failed to link channels in guild {}: {}", req.guild_id, e);
            api_error(StatusCode::INTERNAL_SERVER_ERROR, "failed to store link")
        })?;

    info!(
        "Linked channel {} ({}) <-> {} ({}) in guild {}",
        req.channel_a, req.lang_a, req.channel_b, req.lang_b, req.guild_id
    );
    Ok(StatusCode::CREATED)
}

async fn delete_link(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<DeleteLinkRequest>,
) -> Result<Json<DeleteLinkResponse>, ApiError> {
    require_api_key(&state, &headers)?;

    let links = state.pipeline.links();
    let result = match (req.channel_a, req.channel_b) {
        (Some(a), Some(b)) => links.unlink_pair(req.guild_id, a, b).await,
        (Some(ch), None) | (None, Some(ch)) => links.unlink_channel(req.guild_id, ch).await,
        (None, None) => links.unlink_all(req.guild_id).await,
    };

    let removed = result.map_err(|e| {
        error!("Failed to unlink in guild {}: {}", req.guild_id, e);
        api_error(StatusCode::INTERNAL_SERVER_ERROR, "failed to remove links")
    })?;
    Ok(Json(DeleteLinkResponse { removed }))
}

/// Build the router. Link management is only mounted with an admin API key.
pub fn router(state: AppState) -> Router {
    let mut app = Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/events", post(ingest_event));

    if state.config.admin_api_key.is_some() {
        app = app.route(
            "/links",
            get(list_links).post(create_link).delete(delete_link),
        );
    }

    app.layer(TraceLayer::new_for_http()).with_state(state)
}

/// Run the HTTP server until ctrl-c
pub async fn run_server(state: AppState) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], state.config.port));
    let app = router(state);

    info!("Starting server on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
