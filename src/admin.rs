// ABOUTME: Read-only operational HTTP surface for one gateway instance
// ABOUTME: Health, Prometheus metrics, pool stats, cluster activity and the scheduled-post listing

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use relaygate_core::{GlobalStats, PostStatus, ScheduledPost, ServerInfo, WorkerActivity};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::server::ServerState;

#[derive(Clone)]
pub struct AdminState {
    pub server: Arc<ServerState>,
    /// None when no recorder was installed (tests, `check-config`)
    pub metrics: Option<PrometheusHandle>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub server_id: String,
    pub version: String,
    pub pool_running: bool,
}

#[derive(Debug, Serialize)]
pub struct ClusterResponse {
    pub servers: Vec<ServerInfo>,
    pub workers: Vec<WorkerActivity>,
    pub stats: GlobalStats,
}

#[derive(Debug, Serialize)]
pub struct SchedulesResponse {
    pub pending: usize,
    pub posts: Vec<ScheduledPost>,
}

#[derive(Debug, Deserialize)]
pub struct SchedulesQuery {
    pub status: Option<String>,
    pub channel: Option<String>,
}

/// Build the admin router with its state attached
pub fn admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_handler))
        .route("/api/pool", get(pool_stats))
        .route("/api/cluster", get(cluster))
        .route("/api/schedules", get(schedules))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the admin router until `cancel` fires
pub async fn serve(
    addr: &str,
    state: AdminState,
    cancel: tokio_util::sync::CancellationToken,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %addr, "Starting admin server");
    axum::serve(listener, admin_router(state))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;
    Ok(())
}

fn internal_error(e: anyhow::Error) -> Response {
    tracing::error!(error = %e, "Admin request failed");
    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
}

async fn health(State(state): State<AdminState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        server_id: state.server.config.instance.id.clone(),
        version: state.server.config.instance.version.clone(),
        pool_running: state.server.pool.is_running(),
    })
}

async fn metrics_handler(State(state): State<AdminState>) -> Response {
    match &state.metrics {
        Some(handle) => handle.render().into_response(),
        None => (StatusCode::NOT_FOUND, "metrics recorder not installed").into_response(),
    }
}

async fn pool_stats(State(state): State<AdminState>) -> Response {
    Json(state.server.pool.stats()).into_response()
}

async fn cluster(State(state): State<AdminState>) -> Response {
    let monitor = &state.server.monitor;
    let servers = match monitor.get_active_servers().await {
        Ok(s) => s,
        Err(e) => return internal_error(e),
    };
    let workers = match monitor.get_cluster_activity().await {
        Ok(w) => w,
        Err(e) => return internal_error(e),
    };
    let stats = match monitor.get_global_stats().await {
        Ok(s) => s,
        Err(e) => return internal_error(e),
    };
    Json(ClusterResponse {
        servers,
        workers,
        stats,
    })
    .into_response()
}

async fn schedules(
    State(state): State<AdminState>,
    Query(query): Query<SchedulesQuery>,
) -> Response {
    let status = match query.status.as_deref().map(str::parse::<PostStatus>) {
        None => None,
        Some(Ok(status)) => Some(status),
        Some(Err(e)) => return (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    };
    let scheduler = &state.server.scheduler;
    let mut posts = match scheduler.list() {
        Ok(p) => p,
        Err(e) => return internal_error(e),
    };
    posts.retain(|p| {
        status.as_ref().map_or(true, |s| p.status == *s)
            && query.channel.as_deref().map_or(true, |c| p.channel_id == c)
    });
    let pending = match scheduler.pending_count().await {
        Ok(n) => n,
        Err(e) => return internal_error(e),
    };
    Json(SchedulesResponse { pending, posts }).into_response()
}
