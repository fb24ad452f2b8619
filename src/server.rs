use anyhow::Result;
use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderValue, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower_http::{set_header::SetResponseHeaderLayer, trace::TraceLayer};
use tracing::info;

use crate::{
    commands::ScanClient,
    policy::ScanPolicy,
    store::{ResultStore, RunningStatus},
    types::{HostId, ScanKind},
};

#[derive(Clone)]
pub struct AppState {
    pub client: ScanClient,
    pub store: ResultStore,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Status {
    pub state: RunningStatus,
    pub active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_completed_scan_ts: Option<f64>,
}

#[derive(Debug, Deserialize)]
pub struct ScanBody {
    #[serde(rename = "type")]
    pub kind: ScanKind,
    pub target: String,
}

#[derive(Debug, Deserialize)]
pub struct ResultsQuery {
    #[serde(default)]
    pub latest: Option<usize>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/status", get(get_status))
        .route("/scan", post(post_scan))
        .route("/stop", post(post_stop))
        .route("/results", get(get_results))
        .route("/hosts/{id}", get(get_host))
        .route("/policy", post(post_policy))
        .with_state(state);

    // results are polled; never serve them from a cache
    Router::new()
        .nest("/api", api)
        .layer(SetResponseHeaderLayer::overriding(
            header::CACHE_CONTROL,
            HeaderValue::from_static("no-store"),
        ))
        .layer(TraceLayer::new_for_http())
}

pub async fn spawn_server(bind: &str, state: AppState, shutdown: CancellationToken) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!(%bind, "serving scan API");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

async fn get_status(State(app): State<AppState>) -> impl IntoResponse {
    let snapshot = app.store.snapshot(None, None).await;
    let out = Status {
        state: app.store.running_status().await,
        active: snapshot.has_active(),
        last_completed_scan_ts: snapshot.last_completed_scan_ts,
    };
    (StatusCode::OK, Json(out))
}

async fn get_results(State(app): State<AppState>, Query(q): Query<ResultsQuery>) -> impl IntoResponse {
    let snapshot = match q.latest {
        Some(n) => app.store.snapshot(Some(n), None).await,
        None => app.client.get_scan_result().await,
    };
    (StatusCode::OK, Json(snapshot))
}

async fn get_host(State(app): State<AppState>, Path(id): Path<String>) -> impl IntoResponse {
    match app.store.host_result(&HostId::new(id)).await {
        Some(result) => (StatusCode::OK, Json(result)).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn post_scan(State(app): State<AppState>, Json(req): Json<ScanBody>) -> impl IntoResponse {
    let snapshot = app.client.schedule_scan(req.kind, &req.target).await;
    (StatusCode::ACCEPTED, Json(snapshot))
}

async fn post_stop(State(app): State<AppState>) -> impl IntoResponse {
    let snapshot = app.client.stop_scan().await;
    (StatusCode::OK, Json(snapshot))
}

async fn post_policy(State(app): State<AppState>, Json(policy): Json<ScanPolicy>) -> impl IntoResponse {
    match app.client.apply_policy(policy).await {
        Ok(()) => StatusCode::ACCEPTED.into_response(),
        Err(e) => (StatusCode::BAD_REQUEST, Json(ErrorBody { error: e.to_string() })).into_response(),
    }
}
