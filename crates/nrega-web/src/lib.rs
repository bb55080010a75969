//! Axum JSON API consumed by the dashboard frontend.

use std::future::Future;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderValue, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use nrega_core::canonical_district_name;
use nrega_storage::{SnapshotStore, StoreError};
use nrega_sync::{build_history, HistoryError};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{error, info};

pub const CRATE_NAME: &str = "nrega-web";

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn SnapshotStore>,
}

impl AppState {
    pub fn new(store: Arc<dyn SnapshotStore>) -> Self {
        Self { store }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DistrictRow {
    pub district_name: String,
}

#[derive(Debug, Deserialize, Default)]
struct PerformanceQuery {
    month: Option<String>,
    year: Option<String>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/api/districts", get(districts_handler))
        .route("/api/performance/{district}", get(performance_handler))
        .route("/api/performance/history/{district}", get(history_handler))
        .layer(middleware::map_response(allow_any_origin))
        .with_state(Arc::new(state))
}

/// Serves until `shutdown` resolves.
pub async fn serve(
    state: AppState,
    port: u16,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "http server listening");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

async fn allow_any_origin(mut resp: Response) -> Response {
    resp.headers_mut().insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    resp
}

async fn index_handler() -> &'static str {
    "MGNREGA backend is running"
}

async fn districts_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.store.distinct_district_names().await {
        Ok(names) if names.is_empty() => not_found("No district data available."),
        Ok(names) => Json(
            names
                .into_iter()
                .map(|district_name| DistrictRow { district_name })
                .collect::<Vec<_>>(),
        )
        .into_response(),
        Err(err) => server_error("Server error while fetching districts.", err),
    }
}

async fn performance_handler(
    State(state): State<Arc<AppState>>,
    Path(district): Path<String>,
    Query(query): Query<PerformanceQuery>,
) -> Response {
    let district = canonical_district_name(&district);
    match state
        .store
        .find_latest(&district, query.month.as_deref(), query.year.as_deref())
        .await
    {
        Ok(Some(snapshot)) => Json(snapshot).into_response(),
        Ok(None) => not_found("No data found for this district and time period."),
        Err(err) => server_error("Server error while fetching performance data.", err),
    }
}

async fn history_handler(
    State(state): State<Arc<AppState>>,
    Path(district): Path<String>,
) -> Response {
    match build_history(state.store.as_ref(), &district).await {
        Ok(periods) => Json(periods).into_response(),
        Err(HistoryError::NoHistory { .. }) => {
            not_found("No historical data found for this district.")
        }
        Err(HistoryError::Store(err)) => server_error("Server error while fetching history.", err),
    }
}

fn not_found(message: &str) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(serde_json::json!({ "message": message })),
    )
        .into_response()
}

fn server_error(message: &str, err: StoreError) -> Response {
    error!(error = %err, "{message}");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({ "error": message })),
    )
        .into_response()
}
