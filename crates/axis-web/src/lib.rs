//! Axum JSON API exposing the deadline list and the review surface
//! (duplicate groups and merge suggestions).

use std::sync::Arc;

use axis_store::DeadlineStore;
use axis_sync::{duplicate_groups, merge_suggestions};
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::Utc;
use serde::Deserialize;
use tokio::net::TcpListener;
use tracing::error;

pub const CRATE_NAME: &str = "axis-web";

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn DeadlineStore>,
    pub user_id: String,
}

impl AppState {
    pub fn new(store: Arc<dyn DeadlineStore>, user_id: impl Into<String>) -> Self {
        Self {
            store,
            user_id: user_id.into(),
        }
    }
}

#[derive(Debug, Deserialize, Default)]
struct DeadlinesQuery {
    #[serde(default)]
    include_completed: bool,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/deadlines", get(deadlines_handler))
        .route("/review/duplicate-groups", get(duplicate_groups_handler))
        .route("/review/merge-suggestions", get(merge_suggestions_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState) -> anyhow::Result<()> {
    let port: u16 = std::env::var("AXIS_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn deadlines_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<DeadlinesQuery>,
) -> Response {
    match state
        .store
        .list(&state.user_id, Utc::now(), query.include_completed)
        .await
    {
        Ok(deadlines) => Json(deadlines).into_response(),
        Err(err) => server_error(err.to_string()),
    }
}

async fn duplicate_groups_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.store.list(&state.user_id, Utc::now(), true).await {
        Ok(deadlines) => Json(duplicate_groups(&deadlines)).into_response(),
        Err(err) => server_error(err.to_string()),
    }
}

async fn merge_suggestions_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.store.list(&state.user_id, Utc::now(), true).await {
        Ok(deadlines) => Json(merge_suggestions(&deadlines)).into_response(),
        Err(err) => server_error(err.to_string()),
    }
}

fn server_error(message: String) -> Response {
    error!(%message, "request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({ "error": message })),
    )
        .into_response()
}
