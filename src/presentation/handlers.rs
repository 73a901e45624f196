// HTTP request handlers
use crate::domain::error::WidgetClosed;
use crate::domain::template::TemplateSlot;
use crate::infrastructure::config::GraphCardConfig;
use crate::infrastructure::http_response::{accepts_brotli, json_response};
use crate::presentation::app_state::AppState;
use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use serde::Serialize;
use std::sync::Arc;

#[derive(Serialize)]
struct SlotResponse {
    key: String,
    value: Option<String>,
}

/// Health check endpoint
pub async fn health_check() -> &'static str {
    "ok"
}

/// Current polyline plus everything the renderer needs to draw the tile
pub async fn get_graph(headers: HeaderMap, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let view = state.graph.view();
    match json_response(&view, accepts_brotli(&headers)).await {
        Ok(response) => response,
        Err(status) => status.into_response(),
    }
}

/// Just the projected points, possibly empty while no history has arrived
pub async fn get_polyline(headers: HeaderMap, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let points = state.graph.polyline();
    match json_response(&points, accepts_brotli(&headers)).await {
        Ok(response) => response,
        Err(status) => status.into_response(),
    }
}

/// Display value of one template slot
pub async fn get_slot(
    Path(key): Path<String>,
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let Some(slot) = TemplateSlot::from_key(&key) else {
        return (StatusCode::NOT_FOUND, format!("unknown slot {}", key)).into_response();
    };

    let body = SlotResponse {
        key: slot.key().to_string(),
        value: state.graph.slot_value(slot),
    };
    match json_response(&body, accepts_brotli(&headers)).await {
        Ok(response) => response,
        Err(status) => status.into_response(),
    }
}

/// Replace the card configuration
pub async fn put_config(
    State(state): State<Arc<AppState>>,
    Json(config): Json<GraphCardConfig>,
) -> impl IntoResponse {
    if let Err(e) = config.validate() {
        return (StatusCode::UNPROCESSABLE_ENTITY, e.to_string()).into_response();
    }

    match state.graph.configure(config).await {
        Ok(()) => StatusCode::ACCEPTED.into_response(),
        Err(e) => {
            tracing::error!("Failed to apply configuration: {}", e);
            StatusCode::SERVICE_UNAVAILABLE.into_response()
        }
    }
}

/// The tile became visible: open its template subscriptions
pub async fn attach(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    lifecycle_response(state.graph.attach().await)
}

/// The tile went away: close its template subscriptions
pub async fn detach(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    lifecycle_response(state.graph.detach().await)
}

fn lifecycle_response(result: Result<(), WidgetClosed>) -> StatusCode {
    match result {
        Ok(()) => StatusCode::NO_CONTENT,
        Err(e) => {
            tracing::error!("Lifecycle event rejected: {}", e);
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}
