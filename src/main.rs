// Main entry point - Dependency injection and server setup
mod application;
mod domain;
mod infrastructure;
mod presentation;

use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Context;
use axum::{
    routing::{get, post, put},
    Router,
};
use tokio_stream::{wrappers::IntervalStream, StreamExt};
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use crate::application::graph_widget::{GraphHandle, GraphWidget};
use crate::infrastructure::config::load_app_config;
use crate::infrastructure::influx_history::InfluxHistory;
use crate::infrastructure::template_engine::LocalTemplateService;
use crate::presentation::app_state::AppState;
use crate::presentation::handlers::{
    attach, detach, get_graph, get_polyline, get_slot, health_check, put_config,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // Load configuration
    let config = load_app_config().context("Failed to load config/graph")?;

    // Create collaborators (infrastructure layer)
    let history = Arc::new(InfluxHistory::new(config.influx));
    let templates = Arc::new(LocalTemplateService::new(Duration::from_secs(
        config.templates.refresh_secs,
    )));

    // Start the widget (application layer)
    let (graph, widget_task) = GraphWidget::spawn(history, templates, config.session.user);
    graph.attach().await?;
    graph.configure(config.graph).await?;
    tokio::spawn(drive_ticks(graph.clone(), config.server.tick_secs));

    let state = Arc::new(AppState {
        graph: graph.clone(),
    });

    // Build router (presentation layer)
    let router = Router::new()
        .route("/healthz", get(health_check))
        .route("/graph", get(get_graph))
        .route("/graph/polyline", get(get_polyline))
        .route("/graph/slots/:key", get(get_slot))
        .route("/graph/config", put(put_config))
        .route("/graph/attach", post(attach))
        .route("/graph/detach", post(detach))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    // Start server
    let addr: SocketAddr = config
        .server
        .bind
        .parse()
        .with_context(|| format!("Invalid bind address {}", config.server.bind))?;
    tracing::info!("Starting graph-tile-feed on {}", addr);

    axum::serve(tokio::net::TcpListener::bind(addr).await?, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    graph.shutdown().await?;
    widget_task.await?;
    Ok(())
}

/// Host tick cadence; the widget decides when a tick warrants a new fetch
async fn drive_ticks(graph: GraphHandle, tick_secs: u64) {
    let mut ticks = IntervalStream::new(tokio::time::interval(Duration::from_secs(
        tick_secs.max(1),
    )));
    while ticks.next().await.is_some() {
        if graph.tick().await.is_err() {
            break;
        }
    }
}
