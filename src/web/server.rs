use anyhow::Result;
use axum::{
    routing::{delete, get, post, put},
    Router,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::collector::{CollectorScheduler, SystemInfoCache};
use crate::config::Config;
use crate::push::PushFabric;
use crate::registry::ServerRegistry;
use crate::ssh::SshPool;
use crate::store::SampleStore;
use crate::web::handlers;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub registry: Arc<ServerRegistry>,
    pub store: Arc<SampleStore>,
    pub fabric: Arc<PushFabric>,
    pub pool: Arc<SshPool>,
    pub scheduler: Arc<CollectorScheduler>,
    pub sysinfo: Arc<SystemInfoCache>,
}

pub async fn start_web_server(state: AppState, cancel: CancellationToken) -> Result<()> {
    let addr = state.config.listen_addr.clone();
    let app = create_router(state);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("server running on http://{addr}");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .with_graceful_shutdown(async move { cancel.cancelled().await })
    .await?;
    Ok(())
}

fn create_router(state: AppState) -> Router {
    Router::new()
        // === SERVER MANAGEMENT ===
        .route("/api/servers", get(handlers::list_servers))
        .route("/api/servers", post(handlers::create_server))
        .route("/api/servers/{server_id}", put(handlers::update_server))
        .route("/api/servers/{server_id}", delete(handlers::delete_server))
        .route(
            "/api/servers/{server_id}/test",
            post(handlers::test_connection),
        )
        // === METRICS ===
        .route(
            "/api/servers/{server_id}/metrics/latest",
            get(handlers::latest_sample),
        )
        .route(
            "/api/servers/{server_id}/metrics/{metric}/history",
            get(handlers::sample_history),
        )
        .route(
            "/api/servers/{server_id}/sysinfo",
            get(handlers::system_info),
        )
        // === OPERATIONAL VISIBILITY ===
        .route("/api/status", get(handlers::service_status))
        // === LIVE PUSH ===
        .route("/ws", get(handlers::websocket_upgrade))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
