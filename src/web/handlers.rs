use axum::{
    extract::{ConnectInfo, Path, Query, State, WebSocketUpgrade},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::net::SocketAddr;
use tracing::warn;

use crate::registry::{NewServer, ServerUpdate};
use crate::types::{AuthKind, MetricKind, TimeRange};
use crate::web::AppState;

pub type ApiResult<T> = Result<Json<ApiResponse<T>>, (StatusCode, Json<ApiResponse<()>>)>;

#[derive(Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub message: Option<String>,
    pub timestamp: String,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            message: None,
            timestamp: Utc::now().to_rfc3339(),
        }
    }
}

impl ApiResponse<()> {
    pub fn error(message: String) -> Self {
        Self {
            success: false,
            data: None,
            message: Some(message),
            timestamp: Utc::now().to_rfc3339(),
        }
    }
}

fn err<T>(status: StatusCode, message: impl Into<String>) -> ApiResult<T> {
    Err((status, Json(ApiResponse::error(message.into()))))
}

#[derive(Deserialize)]
pub struct CreateServerBody {
    pub name: String,
    pub host: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    pub username: String,
    pub auth_kind: AuthKind,
    pub secret: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default = "default_true")]
    pub monitoring_enabled: bool,
}

fn default_ssh_port() -> u16 {
    22
}

fn default_true() -> bool {
    true
}

#[derive(Deserialize)]
pub struct UpdateServerBody {
    pub name: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub auth_kind: Option<AuthKind>,
    pub secret: Option<String>,
    pub tags: Option<Vec<String>>,
    pub monitoring_enabled: Option<bool>,
}

#[derive(Deserialize)]
pub struct HistoryQuery {
    pub from_ms: i64,
    pub to_ms: i64,
}

#[derive(Deserialize)]
pub struct WsQuery {
    #[serde(default)]
    pub compress: bool,
}

pub async fn list_servers(State(state): State<AppState>) -> ApiResult<serde_json::Value> {
    Ok(Json(ApiResponse::success(json!(state.registry.list_servers()))))
}

pub async fn create_server(
    State(state): State<AppState>,
    Json(body): Json<CreateServerBody>,
) -> ApiResult<serde_json::Value> {
    let view = match state
        .registry
        .create_server(NewServer {
            name: body.name,
            host: body.host,
            port: body.port,
            username: body.username,
            auth_kind: body.auth_kind,
            secret: body.secret,
            tags: body.tags,
            monitoring_enabled: body.monitoring_enabled,
        })
        .await
    {
        Ok(view) => view,
        Err(e) => return err(StatusCode::BAD_REQUEST, e.to_string()),
    };

    if let Some(server) = state.registry.get(&view.id) {
        state.scheduler.add_server(server);
    }
    Ok(Json(ApiResponse::success(json!(view))))
}

pub async fn update_server(
    State(state): State<AppState>,
    Path(server_id): Path<String>,
    Json(body): Json<UpdateServerBody>,
) -> ApiResult<serde_json::Value> {
    let view = match state
        .registry
        .update_server(
            &server_id,
            ServerUpdate {
                name: body.name,
                host: body.host,
                port: body.port,
                username: body.username,
                auth_kind: body.auth_kind,
                secret: body.secret,
                tags: body.tags,
                monitoring_enabled: body.monitoring_enabled,
            },
        )
        .await
    {
        Ok(view) => view,
        Err(e) => return err(StatusCode::NOT_FOUND, e.to_string()),
    };

    // Connection parameters may have changed: recycle sessions and restart
    // (or stop) the collection task.
    state.pool.close_server(&server_id).await;
    if view.monitoring_enabled {
        if let Some(server) = state.registry.get(&server_id) {
            state.scheduler.add_server(server);
        }
    } else {
        state.scheduler.remove_server(&server_id).await;
    }
    Ok(Json(ApiResponse::success(json!(view))))
}

pub async fn delete_server(
    State(state): State<AppState>,
    Path(server_id): Path<String>,
) -> ApiResult<serde_json::Value> {
    if let Err(e) = state.registry.delete_server(&server_id).await {
        return err(StatusCode::NOT_FOUND, e.to_string());
    }

    // Teardown order: stop collecting, drain sessions, drop rings, purge
    // subscriptions.
    state.scheduler.remove_server(&server_id).await;
    state.pool.close_server(&server_id).await;
    state.store.remove_server(&server_id);
    state.fabric.forget_server(&server_id);

    Ok(Json(ApiResponse::success(json!({ "deleted": server_id }))))
}

pub async fn test_connection(
    State(state): State<AppState>,
    Path(server_id): Path<String>,
) -> ApiResult<serde_json::Value> {
    match state.registry.test_connection(&server_id, &state.pool).await {
        Ok(report) => Ok(Json(ApiResponse::success(json!(report)))),
        Err(e) => err(StatusCode::NOT_FOUND, e.to_string()),
    }
}

pub async fn latest_sample(
    State(state): State<AppState>,
    Path(server_id): Path<String>,
) -> ApiResult<serde_json::Value> {
    match state.store.query_latest(&server_id) {
        Ok(sample) => Ok(Json(ApiResponse::success(json!(&*sample)))),
        Err(e) => err(StatusCode::NOT_FOUND, e.to_string()),
    }
}

pub async fn sample_history(
    State(state): State<AppState>,
    Path((server_id, metric)): Path<(String, String)>,
    Query(query): Query<HistoryQuery>,
) -> ApiResult<serde_json::Value> {
    let metric = match metric.as_str() {
        "cpu" => MetricKind::Cpu,
        "memory" => MetricKind::Memory,
        "disk" => MetricKind::Disk,
        "network" => MetricKind::Network,
        other => {
            return err(
                StatusCode::BAD_REQUEST,
                format!("unknown metric kind {other:?}"),
            )
        }
    };
    if query.from_ms > query.to_ms {
        return err(StatusCode::BAD_REQUEST, "from_ms must not exceed to_ms");
    }

    let result = state.store.query_recent(
        &server_id,
        metric,
        TimeRange {
            from_ms: query.from_ms,
            to_ms: query.to_ms,
        },
    );
    let samples: Vec<&crate::types::MetricsSample> =
        result.samples.iter().map(|s| s.as_ref()).collect();
    Ok(Json(ApiResponse::success(json!({
        "server_id": server_id,
        "metric": metric.as_str(),
        "partial": result.partial,
        "samples": samples,
    }))))
}

pub async fn system_info(
    State(state): State<AppState>,
    Path(server_id): Path<String>,
) -> ApiResult<serde_json::Value> {
    match state.sysinfo.get(&server_id) {
        Some(info) => Ok(Json(ApiResponse::success(json!(info)))),
        None => err(StatusCode::NOT_FOUND, "no system info collected yet"),
    }
}

pub async fn service_status(State(state): State<AppState>) -> ApiResult<serde_json::Value> {
    Ok(Json(ApiResponse::success(json!({
        "push": state.fabric.stats(),
        "pool": state.pool.status().await,
        "sink_degraded": state.store.is_sink_degraded(),
        "collecting": state.scheduler.active_servers(),
    }))))
}

/// WebSocket handshake. Connection caps reject with 429 before the upgrade.
pub async fn websocket_upgrade(
    State(state): State<AppState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    if let Err(reason) = state.fabric.admit(remote.ip()) {
        warn!(remote = %remote, reason, "websocket handshake rejected");
        return (
            StatusCode::TOO_MANY_REQUESTS,
            Json(ApiResponse::error(format!("connection rejected: {reason}"))),
        )
            .into_response();
    }

    let fabric = state.fabric.clone();
    ws.on_upgrade(move |socket| fabric.handle_socket(socket, remote.ip(), query.compress))
}
