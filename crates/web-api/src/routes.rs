use application::ApplicationError;
use axum::{
    extract::{Query, State, WebSocketUpgrade},
    http::{HeaderMap, StatusCode},
    response::Response,
    routing::get,
    Router,
};
use domain::DeviceId;
use serde::Deserialize;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::{error::ApiError, state::AppState, ws_connection::WebSocketConnection};

#[derive(Debug, Deserialize)]
struct WsQuery {
    #[serde(rename = "deviceId")]
    device_id: Option<String>,
    token: Option<String>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .nest("/api/v1", api_routes())
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                // 任意来源都可以发起 WebSocket 升级，身份只看令牌
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}

fn api_routes() -> Router<AppState> {
    Router::new().route("/ws", get(websocket_upgrade))
}

async fn health() -> StatusCode {
    StatusCode::OK
}

async fn websocket_upgrade(
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    let user_id = state
        .jwt_service
        .authenticate(&headers, query.token.as_deref())
        .inspect_err(|err| tracing::warn!(error = ?err, "websocket upgrade rejected"))?;

    let device_id = query
        .device_id
        .ok_or_else(|| ApiError::bad_request("deviceId is required"))
        .and_then(|raw| DeviceId::parse(raw).map_err(|err| ApplicationError::from(err).into()))?;

    tracing::info!(user_id = %user_id, device_id = %device_id, "websocket upgrade accepted");

    let max_frame_bytes = state.session.max_frame_bytes;
    Ok(ws
        .max_message_size(max_frame_bytes)
        .max_frame_size(max_frame_bytes)
        .on_upgrade(move |socket| WebSocketConnection::new(socket, state, user_id, device_id).run()))
}
