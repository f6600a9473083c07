use axum::{
    extract::{State, WebSocketUpgrade},
    http::{HeaderMap, header},
    response::Response,
};
use serde::Deserialize;
use tracing::debug;

use circle_gateway::connection;

use crate::AppState;
use crate::error::ApiError;
use crate::extract::QueryArgs;

#[derive(Debug, Deserialize)]
pub struct GatewayQuery {
    pub token: Option<String>,
}

/// Authorize once at upgrade, from the `Authorization` header or a `token`
/// query parameter for clients that cannot set headers on WebSockets.
pub async fn ws_upgrade(
    State(state): State<AppState>,
    QueryArgs(query): QueryArgs<GatewayQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    let header_value = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());

    let authorized = match (header_value, query.token.as_deref()) {
        (Some(raw), _) => state.gate.authorize(Some(raw)).await,
        (None, Some(token)) => state.gate.authorize_token(token).await,
        (None, None) => return Err(ApiError::unauthorized()),
    };

    let claims = authorized.map_err(|e| {
        debug!("Gateway upgrade refused: {}", e);
        ApiError::unauthorized()
    })?;

    let db = state.db.clone();
    let settings = state.gateway.clone();
    Ok(ws.on_upgrade(move |socket| {
        connection::handle_connection(
            socket,
            db,
            claims.sub,
            claims.username,
            settings.poll_interval,
            settings.shutdown,
        )
    }))
}
