use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::Response,
};
use serde::Deserialize;

use crate::auth::jwt;
use crate::state::AppState;
use crate::ws::actor;
use crate::ws::protocol::{CLOSE_TOKEN_EXPIRED, CLOSE_TOKEN_INVALID};

/// Query parameters for WebSocket connection. Auth is via `?token=JWT`.
#[derive(Debug, Deserialize)]
pub struct WsAuthQuery {
    pub token: Option<String>,
}

/// GET /ws?token=JWT
/// WebSocket upgrade endpoint. On auth failure, upgrades then immediately
/// closes with 4001 (expired) or 4002 (invalid) without touching the
/// connection registry. On success, runs a session for the connection.
pub async fn ws_upgrade(
    State(state): State<AppState>,
    Query(params): Query<WsAuthQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let claims = match params.token.as_deref() {
        Some(token) => jwt::validate_access_token(&state.jwt_secret, token).map_err(|err| {
            match err.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => {
                    (CLOSE_TOKEN_EXPIRED, "Token expired")
                }
                _ => (CLOSE_TOKEN_INVALID, "Token invalid"),
            }
        }),
        None => Err((CLOSE_TOKEN_INVALID, "Token missing")),
    };

    match claims {
        Ok(claims) => {
            tracing::info!(user_id = claims.sub, "WebSocket connection authenticated");
            ws.on_upgrade(move |socket| actor::run_connection(socket, state, claims.sub))
        }
        Err((close_code, reason)) => {
            tracing::warn!(close_code, reason, "WebSocket auth failed");
            ws.on_upgrade(move |socket| reject(socket, close_code, reason))
        }
    }
}

async fn reject(mut socket: WebSocket, code: u16, reason: &'static str) {
    let close_frame = CloseFrame {
        code,
        reason: reason.into(),
    };
    let _ = socket.send(Message::Close(Some(close_frame))).await;
}
