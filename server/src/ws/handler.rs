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

/// Query parameters for WebSocket connection.
/// Auth is via query param ?token=JWT — browsers cannot set headers on
/// WebSocket upgrades.
#[derive(Debug, Deserialize)]
pub struct WsAuthQuery {
    pub token: String,
}

/// WebSocket close codes:
/// 4001 = token expired
/// 4002 = token invalid or user unknown
const CLOSE_TOKEN_EXPIRED: u16 = 4001;
const CLOSE_TOKEN_INVALID: u16 = 4002;

/// GET /ws?token=JWT
/// WebSocket upgrade endpoint. Authenticates via query parameter.
/// On auth failure, upgrades then immediately closes with appropriate close code.
/// On success, spawns an actor for the connection.
pub async fn ws_upgrade(
    State(state): State<AppState>,
    Query(params): Query<WsAuthQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let claims = jwt::validate_access_token(&state.jwt_secret, &params.token);

    match claims {
        Ok(claims) => {
            tracing::info!(user_id = %claims.sub, "WebSocket connection authenticated");
            ws.on_upgrade(move |socket| handle_authenticated(socket, state, claims.sub))
        }
        Err(err) => {
            let (close_code, reason) = match err.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => {
                    (CLOSE_TOKEN_EXPIRED, "Token expired")
                }
                _ => (CLOSE_TOKEN_INVALID, "Token invalid"),
            };

            tracing::warn!(close_code, reason, "WebSocket auth failed");

            // Upgrade the connection, then immediately close with the error code
            ws.on_upgrade(move |socket| close_with(socket, close_code, reason))
        }
    }
}

/// Handle an authenticated WebSocket connection: the token's user must
/// still exist, then the per-connection actor takes over.
async fn handle_authenticated(socket: WebSocket, state: AppState, user_id: String) {
    let db = state.db.clone();
    let uid = user_id.clone();
    let user_name = tokio::task::spawn_blocking(move || {
        let conn = db.lock().ok()?;
        conn.query_row(
            "SELECT name FROM users WHERE id = ?1",
            rusqlite::params![uid],
            |row| row.get::<_, String>(0),
        )
        .ok()
    })
    .await
    .ok()
    .flatten();

    match user_name {
        Some(user_name) => actor::run_connection(socket, state, user_id, user_name).await,
        None => close_with(socket, CLOSE_TOKEN_INVALID, "Token invalid").await,
    }
}

async fn close_with(mut socket: WebSocket, code: u16, reason: &'static str) {
    let close_frame = CloseFrame {
        code,
        reason: reason.into(),
    };
    let _ = socket.send(Message::Close(Some(close_frame))).await;
}
