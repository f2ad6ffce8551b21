use axum::{middleware, Json, Router};
use std::sync::Arc;
use tower_governor::key_extractor::PeerIpKeyExtractor;
use tower_governor::{governor::GovernorConfigBuilder, GovernorLayer};

use crate::auth::middleware::JwtSecret;
use crate::chat::{groups, messages};
use crate::state::AppState;
use crate::storage;
use crate::users::{accounts, friends};
use crate::ws::handler as ws_handler;

/// Inject the JWT secret into request extensions so the Claims extractor can find it.
async fn inject_jwt_secret(
    axum::extract::State(state): axum::extract::State<AppState>,
    mut req: axum::http::Request<axum::body::Body>,
    next: middleware::Next,
) -> axum::response::Response {
    req.extensions_mut()
        .insert(JwtSecret(state.jwt_secret.clone()));
    next.run(req).await
}

/// Build the full axum Router with all routes and middleware.
pub fn build_router(state: AppState) -> Router {
    // Rate limiting on credential endpoints: 5 requests per minute per IP.
    // Uses PeerIpKeyExtractor which reads from ConnectInfo<SocketAddr>.
    let governor_config = Arc::new(
        GovernorConfigBuilder::default()
            .key_extractor(PeerIpKeyExtractor)
            .per_second(12) // 1 token every 12 seconds = 5 per minute
            .burst_size(5)
            .finish()
            .expect("Failed to build governor config"),
    );
    let governor_limiter = governor_config.limiter().clone();

    // Spawn background task to clean up rate limiter state
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(std::time::Duration::from_secs(60)).await;
            governor_limiter.retain_recent();
        }
    });

    let auth_routes = Router::new()
        .route("/api/user/signup", axum::routing::post(accounts::signup))
        .route("/api/user/login", axum::routing::post(accounts::login))
        .layer(GovernorLayer {
            config: governor_config,
        });

    let user_routes = Router::new()
        .route("/api/user/profile", axum::routing::get(accounts::profile))
        .route("/api/user/logout", axum::routing::get(accounts::logout))
        .route("/api/user/search", axum::routing::get(accounts::search))
        .route(
            "/api/user/send-request",
            axum::routing::put(friends::send_request),
        )
        .route(
            "/api/user/accept-request",
            axum::routing::put(friends::accept_request),
        )
        .route(
            "/api/user/notifications",
            axum::routing::get(friends::notifications),
        )
        .route("/api/user/friends", axum::routing::get(friends::friends));

    // Note: /api/chat/my and /api/chat/message MUST come before
    // /api/chat/{id} to avoid path param conflicts.
    let chat_routes = Router::new()
        .route("/api/chat/group", axum::routing::post(groups::new_group))
        .route("/api/chat/my", axum::routing::get(groups::my_chats))
        .route("/api/chat/my/groups", axum::routing::get(groups::my_groups))
        .route(
            "/api/chat/add-members",
            axum::routing::put(groups::add_members),
        )
        .route(
            "/api/chat/remove-member",
            axum::routing::put(groups::remove_member),
        )
        .route(
            "/api/chat/leave/{id}",
            axum::routing::delete(groups::leave_group),
        )
        .route(
            "/api/chat/message",
            axum::routing::post(messages::send_attachments),
        )
        .route(
            "/api/chat/message/{id}",
            axum::routing::get(messages::get_messages),
        )
        .route("/api/chat/{id}", axum::routing::get(groups::chat_details))
        .route("/api/chat/{id}", axum::routing::put(groups::rename_group))
        .route(
            "/api/chat/{id}",
            axum::routing::delete(messages::delete_chat),
        );

    // WebSocket endpoint (auth via query param, not JWT header)
    let ws_routes = Router::new().route("/ws", axum::routing::get(ws_handler::ws_upgrade));

    let file_routes = Router::new().route(
        "/files/{public_id}",
        axum::routing::get(storage::serve_file),
    );

    let health = Router::new().route("/health", axum::routing::get(health_check));

    Router::new()
        .merge(auth_routes)
        .merge(user_routes)
        .merge(chat_routes)
        .merge(ws_routes)
        .merge(file_routes)
        .merge(health)
        .layer(middleware::from_fn_with_state(
            state.clone(),
            inject_jwt_secret,
        ))
        .with_state(state)
}

/// Basic health check endpoint
async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}
