use axum::{middleware, Router};

use crate::auth::middleware::{IdentityStore, JwtSecret};
use crate::chat::{groups, messages};
use crate::state::AppState;
use crate::ws::handler as ws_handler;

/// Inject the JWT secret and identity store into request extensions so the
/// Claims extractor can find them.
async fn inject_jwt_secret(
    axum::extract::State(state): axum::extract::State<AppState>,
    mut req: axum::http::Request<axum::body::Body>,
    next: middleware::Next,
) -> axum::response::Response {
    req.extensions_mut()
        .insert(JwtSecret(state.jwt_secret.clone()));
    req.extensions_mut()
        .insert(IdentityStore(state.store.clone()));
    next.run(req).await
}

/// Build the full axum Router with all routes and middleware.
pub fn build_router(state: AppState) -> Router {
    // Message submission and history (JWT required)
    let message_routes = Router::new()
        .route(
            "/api/chat/messages",
            axum::routing::post(messages::send_message),
        )
        .route(
            "/api/chat/messages/{peer_id}",
            axum::routing::get(messages::get_direct_messages),
        )
        .route(
            "/api/chat/groups/{group_id}/messages",
            axum::routing::get(messages::get_group_messages),
        );

    // Group membership (JWT required)
    let group_routes = Router::new()
        .route("/api/groups", axum::routing::post(groups::create_group))
        .route(
            "/api/groups/{group_id}",
            axum::routing::delete(groups::delete_group),
        )
        .route(
            "/api/groups/{group_id}/members",
            axum::routing::get(groups::list_members).post(groups::add_member),
        )
        .route(
            "/api/groups/{group_id}/members/{user_id}",
            axum::routing::delete(groups::remove_member),
        );

    // WebSocket endpoint (auth via query param, not JWT header)
    let ws_routes = Router::new().route("/ws", axum::routing::get(ws_handler::ws_upgrade));

    let health = Router::new().route("/health", axum::routing::get(health_check));

    Router::new()
        .merge(message_routes)
        .merge(group_routes)
        .merge(ws_routes)
        .merge(health)
        .layer(middleware::from_fn_with_state(
            state.clone(),
            inject_jwt_secret,
        ))
        .with_state(state)
}

/// Basic health check endpoint
async fn health_check() -> &'static str {
    "ok"
}
