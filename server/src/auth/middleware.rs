use axum::{
    extract::FromRequestParts,
    http::{request::Parts, StatusCode},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::chat::message::UserId;
use crate::chat::store::SqliteStore;

/// JWT claims issued by the identity service.
/// Implements axum's FromRequestParts for use as an extractor on REST routes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Authenticated user identity
    pub sub: UserId,
    /// Issued at (Unix timestamp)
    pub iat: i64,
    /// Expiration (Unix timestamp)
    pub exp: i64,
}

impl<S> FromRequestParts<S> for Claims
where
    S: Send + Sync,
{
    type Rejection = StatusCode;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get("Authorization")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .ok_or(StatusCode::UNAUTHORIZED)?;

        // Secret is put into extensions by the inject_jwt_secret layer
        let jwt_secret = parts
            .extensions
            .get::<JwtSecret>()
            .ok_or(StatusCode::INTERNAL_SERVER_ERROR)?;

        let claims = super::jwt::validate_access_token(&jwt_secret.0, token)
            .map_err(|_| StatusCode::UNAUTHORIZED)?;

        if let Some(identities) = parts.extensions.get::<IdentityStore>() {
            remember_identity(&identities.0, claims.sub).await;
        }

        Ok(claims)
    }
}

/// Record `user_id` in the users table the first time it authenticates.
/// A failed write is logged and does not fail the request.
pub async fn remember_identity(store: &Arc<SqliteStore>, user_id: UserId) {
    if store.is_recorded(user_id) {
        return;
    }
    let store = store.clone();
    match tokio::task::spawn_blocking(move || store.record_identity(user_id)).await {
        Ok(Ok(())) => tracing::debug!(user_id, "Identity recorded"),
        Ok(Err(e)) => tracing::warn!(user_id, error = %e, "Failed to record identity"),
        Err(e) => tracing::warn!(user_id, error = %e, "Identity recording task failed"),
    }
}

/// JWT secret stored in request extensions for the Claims extractor
#[derive(Clone)]
pub struct JwtSecret(pub Vec<u8>);

/// Store where the Claims extractor records authenticated identities
#[derive(Clone)]
pub struct IdentityStore(pub Arc<SqliteStore>);
