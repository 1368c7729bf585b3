//! REST endpoints for submitting messages and reading history.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};

use crate::auth::middleware::Claims;
use crate::chat::admission;
use crate::chat::groups;
use crate::chat::message::{GroupId, InboundPayload, MessagePayload, UserId};
use crate::chat::store::MessageStore;
use crate::state::AppState;

pub(crate) type ApiError = (StatusCode, String);

pub(crate) fn internal_error<E: std::fmt::Display>(err: E) -> ApiError {
    tracing::error!(error = %err, "Request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        "Internal server error".to_string(),
    )
}

/// POST /api/chat/messages
/// Same admission path as the realtime connection: validate, persist, fan out.
pub async fn send_message(
    State(state): State<AppState>,
    claims: Claims,
    Json(body): Json<InboundPayload>,
) -> Result<(StatusCode, Json<MessagePayload>), ApiError> {
    let (message, _report) = admission::admit(
        &state.store,
        state.connections.as_ref(),
        &state.realtime,
        claims.sub,
        body,
    )
    .await
    .map_err(|err| {
        if err.is_validation() {
            (StatusCode::BAD_REQUEST, err.to_string())
        } else {
            internal_error(err)
        }
    })?;

    Ok((
        StatusCode::CREATED,
        Json(MessagePayload::render(&message, &state.realtime.clock)),
    ))
}

/// GET /api/chat/messages/{peer_id}
/// Direct messages between the caller and `peer_id`, oldest first.
pub async fn get_direct_messages(
    State(state): State<AppState>,
    claims: Claims,
    Path(peer_id): Path<UserId>,
) -> Result<Json<Vec<MessagePayload>>, ApiError> {
    if claims.sub == peer_id {
        return Err((
            StatusCode::BAD_REQUEST,
            "Cannot fetch messages with yourself".to_string(),
        ));
    }

    let store = state.store.clone();
    let caller = claims.sub;
    let messages = tokio::task::spawn_blocking(move || {
        let messages = store.direct_history(caller, peer_id).map_err(internal_error)?;
        if !messages.is_empty() {
            return Ok(messages);
        }
        // A peer is known once it has authenticated or been added to a group
        if store.find_user(peer_id).map_err(internal_error)?.is_none() {
            return Err((StatusCode::NOT_FOUND, "User not found".to_string()));
        }
        Err((StatusCode::NOT_FOUND, "No messages found".to_string()))
    })
    .await
    .map_err(internal_error)??;

    let clock = &state.realtime.clock;
    Ok(Json(
        messages
            .iter()
            .map(|message| MessagePayload::render(message, clock))
            .collect(),
    ))
}

/// GET /api/chat/groups/{group_id}/messages
/// Group messages, oldest first. The caller must be a member at query time.
pub async fn get_group_messages(
    State(state): State<AppState>,
    claims: Claims,
    Path(group_id): Path<GroupId>,
) -> Result<Json<Vec<MessagePayload>>, ApiError> {
    let store = state.store.clone();
    let caller = claims.sub;
    let messages = tokio::task::spawn_blocking(move || {
        groups::require_member(&store, group_id, caller)?;
        store.group_history(group_id).map_err(internal_error)
    })
    .await
    .map_err(internal_error)??;

    if messages.is_empty() {
        return Err((StatusCode::NOT_FOUND, "No messages found".to_string()));
    }

    let clock = &state.realtime.clock;
    Ok(Json(
        messages
            .iter()
            .map(|message| MessagePayload::render(message, clock))
            .collect(),
    ))
}
