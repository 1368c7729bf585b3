//! REST endpoints for group membership.
//!
//! Fanout re-reads membership on every group message, so changes made here
//! apply from the next message on.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::auth::middleware::Claims;
use crate::chat::message::{GroupId, UserId};
use crate::chat::messages::{internal_error, ApiError};
use crate::chat::store::{MessageStore, SqliteStore};
use crate::state::AppState;

/// Maximum group name length (chars).
const MAX_GROUP_NAME_LENGTH: usize = 100;

#[derive(Debug, Deserialize)]
pub struct CreateGroupRequest {
    pub name: String,
    #[serde(default)]
    pub member_ids: Vec<UserId>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GroupResponse {
    pub id: GroupId,
    pub name: String,
    pub created_by: UserId,
    pub members: Vec<UserId>,
}

#[derive(Debug, Deserialize)]
pub struct AddMemberRequest {
    pub user_id: UserId,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MembersResponse {
    pub group_id: GroupId,
    pub members: Vec<UserId>,
}

fn sorted_members(store: &SqliteStore, group_id: GroupId) -> Vec<UserId> {
    let mut members: Vec<UserId> = store.list_group_members(group_id).into_iter().collect();
    members.sort_unstable();
    members
}

/// Group must exist and `caller` must currently belong to it.
pub(crate) fn require_member(store: &SqliteStore, group_id: GroupId, caller: UserId) -> Result<(), ApiError> {
    if store.find_group(group_id).map_err(internal_error)?.is_none() {
        return Err((StatusCode::NOT_FOUND, "Group not found".to_string()));
    }
    if !store.is_member(group_id, caller).map_err(internal_error)? {
        return Err((
            StatusCode::FORBIDDEN,
            "You are not a member of this group".to_string(),
        ));
    }
    Ok(())
}

async fn blocking<T, F>(store: &Arc<SqliteStore>, f: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce(&SqliteStore) -> Result<T, ApiError> + Send + 'static,
{
    let store = store.clone();
    tokio::task::spawn_blocking(move || f(&store))
        .await
        .map_err(internal_error)?
}

/// POST /api/groups
/// Create a group. The caller is always a member. Member ids are identities
/// issued elsewhere and are recorded as they are added.
pub async fn create_group(
    State(state): State<AppState>,
    claims: Claims,
    Json(body): Json<CreateGroupRequest>,
) -> Result<(StatusCode, Json<GroupResponse>), ApiError> {
    let name = body.name.trim().to_string();
    if name.is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            "Group name cannot be empty".to_string(),
        ));
    }
    if name.chars().count() > MAX_GROUP_NAME_LENGTH {
        return Err((StatusCode::BAD_REQUEST, "Group name is too long".to_string()));
    }

    let creator = claims.sub;
    let response = blocking(&state.store, move |store| {
        let group = store
            .create_group(&name, creator, &body.member_ids)
            .map_err(internal_error)?;
        Ok(GroupResponse {
            id: group.id,
            members: sorted_members(store, group.id),
            name: group.name,
            created_by: group.created_by,
        })
    })
    .await?;

    tracing::info!(group_id = response.id, created_by = creator, "Group created");
    Ok((StatusCode::CREATED, Json(response)))
}

/// GET /api/groups/{group_id}/members
pub async fn list_members(
    State(state): State<AppState>,
    claims: Claims,
    Path(group_id): Path<GroupId>,
) -> Result<Json<MembersResponse>, ApiError> {
    let caller = claims.sub;
    let members = blocking(&state.store, move |store| {
        require_member(store, group_id, caller)?;
        Ok(sorted_members(store, group_id))
    })
    .await?;

    Ok(Json(MembersResponse { group_id, members }))
}

/// POST /api/groups/{group_id}/members
pub async fn add_member(
    State(state): State<AppState>,
    claims: Claims,
    Path(group_id): Path<GroupId>,
    Json(body): Json<AddMemberRequest>,
) -> Result<Json<MembersResponse>, ApiError> {
    let caller = claims.sub;
    let user_id = body.user_id;
    let members = blocking(&state.store, move |store| {
        require_member(store, group_id, caller)?;
        store
            .add_group_member(group_id, user_id)
            .map_err(internal_error)?;
        Ok(sorted_members(store, group_id))
    })
    .await?;

    tracing::info!(group_id, user_id, added_by = caller, "Group member added");
    Ok(Json(MembersResponse { group_id, members }))
}

/// DELETE /api/groups/{group_id}/members/{user_id}
pub async fn remove_member(
    State(state): State<AppState>,
    claims: Claims,
    Path((group_id, user_id)): Path<(GroupId, UserId)>,
) -> Result<StatusCode, ApiError> {
    let caller = claims.sub;
    blocking(&state.store, move |store| {
        require_member(store, group_id, caller)?;
        if store
            .remove_group_member(group_id, user_id)
            .map_err(internal_error)?
        {
            Ok(())
        } else {
            Err((StatusCode::NOT_FOUND, "User is not a member".to_string()))
        }
    })
    .await?;

    tracing::info!(group_id, user_id, removed_by = caller, "Group member removed");
    Ok(StatusCode::NO_CONTENT)
}

/// DELETE /api/groups/{group_id}
/// Only the creator may delete a group. Its messages stay in history.
pub async fn delete_group(
    State(state): State<AppState>,
    claims: Claims,
    Path(group_id): Path<GroupId>,
) -> Result<StatusCode, ApiError> {
    let caller = claims.sub;
    blocking(&state.store, move |store| {
        let group = store
            .find_group(group_id)
            .map_err(internal_error)?
            .ok_or((StatusCode::NOT_FOUND, "Group not found".to_string()))?;
        if group.created_by != caller {
            return Err((
                StatusCode::FORBIDDEN,
                "Only the creator can delete a group".to_string(),
            ));
        }
        store.delete_group(group_id).map_err(internal_error)?;
        Ok(())
    })
    .await?;

    tracing::info!(group_id, deleted_by = caller, "Group deleted");
    Ok(StatusCode::NO_CONTENT)
}
