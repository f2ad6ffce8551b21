//! Group membership engine: creation, membership mutation, listings.
//!
//! Invariants enforced here: a group has between 3 and 100 members after
//! any mutation, and its creator is always a member while the chat is
//! non-empty. Direct chats (2 members, no creator) are created by the
//! friend-request flow in users::friends.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::auth::middleware::Claims;
use crate::chat::store;
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;
use crate::ws::protocol::{AlertPayload, ServerEvent};

/// Hard cap on group size.
const MAX_GROUP_MEMBERS: usize = 100;
/// A group never shrinks below this; removals and leaves are rejected at
/// the boundary.
const MIN_GROUP_MEMBERS: usize = 3;

// --- Request / Response types ---

#[derive(Debug, Deserialize)]
pub struct NewGroupRequest {
    pub name: String,
    pub members: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddMembersRequest {
    pub chat_id: String,
    pub members: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoveMemberRequest {
    pub chat_id: String,
    pub user_id: String,
}

#[derive(Debug, Deserialize)]
pub struct RenameRequest {
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct ChatDetailsQuery {
    pub populate: Option<bool>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatSummary {
    pub id: String,
    pub is_group: bool,
    pub name: String,
    pub avatar: Vec<String>,
    pub members: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupSummary {
    pub id: String,
    pub is_group: bool,
    pub name: String,
    pub avatar: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberDetails {
    pub id: String,
    pub name: String,
    pub avatar: Option<String>,
}

// --- Handlers ---

/// POST /api/chat/group
/// Create a group chat. The creator is appended to the supplied members,
/// so at least 2 must be given for the group to start at the 3-member
/// minimum.
pub async fn new_group(
    State(state): State<AppState>,
    claims: Claims,
    Json(body): Json<NewGroupRequest>,
) -> ApiResult<(StatusCode, Json<serde_json::Value>)> {
    let name = body.name.trim().to_string();
    if name.is_empty() {
        return Err(ApiError::Validation("Please enter a group name".to_string()));
    }
    if body.members.len() < 2 {
        return Err(ApiError::Validation(
            "Group chat must have at least 2 members".to_string(),
        ));
    }
    if body.members.len() + 1 > MAX_GROUP_MEMBERS {
        return Err(ApiError::Capacity(
            "Max limit of group members reached".to_string(),
        ));
    }

    let creator = claims.sub.clone();
    let mut all_members = body.members.clone();
    all_members.push(creator.clone());

    let db = state.db.clone();
    let group_name = name.clone();
    let members_for_db = all_members.clone();
    tokio::task::spawn_blocking(move || {
        let conn = db.lock().map_err(|_| ApiError::Internal)?;
        store::insert_chat(&conn, &group_name, true, Some(&creator), &members_for_db)?;
        Ok::<_, ApiError>(())
    })
    .await??;

    state.router.route(
        &all_members,
        &ServerEvent::Alert(AlertPayload::Text(format!("Welcome to {} group", name))),
    );
    state.router.route(&body.members, &ServerEvent::RefetchChats);

    Ok((
        StatusCode::CREATED,
        Json(json!({ "success": true, "message": "Group created" })),
    ))
}

/// GET /api/chat/my
/// All chats for the requester. Direct chats present the other member's
/// name and avatar; groups show up to three member avatars.
pub async fn my_chats(
    State(state): State<AppState>,
    claims: Claims,
) -> ApiResult<Json<serde_json::Value>> {
    let db = state.db.clone();
    let requester = claims.sub;
    let chats = tokio::task::spawn_blocking(move || {
        let conn = db.lock().map_err(|_| ApiError::Internal)?;

        let mut stmt = conn.prepare(
            "SELECT c.id, c.name, c.is_group FROM chats c
             JOIN chat_members cm ON cm.chat_id = c.id
             WHERE cm.user_id = ?1
             ORDER BY c.created_at DESC",
        )?;
        let rows: Vec<(String, String, bool)> = stmt
            .query_map(rusqlite::params![requester], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get::<_, i64>(2)? != 0))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut chats = Vec::with_capacity(rows.len());
        for (chat_id, name, is_group) in rows {
            let members = member_details(&conn, &chat_id)?;
            let others: Vec<&MemberDetails> =
                members.iter().filter(|m| m.id != requester).collect();

            let (display_name, avatar) = if is_group {
                (
                    name,
                    members
                        .iter()
                        .take(3)
                        .filter_map(|m| m.avatar.clone())
                        .collect(),
                )
            } else {
                match others.first() {
                    Some(other) => (
                        other.name.clone(),
                        other.avatar.clone().into_iter().collect(),
                    ),
                    None => (name, Vec::new()),
                }
            };

            chats.push(ChatSummary {
                id: chat_id,
                is_group,
                name: display_name,
                avatar,
                members: others.iter().map(|m| m.id.clone()).collect(),
            });
        }
        Ok::<_, ApiError>(chats)
    })
    .await??;

    Ok(Json(json!({ "success": true, "chats": chats })))
}

/// GET /api/chat/my/groups
/// Groups created by the requester.
pub async fn my_groups(
    State(state): State<AppState>,
    claims: Claims,
) -> ApiResult<Json<serde_json::Value>> {
    let db = state.db.clone();
    let requester = claims.sub;
    let groups = tokio::task::spawn_blocking(move || {
        let conn = db.lock().map_err(|_| ApiError::Internal)?;

        let mut stmt = conn.prepare(
            "SELECT c.id, c.name FROM chats c
             JOIN chat_members cm ON cm.chat_id = c.id
             WHERE cm.user_id = ?1 AND c.is_group = 1 AND c.creator_id = ?1
             ORDER BY c.created_at DESC",
        )?;
        let rows: Vec<(String, String)> = stmt
            .query_map(rusqlite::params![requester], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut groups = Vec::with_capacity(rows.len());
        for (chat_id, name) in rows {
            let members = member_details(&conn, &chat_id)?;
            groups.push(GroupSummary {
                id: chat_id,
                is_group: true,
                name,
                avatar: members
                    .iter()
                    .take(3)
                    .filter_map(|m| m.avatar.clone())
                    .collect(),
            });
        }
        Ok::<_, ApiError>(groups)
    })
    .await??;

    Ok(Json(json!({ "success": true, "groups": groups })))
}

/// PUT /api/chat/add-members
/// Creator-only. Candidates already in the group (or unknown users) are
/// dropped; the capacity check runs before anything is persisted, so a
/// violation leaves the chat untouched.
pub async fn add_members(
    State(state): State<AppState>,
    claims: Claims,
    Json(body): Json<AddMembersRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    if body.members.is_empty() {
        return Err(ApiError::Validation("Please provide members".to_string()));
    }

    let db = state.db.clone();
    let chat_id = body.chat_id.clone();
    let requester = claims.sub;
    let candidates = body.members;
    let (updated_members, added_names) = tokio::task::spawn_blocking(move || {
        let conn = db.lock().map_err(|_| ApiError::Internal)?;

        let chat = store::chat_by_id(&conn, &chat_id)?
            .ok_or_else(|| ApiError::NotFound("Chat not found".to_string()))?;
        if !chat.is_group {
            return Err(ApiError::Validation(
                "This is not a group chat".to_string(),
            ));
        }
        if chat.creator_id.as_deref() != Some(requester.as_str()) {
            return Err(ApiError::Forbidden(
                "You are not allowed to add members".to_string(),
            ));
        }

        let current = store::member_ids(&conn, &chat_id)?;

        // Keep only known users not already in the group, dropping
        // duplicates within the request itself.
        let mut unique: Vec<(String, String)> = Vec::new();
        for candidate in candidates {
            if current.iter().any(|m| m == &candidate)
                || unique.iter().any(|(id, _)| id == &candidate)
            {
                continue;
            }
            if let Some(name) = store::user_name(&conn, &candidate)? {
                unique.push((candidate, name));
            }
        }

        if current.len() + unique.len() > MAX_GROUP_MEMBERS {
            return Err(ApiError::Capacity(
                "Max limit of group members reached".to_string(),
            ));
        }

        let ids: Vec<String> = unique.iter().map(|(id, _)| id.clone()).collect();
        let names: Vec<String> = unique.into_iter().map(|(_, name)| name).collect();
        store::add_members(&conn, &chat_id, &ids)?;
        let updated = store::member_ids(&conn, &chat_id)?;

        Ok::<_, ApiError>((updated, names))
    })
    .await??;

    if !added_names.is_empty() {
        state.router.route(
            &updated_members,
            &ServerEvent::Alert(AlertPayload::Text(format!(
                "{} has been added in the group",
                added_names.join(", ")
            ))),
        );
        state
            .router
            .route(&updated_members, &ServerEvent::RefetchChats);
    }

    Ok(Json(json!({
        "success": true,
        "message": "Users added successfully",
    })))
}

/// PUT /api/chat/remove-member
/// Creator-only. Rejected while the group sits at the 3-member minimum.
pub async fn remove_member(
    State(state): State<AppState>,
    claims: Claims,
    Json(body): Json<RemoveMemberRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let db = state.db.clone();
    let chat_id = body.chat_id.clone();
    let target = body.user_id.clone();
    let requester = claims.sub;
    let (previous_members, remaining_members, target_name) =
        tokio::task::spawn_blocking(move || {
            let conn = db.lock().map_err(|_| ApiError::Internal)?;

            let chat = store::chat_by_id(&conn, &chat_id)?
                .ok_or_else(|| ApiError::NotFound("Chat not found".to_string()))?;
            if !chat.is_group {
                return Err(ApiError::Validation(
                    "This is not a group chat".to_string(),
                ));
            }
            if chat.creator_id.as_deref() != Some(requester.as_str()) {
                return Err(ApiError::Forbidden(
                    "You are not allowed to remove members".to_string(),
                ));
            }
            let target_name = store::user_name(&conn, &target)?
                .ok_or_else(|| ApiError::NotFound("User not found".to_string()))?;

            let previous = store::member_ids(&conn, &chat_id)?;
            if previous.len() <= MIN_GROUP_MEMBERS {
                return Err(ApiError::Capacity(
                    "Group must have at least 3 members".to_string(),
                ));
            }

            store::remove_member(&conn, &chat_id, &target)?;
            let remaining = store::member_ids(&conn, &chat_id)?;

            Ok::<_, ApiError>((previous, remaining, target_name))
        })
        .await??;

    state.router.route(
        &remaining_members,
        &ServerEvent::Alert(AlertPayload::Scoped {
            message: format!("{} has been removed from the group", target_name),
            chat_id: body.chat_id.clone(),
        }),
    );
    state
        .router
        .route(&previous_members, &ServerEvent::RefetchChats);

    Ok(Json(json!({
        "success": true,
        "message": "Member removed successfully",
    })))
}

/// DELETE /api/chat/leave/{id}
/// Leave a group. Blocked at the 3-member minimum; a departing creator
/// hands the group to the first remaining member in stored order.
pub async fn leave_group(
    State(state): State<AppState>,
    claims: Claims,
    Path(chat_id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let db = state.db.clone();
    let cid = chat_id.clone();
    let requester = claims.sub;
    let (remaining_members, leaver_name) = tokio::task::spawn_blocking(move || {
        let conn = db.lock().map_err(|_| ApiError::Internal)?;

        let chat = store::chat_by_id(&conn, &cid)?
            .ok_or_else(|| ApiError::NotFound("Chat not found".to_string()))?;
        if !chat.is_group {
            return Err(ApiError::Validation(
                "This is not a group chat".to_string(),
            ));
        }

        let members = store::member_ids(&conn, &cid)?;
        if !members.iter().any(|m| m == &requester) {
            return Err(ApiError::Forbidden(
                "You are not a member of this group".to_string(),
            ));
        }
        if members.len() <= MIN_GROUP_MEMBERS {
            return Err(ApiError::Capacity(
                "Group must have at least 3 members".to_string(),
            ));
        }

        let remaining: Vec<String> = members
            .iter()
            .filter(|m| *m != &requester)
            .cloned()
            .collect();

        if chat.creator_id.as_deref() == Some(requester.as_str()) {
            // Arbitrary tie-break: stored order decides the new creator.
            if let Some(new_creator) = remaining.first() {
                store::set_creator(&conn, &cid, new_creator)?;
            }
        }
        store::remove_member(&conn, &cid, &requester)?;

        let leaver_name = store::user_name(&conn, &requester)?.unwrap_or(requester);
        Ok::<_, ApiError>((remaining, leaver_name))
    })
    .await??;

    state.router.route(
        &remaining_members,
        &ServerEvent::Alert(AlertPayload::Scoped {
            message: format!("{} has left the group", leaver_name),
            chat_id,
        }),
    );

    Ok(Json(json!({
        "success": true,
        "message": "Left group successfully",
    })))
}

/// PUT /api/chat/{id}
/// Rename a group. Creator-only.
pub async fn rename_group(
    State(state): State<AppState>,
    claims: Claims,
    Path(chat_id): Path<String>,
    Json(body): Json<RenameRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let name = body.name.trim().to_string();
    if name.is_empty() {
        return Err(ApiError::Validation("Please enter a new name".to_string()));
    }

    let db = state.db.clone();
    let cid = chat_id.clone();
    let requester = claims.sub;
    let members = tokio::task::spawn_blocking(move || {
        let conn = db.lock().map_err(|_| ApiError::Internal)?;

        let chat = store::chat_by_id(&conn, &cid)?
            .ok_or_else(|| ApiError::NotFound("Chat not found".to_string()))?;
        if !chat.is_group {
            return Err(ApiError::Validation(
                "This is not a group chat".to_string(),
            ));
        }
        if chat.creator_id.as_deref() != Some(requester.as_str()) {
            return Err(ApiError::Forbidden(
                "You are not allowed to rename the group".to_string(),
            ));
        }

        store::rename_chat(&conn, &cid, &name)?;
        Ok::<_, ApiError>(store::member_ids(&conn, &cid)?)
    })
    .await??;

    state.router.route(&members, &ServerEvent::RefetchChats);

    Ok(Json(json!({
        "success": true,
        "message": "Group name changed successfully",
    })))
}

/// GET /api/chat/{id}?populate=true
/// Chat details; `populate` expands member ids into display records.
pub async fn chat_details(
    State(state): State<AppState>,
    claims: Claims,
    Path(chat_id): Path<String>,
    Query(query): Query<ChatDetailsQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let populate = query.populate.unwrap_or(false);

    let db = state.db.clone();
    let requester = claims.sub;
    let chat = tokio::task::spawn_blocking(move || {
        let conn = db.lock().map_err(|_| ApiError::Internal)?;

        let chat = store::chat_by_id(&conn, &chat_id)?
            .ok_or_else(|| ApiError::NotFound("Chat not found".to_string()))?;
        if !store::is_member(&conn, &chat_id, &requester)? {
            return Err(ApiError::Forbidden(
                "You are not a member of this chat".to_string(),
            ));
        }

        let members = if populate {
            serde_json::to_value(member_details(&conn, &chat_id)?).map_err(|_| ApiError::Internal)?
        } else {
            serde_json::to_value(store::member_ids(&conn, &chat_id)?)
                .map_err(|_| ApiError::Internal)?
        };

        Ok::<_, ApiError>(json!({
            "id": chat.id,
            "name": chat.name,
            "isGroup": chat.is_group,
            "creatorId": chat.creator_id,
            "members": members,
        }))
    })
    .await??;

    Ok(Json(json!({ "success": true, "chat": chat })))
}

/// Member display records in stored order.
fn member_details(
    conn: &rusqlite::Connection,
    chat_id: &str,
) -> Result<Vec<MemberDetails>, rusqlite::Error> {
    let mut stmt = conn.prepare(
        "SELECT u.id, u.name, u.avatar_url FROM chat_members cm
         JOIN users u ON u.id = cm.user_id
         WHERE cm.chat_id = ?1
         ORDER BY cm.position",
    )?;
    let result = stmt
        .query_map(rusqlite::params![chat_id], |row| {
            Ok(MemberDetails {
                id: row.get(0)?,
                name: row.get(1)?,
                avatar: row.get(2)?,
            })
        })?
        .collect();
    result
}
