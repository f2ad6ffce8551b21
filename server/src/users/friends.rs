//! Friend requests and the direct-chat formation they drive.
//!
//! A request exists at most once per unordered user pair and is destroyed
//! on accept or reject. Accepting creates the 2-member direct chat that
//! the rest of the system treats as a friendship.

use axum::extract::{Query, State};
use axum::Json;
use chrono::Utc;
use rusqlite::OptionalExtension;
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use crate::auth::middleware::Claims;
use crate::chat::store;
use crate::db::models::FriendRequestRow;
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;
use crate::ws::protocol::ServerEvent;

// --- Request types ---

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendRequestBody {
    pub user_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AcceptRequestBody {
    pub request_id: String,
    pub accept: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FriendsQuery {
    pub chat_id: Option<String>,
}

// --- Handlers ---

/// PUT /api/user/send-request
pub async fn send_request(
    State(state): State<AppState>,
    claims: Claims,
    Json(body): Json<SendRequestBody>,
) -> ApiResult<Json<serde_json::Value>> {
    let sender = claims.sub;
    let receiver = body.user_id;
    if receiver == sender {
        return Err(ApiError::Validation(
            "You cannot send a request to yourself".to_string(),
        ));
    }

    let db = state.db.clone();
    let sender_for_db = sender.clone();
    let receiver_for_db = receiver.clone();
    tokio::task::spawn_blocking(move || {
        let conn = db.lock().map_err(|_| ApiError::Internal)?;

        store::user_name(&conn, &receiver_for_db)?
            .ok_or_else(|| ApiError::NotFound("User not found".to_string()))?;

        // One request per unordered pair, whichever side sent it.
        let existing: Option<String> = conn
            .query_row(
                "SELECT id FROM friend_requests
                 WHERE (sender_id = ?1 AND receiver_id = ?2)
                    OR (sender_id = ?2 AND receiver_id = ?1)",
                rusqlite::params![sender_for_db, receiver_for_db],
                |row| row.get(0),
            )
            .optional()?;
        if existing.is_some() {
            return Err(ApiError::Conflict("Request already sent".to_string()));
        }

        conn.execute(
            "INSERT INTO friend_requests (id, sender_id, receiver_id, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![
                Uuid::new_v4().to_string(),
                sender_for_db,
                receiver_for_db,
                Utc::now().to_rfc3339()
            ],
        )?;
        Ok::<_, ApiError>(())
    })
    .await??;

    state
        .router
        .route(std::slice::from_ref(&receiver), &ServerEvent::NewRequest);

    Ok(Json(json!({
        "success": true,
        "message": "Friend request sent",
    })))
}

/// PUT /api/user/accept-request
/// Only the receiver may respond. Accepting forms the direct chat and
/// refreshes both members' chat lists; rejecting just drops the request.
pub async fn accept_request(
    State(state): State<AppState>,
    claims: Claims,
    Json(body): Json<AcceptRequestBody>,
) -> ApiResult<Json<serde_json::Value>> {
    let db = state.db.clone();
    let request_id = body.request_id.clone();
    let requester = claims.sub;
    let accept = body.accept;

    let outcome = tokio::task::spawn_blocking(move || {
        let conn = db.lock().map_err(|_| ApiError::Internal)?;

        let request = conn
            .query_row(
                "SELECT id, sender_id, receiver_id FROM friend_requests WHERE id = ?1",
                rusqlite::params![request_id],
                |row| {
                    Ok(FriendRequestRow {
                        id: row.get(0)?,
                        sender_id: row.get(1)?,
                        receiver_id: row.get(2)?,
                    })
                },
            )
            .optional()?
            .ok_or_else(|| ApiError::NotFound("Request not found".to_string()))?;
        let FriendRequestRow {
            sender_id,
            receiver_id,
            ..
        } = request;

        if receiver_id != requester {
            return Err(ApiError::Unauthorized(
                "You are not authorized to accept this request".to_string(),
            ));
        }

        if !accept {
            conn.execute(
                "DELETE FROM friend_requests WHERE id = ?1",
                rusqlite::params![request_id],
            )?;
            return Ok::<_, ApiError>(None);
        }

        let sender_name = store::user_name(&conn, &sender_id)?
            .ok_or_else(|| ApiError::NotFound("User not found".to_string()))?;
        let receiver_name = store::user_name(&conn, &receiver_id)?
            .ok_or_else(|| ApiError::NotFound("User not found".to_string()))?;

        let members = vec![sender_id.clone(), receiver_id];
        store::insert_chat(
            &conn,
            &format!("{}-{}", sender_name, receiver_name),
            false,
            None,
            &members,
        )?;
        conn.execute(
            "DELETE FROM friend_requests WHERE id = ?1",
            rusqlite::params![request_id],
        )?;

        Ok(Some((members, sender_id)))
    })
    .await??;

    match outcome {
        Some((members, sender_id)) => {
            state.router.route(&members, &ServerEvent::RefetchChats);
            Ok(Json(json!({
                "success": true,
                "message": "Friend request accepted",
                "senderId": sender_id,
            })))
        }
        None => Ok(Json(json!({
            "success": true,
            "message": "Friend request deleted",
        }))),
    }
}

/// GET /api/user/notifications
/// Pending requests addressed to the requester.
pub async fn notifications(
    State(state): State<AppState>,
    claims: Claims,
) -> ApiResult<Json<serde_json::Value>> {
    let db = state.db.clone();
    let requester = claims.sub;
    let requests = tokio::task::spawn_blocking(move || {
        let conn = db.lock().map_err(|_| ApiError::Internal)?;

        let mut stmt = conn.prepare(
            "SELECT r.id, u.id, u.name, u.avatar_url
             FROM friend_requests r
             JOIN users u ON u.id = r.sender_id
             WHERE r.receiver_id = ?1
             ORDER BY r.created_at DESC",
        )?;
        let requests: Vec<serde_json::Value> = stmt
            .query_map(rusqlite::params![requester], |row| {
                Ok(json!({
                    "id": row.get::<_, String>(0)?,
                    "sender": {
                        "id": row.get::<_, String>(1)?,
                        "name": row.get::<_, String>(2)?,
                        "avatar": row.get::<_, Option<String>>(3)?,
                    },
                }))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok::<_, ApiError>(requests)
    })
    .await??;

    Ok(Json(json!({ "success": true, "requests": requests })))
}

/// GET /api/user/friends?chatId=
/// Friends are the other members of the requester's direct chats. With
/// `chatId`, the list is narrowed to friends not already in that chat
/// (candidates for an add-members picker).
pub async fn friends(
    State(state): State<AppState>,
    claims: Claims,
    Query(query): Query<FriendsQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let db = state.db.clone();
    let requester = claims.sub;
    let chat_filter = query.chat_id;

    let friends = tokio::task::spawn_blocking(move || {
        let conn = db.lock().map_err(|_| ApiError::Internal)?;

        let mut stmt = conn.prepare(
            "SELECT u.id, u.name, u.avatar_url
             FROM chats c
             JOIN chat_members cm ON cm.chat_id = c.id
             JOIN users u ON u.id = cm.user_id
             WHERE c.is_group = 0
               AND cm.user_id != ?1
               AND c.id IN (SELECT chat_id FROM chat_members WHERE user_id = ?1)
             ORDER BY u.name",
        )?;
        let mut friends: Vec<(String, String, Option<String>)> = stmt
            .query_map(rusqlite::params![requester], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        if let Some(chat_id) = chat_filter {
            let members = store::member_ids(&conn, &chat_id)?;
            friends.retain(|(id, _, _)| !members.iter().any(|m| m == id));
        }

        let friends: Vec<serde_json::Value> = friends
            .into_iter()
            .map(|(id, name, avatar)| json!({ "id": id, "name": name, "avatar": avatar }))
            .collect();
        Ok::<_, ApiError>(friends)
    })
    .await??;

    Ok(Json(json!({ "success": true, "friends": friends })))
}
