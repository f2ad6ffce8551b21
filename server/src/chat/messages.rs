//! Message pipeline: Received → Validated → Persisted → Broadcast.
//!
//! The real-time send path broadcasts first and persists in the
//! background — durability failure is logged, never surfaced, never
//! retried. The attachment path is the opposite: uploads and persistence
//! complete before the caller gets a response, because the response
//! carries the persisted message.

use axum::extract::{Multipart, Path, Query, State};
use axum::Json;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::auth::middleware::Claims;
use crate::chat::store;
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;
use crate::storage::UploadFile;
use crate::ws::protocol::{LiveAttachment, LiveMessage, LiveSender, ServerEvent};

/// Fixed message history window.
const PAGE_SIZE: i64 = 20;
/// Maximum attachments per message.
const MAX_ATTACHMENTS: usize = 5;

// --- Real-time send path (called from the WS protocol dispatcher) ---

/// Validate, broadcast, then persist a text message.
///
/// Recipients come from the stored chat membership, not the client's
/// member list. The broadcast happens regardless of persistence outcome;
/// a failed write is logged and the message survives only in the clients
/// that were connected.
pub async fn send_live_message(
    state: &AppState,
    sender_id: &str,
    sender_name: &str,
    chat_id: &str,
    content: String,
) {
    let db = state.db.clone();
    let cid = chat_id.to_string();
    let members = tokio::task::spawn_blocking(move || {
        let conn = db.lock().ok()?;
        store::chat_by_id(&conn, &cid).ok()??;
        store::member_ids(&conn, &cid).ok()
    })
    .await
    .ok()
    .flatten();

    let Some(members) = members else {
        tracing::warn!(chat_id = %chat_id, sender = %sender_id, "dropping message for unknown chat");
        return;
    };
    if !members.iter().any(|m| m == sender_id) {
        tracing::warn!(chat_id = %chat_id, sender = %sender_id, "dropping message from non-member");
        return;
    }

    // Generation-time id for the live projection, independent of the
    // persisted row's id.
    let live = LiveMessage {
        id: Uuid::new_v4().to_string(),
        content: content.clone(),
        attachments: Vec::new(),
        sender: LiveSender {
            id: sender_id.to_string(),
            name: sender_name.to_string(),
        },
        chat_id: chat_id.to_string(),
        created_at: Utc::now().to_rfc3339(),
    };

    state.router.route(
        &members,
        &ServerEvent::NewMessage {
            chat_id: chat_id.to_string(),
            message: live,
        },
    );
    state.router.route(
        &members,
        &ServerEvent::NewMessageAlert {
            chat_id: chat_id.to_string(),
        },
    );

    // Fire-and-forget persistence — the broadcast above already happened.
    let db = state.db.clone();
    let cid = chat_id.to_string();
    let sid = sender_id.to_string();
    tokio::task::spawn_blocking(move || {
        let Ok(conn) = db.lock() else {
            tracing::error!(chat_id = %cid, "database lock poisoned, message not persisted");
            return;
        };
        let message = store::NewMessage {
            chat_id: &cid,
            sender_id: &sid,
            content: &content,
            attachments: &[],
        };
        if let Err(err) = store::insert_message(&conn, &message) {
            tracing::error!(chat_id = %cid, error = %err, "message persistence failed after broadcast");
        }
    });
}

// --- Request / Response types ---

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageResponse {
    pub id: String,
    pub content: String,
    pub attachments: Vec<LiveAttachment>,
    pub sender: LiveSender,
    pub chat_id: String,
    pub created_at: String,
}

#[derive(Debug, Serialize)]
pub struct SendAttachmentsResponse {
    pub success: bool,
    pub message: MessageResponse,
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub page: Option<u32>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryResponse {
    pub success: bool,
    pub messages: Vec<MessageResponse>,
    pub total_pages: i64,
}

// --- Handlers ---

/// POST /api/chat/message
/// Send a message with attachments (multipart: `chatId` text field plus
/// 1–5 `files` parts). Uploads go to the object store first — any upload
/// failure aborts the whole operation with no broadcast. Persistence is
/// awaited so the response carries the stored message.
pub async fn send_attachments(
    State(state): State<AppState>,
    claims: Claims,
    mut multipart: Multipart,
) -> ApiResult<Json<SendAttachmentsResponse>> {
    let mut chat_id: Option<String> = None;
    let mut files: Vec<UploadFile> = Vec::new();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|_| ApiError::Validation("Malformed multipart body".to_string()))?
    {
        match field.name() {
            Some("chatId") => {
                let text = field
                    .text()
                    .await
                    .map_err(|_| ApiError::Validation("Malformed chatId field".to_string()))?;
                chat_id = Some(text);
            }
            Some("files") => {
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|_| ApiError::Validation("Malformed file field".to_string()))?;
                files.push(UploadFile {
                    bytes: bytes.to_vec(),
                });
            }
            _ => {}
        }
    }

    let chat_id = chat_id.ok_or_else(|| ApiError::Validation("Please enter chatId".to_string()))?;
    if files.is_empty() {
        return Err(ApiError::Validation("Provide attachments".to_string()));
    }
    if files.len() > MAX_ATTACHMENTS {
        return Err(ApiError::Validation(
            "Attachments should be less than 5".to_string(),
        ));
    }

    // Validate chat and sender before touching the object store.
    let db = state.db.clone();
    let cid = chat_id.clone();
    let sender_id = claims.sub.clone();
    let (members, sender_name) = tokio::task::spawn_blocking(move || {
        let conn = db.lock().map_err(|_| ApiError::Internal)?;
        store::chat_by_id(&conn, &cid)?
            .ok_or_else(|| ApiError::NotFound("Chat not found".to_string()))?;
        if !store::is_member(&conn, &cid, &sender_id)? {
            return Err(ApiError::Forbidden(
                "You are not a member of this chat".to_string(),
            ));
        }
        let name = store::user_name(&conn, &sender_id)?
            .ok_or_else(|| ApiError::NotFound("User not found".to_string()))?;
        let members = store::member_ids(&conn, &cid)?;
        Ok::<_, ApiError>((members, name))
    })
    .await??;

    // Upload failure (including timeout) aborts everything: no persisted
    // message, no broadcast.
    let stored = state.storage.upload(files).await?;

    let db = state.db.clone();
    let cid = chat_id.clone();
    let sender_id = claims.sub.clone();
    let stored_for_db = stored.clone();
    let (message_id, created_at) = tokio::task::spawn_blocking(move || {
        let conn = db.lock().map_err(|_| ApiError::Internal)?;
        let message = store::NewMessage {
            chat_id: &cid,
            sender_id: &sender_id,
            content: "",
            attachments: &stored_for_db,
        };
        Ok::<_, ApiError>(store::insert_message(&conn, &message)?)
    })
    .await??;

    let attachments: Vec<LiveAttachment> = stored
        .iter()
        .map(|file| LiveAttachment {
            id: file.public_id.clone(),
            url: file.url.clone(),
        })
        .collect();

    let live = LiveMessage {
        id: message_id.clone(),
        content: String::new(),
        attachments: attachments.clone(),
        sender: LiveSender {
            id: claims.sub.clone(),
            name: sender_name.clone(),
        },
        chat_id: chat_id.clone(),
        created_at: created_at.clone(),
    };

    state.router.route(
        &members,
        &ServerEvent::NewMessage {
            chat_id: chat_id.clone(),
            message: live,
        },
    );
    state.router.route(
        &members,
        &ServerEvent::NewMessageAlert {
            chat_id: chat_id.clone(),
        },
    );

    let response = SendAttachmentsResponse {
        success: true,
        message: MessageResponse {
            id: message_id,
            content: String::new(),
            attachments,
            sender: LiveSender {
                id: claims.sub,
                name: sender_name,
            },
            chat_id,
            created_at,
        },
    };

    Ok(Json(response))
}

/// GET /api/chat/message/{id}?page={n}
/// Paged message history: windows of 20, newest page first, each page
/// delivered oldest-to-newest.
pub async fn get_messages(
    State(state): State<AppState>,
    claims: Claims,
    Path(chat_id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> ApiResult<Json<HistoryResponse>> {
    let page = i64::from(query.page.unwrap_or(1).max(1));

    let db = state.db.clone();
    let requester = claims.sub;
    let response = tokio::task::spawn_blocking(move || {
        let conn = db.lock().map_err(|_| ApiError::Internal)?;

        store::chat_by_id(&conn, &chat_id)?
            .ok_or_else(|| ApiError::NotFound("Chat not found".to_string()))?;
        if !store::is_member(&conn, &chat_id, &requester)? {
            return Err(ApiError::Forbidden(
                "You are not allowed to read the chat".to_string(),
            ));
        }

        let total = store::count_messages(&conn, &chat_id)?;
        let total_pages = (total + PAGE_SIZE - 1) / PAGE_SIZE;
        let offset = (page - 1) * PAGE_SIZE;

        let mut stmt = conn.prepare(
            "SELECT m.id, m.content, m.sender_id, u.name, m.created_at
             FROM messages m
             LEFT JOIN users u ON m.sender_id = u.id
             WHERE m.chat_id = ?1
             ORDER BY m.created_at DESC, m.rowid DESC
             LIMIT ?2 OFFSET ?3",
        )?;

        let mut messages: Vec<MessageResponse> = stmt
            .query_map(rusqlite::params![chat_id, PAGE_SIZE, offset], |row| {
                Ok(MessageResponse {
                    id: row.get(0)?,
                    content: row.get(1)?,
                    attachments: Vec::new(),
                    sender: LiveSender {
                        id: row.get(2)?,
                        name: row.get::<_, Option<String>>(3)?.unwrap_or_default(),
                    },
                    chat_id: chat_id.clone(),
                    created_at: row.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        for message in &mut messages {
            let mut stmt = conn.prepare(
                "SELECT public_id, url FROM attachments WHERE message_id = ?1 ORDER BY position",
            )?;
            message.attachments = stmt
                .query_map(rusqlite::params![message.id], |row| {
                    Ok(LiveAttachment {
                        id: row.get(0)?,
                        url: row.get(1)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
        }

        // Query is newest-first for paging; clients render oldest-first.
        messages.reverse();

        Ok::<_, ApiError>(HistoryResponse {
            success: true,
            messages,
            total_pages,
        })
    })
    .await??;

    Ok(Json(response))
}

/// DELETE /api/chat/{id}
/// Delete a chat with all its messages and attachments. Group chats may
/// only be deleted by their creator; direct chats by either member.
pub async fn delete_chat(
    State(state): State<AppState>,
    claims: Claims,
    Path(chat_id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let db = state.db.clone();
    let cid = chat_id.clone();
    let requester = claims.sub;
    let (members, public_ids) = tokio::task::spawn_blocking(move || {
        let conn = db.lock().map_err(|_| ApiError::Internal)?;

        let chat = store::chat_by_id(&conn, &cid)?
            .ok_or_else(|| ApiError::NotFound("Chat not found".to_string()))?;
        let members = store::member_ids(&conn, &cid)?;

        if chat.is_group && chat.creator_id.as_deref() != Some(requester.as_str()) {
            return Err(ApiError::Forbidden(
                "You are not allowed to delete the group".to_string(),
            ));
        }
        if !chat.is_group && !members.iter().any(|m| m == &requester) {
            return Err(ApiError::Forbidden(
                "You are not allowed to delete the chat".to_string(),
            ));
        }

        let public_ids = store::chat_attachment_public_ids(&conn, &cid)?;
        store::delete_chat(&conn, &cid)?;

        Ok::<_, ApiError>((members, public_ids))
    })
    .await??;

    state.storage.delete(&public_ids).await;

    // Exactly one refresh signal, to the member list captured before the
    // deletion.
    state.router.route(&members, &ServerEvent::RefetchChats);

    Ok(Json(serde_json::json!({
        "success": true,
        "message": "Chat deleted successfully",
    })))
}
