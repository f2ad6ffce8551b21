//! Account endpoints: signup, login, profile, logout, user search.
//!
//! Sessions are stateless bearer tokens; logout exists for client parity
//! and invalidates nothing server-side.

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::Utc;
use rusqlite::OptionalExtension;
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::auth::jwt;
use crate::auth::middleware::Claims;
use crate::db::models::UserRow;
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

// --- Request / Response types ---

#[derive(Debug, Deserialize)]
pub struct SignupRequest {
    pub name: String,
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub bio: String,
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct SearchQuery {
    pub name: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct UserResponse {
    pub id: String,
    pub name: String,
    pub username: String,
    pub bio: String,
    pub avatar: Option<String>,
}

impl From<UserRow> for UserResponse {
    fn from(row: UserRow) -> Self {
        Self {
            id: row.id,
            name: row.name,
            username: row.username,
            bio: row.bio,
            avatar: row.avatar_url,
        }
    }
}

// --- Handlers ---

/// POST /api/user/signup
pub async fn signup(
    State(state): State<AppState>,
    Json(body): Json<SignupRequest>,
) -> ApiResult<(StatusCode, Json<serde_json::Value>)> {
    let name = body.name.trim().to_string();
    let username = body.username.trim().to_string();
    if name.is_empty() {
        return Err(ApiError::Validation("Please enter name".to_string()));
    }
    if username.is_empty() {
        return Err(ApiError::Validation("Please enter username".to_string()));
    }
    if body.password.is_empty() {
        return Err(ApiError::Validation("Please enter password".to_string()));
    }

    let db = state.db.clone();
    let bio = body.bio.clone();
    let password = body.password.clone();
    let (user, user_id) = tokio::task::spawn_blocking(move || {
        // bcrypt is deliberately slow; keep it off the async workers.
        let password_hash =
            bcrypt::hash(&password, bcrypt::DEFAULT_COST).map_err(|_| ApiError::Internal)?;

        let conn = db.lock().map_err(|_| ApiError::Internal)?;
        let user_id = Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();

        conn.execute(
            "INSERT INTO users (id, name, username, password_hash, bio, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            rusqlite::params![user_id, name, username, password_hash, bio, now],
        )
        .map_err(|err| match err {
            rusqlite::Error::SqliteFailure(e, _)
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                ApiError::Conflict("Username already taken".to_string())
            }
            other => other.into(),
        })?;

        let user = UserResponse {
            id: user_id.clone(),
            name,
            username,
            bio,
            avatar: None,
        };
        Ok::<_, ApiError>((user, user_id))
    })
    .await??;

    let token = jwt::issue_access_token(&state.jwt_secret, &user_id)
        .map_err(|_| ApiError::Internal)?;

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "success": true,
            "message": "User created",
            "user": user,
            "token": token,
        })),
    ))
}

/// POST /api/user/login
pub async fn login(
    State(state): State<AppState>,
    Json(body): Json<LoginRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let db = state.db.clone();
    let username = body.username.clone();
    let password = body.password.clone();

    let user = tokio::task::spawn_blocking(move || {
        let row = {
            let conn = db.lock().map_err(|_| ApiError::Internal)?;
            conn.query_row(
                "SELECT id, name, username, password_hash, bio, avatar_url
                 FROM users WHERE username = ?1",
                rusqlite::params![username],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, Option<String>>(5)?,
                    ))
                },
            )
            .optional()?
        };

        let (id, name, username, password_hash, bio, avatar) = row.ok_or_else(invalid_credentials)?;

        let matched = bcrypt::verify(&password, &password_hash).map_err(|_| ApiError::Internal)?;
        if !matched {
            return Err(invalid_credentials());
        }

        Ok::<_, ApiError>(UserResponse {
            id,
            name,
            username,
            bio,
            avatar,
        })
    })
    .await??;

    let token =
        jwt::issue_access_token(&state.jwt_secret, &user.id).map_err(|_| ApiError::Internal)?;

    Ok(Json(json!({
        "success": true,
        "message": "Welcome back",
        "user": user,
        "token": token,
    })))
}

fn invalid_credentials() -> ApiError {
    ApiError::NotFound("Invalid username or password".to_string())
}

/// GET /api/user/profile
pub async fn profile(
    State(state): State<AppState>,
    claims: Claims,
) -> ApiResult<Json<serde_json::Value>> {
    let db = state.db.clone();
    let user_id = claims.sub;
    let user = tokio::task::spawn_blocking(move || {
        let conn = db.lock().map_err(|_| ApiError::Internal)?;
        let row = conn
            .query_row(
                "SELECT id, name, username, bio, avatar_url, created_at FROM users WHERE id = ?1",
                rusqlite::params![user_id],
                |row| {
                    Ok(UserRow {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        username: row.get(2)?,
                        bio: row.get(3)?,
                        avatar_url: row.get(4)?,
                        created_at: row.get(5)?,
                    })
                },
            )
            .optional()?
            .ok_or_else(|| ApiError::NotFound("User not found".to_string()))?;
        Ok::<_, ApiError>(UserResponse::from(row))
    })
    .await??;

    Ok(Json(json!({ "success": true, "user": user })))
}

/// GET /api/user/logout
pub async fn logout(_claims: Claims) -> Json<serde_json::Value> {
    Json(json!({
        "success": true,
        "message": "User logged out successfully",
    }))
}

/// GET /api/user/search?name=
/// Users matching the name fragment, excluding the requester and anyone
/// already sharing a direct chat with them.
pub async fn search(
    State(state): State<AppState>,
    claims: Claims,
    Query(query): Query<SearchQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let db = state.db.clone();
    let requester = claims.sub;
    let fragment = query.name.unwrap_or_default();

    let users = tokio::task::spawn_blocking(move || {
        let conn = db.lock().map_err(|_| ApiError::Internal)?;

        let pattern = format!("%{}%", fragment);
        let mut stmt = conn.prepare(
            "SELECT id, name, avatar_url FROM users
             WHERE id != ?1
               AND name LIKE ?2
               AND id NOT IN (
                   SELECT cm.user_id FROM chat_members cm
                   JOIN chats c ON c.id = cm.chat_id
                   WHERE c.is_group = 0 AND cm.chat_id IN (
                       SELECT chat_id FROM chat_members WHERE user_id = ?1
                   )
               )
             ORDER BY name",
        )?;
        let users: Vec<serde_json::Value> = stmt
            .query_map(rusqlite::params![requester, pattern], |row| {
                Ok(json!({
                    "id": row.get::<_, String>(0)?,
                    "name": row.get::<_, String>(1)?,
                    "avatar": row.get::<_, Option<String>>(2)?,
                }))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok::<_, ApiError>(users)
    })
    .await??;

    Ok(Json(json!({ "success": true, "users": users })))
}
