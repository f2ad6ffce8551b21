//! Shared chat/message queries used by both the HTTP handlers and the
//! real-time message path. All functions are synchronous and expect to run
//! inside `tokio::task::spawn_blocking`.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use crate::db::models::ChatRow;
use crate::storage::StoredFile;

pub fn chat_by_id(conn: &Connection, chat_id: &str) -> rusqlite::Result<Option<ChatRow>> {
    conn.query_row(
        "SELECT id, name, is_group, creator_id, created_at FROM chats WHERE id = ?1",
        params![chat_id],
        |row| {
            Ok(ChatRow {
                id: row.get(0)?,
                name: row.get(1)?,
                is_group: row.get::<_, i64>(2)? != 0,
                creator_id: row.get(3)?,
                created_at: row.get(4)?,
            })
        },
    )
    .optional()
}

/// Member ids in stored (insertion) order.
pub fn member_ids(conn: &Connection, chat_id: &str) -> rusqlite::Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT user_id FROM chat_members WHERE chat_id = ?1 ORDER BY position",
    )?;
    let members = stmt
        .query_map(params![chat_id], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(members)
}

pub fn is_member(conn: &Connection, chat_id: &str, user_id: &str) -> rusqlite::Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM chat_members WHERE chat_id = ?1 AND user_id = ?2",
        params![chat_id, user_id],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

/// Create a chat with its ordered member list. Returns the new chat id.
pub fn insert_chat(
    conn: &Connection,
    name: &str,
    is_group: bool,
    creator_id: Option<&str>,
    members: &[String],
) -> rusqlite::Result<String> {
    let chat_id = Uuid::new_v4().to_string();
    let now = Utc::now().to_rfc3339();

    conn.execute(
        "INSERT INTO chats (id, name, is_group, creator_id, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
        params![chat_id, name, is_group as i64, creator_id, now],
    )?;

    for (position, user_id) in members.iter().enumerate() {
        conn.execute(
            "INSERT INTO chat_members (chat_id, user_id, position) VALUES (?1, ?2, ?3)",
            params![chat_id, user_id, position as i64],
        )?;
    }

    Ok(chat_id)
}

/// Append members after the current highest position.
pub fn add_members(conn: &Connection, chat_id: &str, user_ids: &[String]) -> rusqlite::Result<()> {
    let next_position: i64 = conn.query_row(
        "SELECT COALESCE(MAX(position), -1) + 1 FROM chat_members WHERE chat_id = ?1",
        params![chat_id],
        |row| row.get(0),
    )?;

    for (offset, user_id) in user_ids.iter().enumerate() {
        conn.execute(
            "INSERT INTO chat_members (chat_id, user_id, position) VALUES (?1, ?2, ?3)",
            params![chat_id, user_id, next_position + offset as i64],
        )?;
    }
    Ok(())
}

pub fn remove_member(conn: &Connection, chat_id: &str, user_id: &str) -> rusqlite::Result<()> {
    conn.execute(
        "DELETE FROM chat_members WHERE chat_id = ?1 AND user_id = ?2",
        params![chat_id, user_id],
    )?;
    Ok(())
}

pub fn set_creator(conn: &Connection, chat_id: &str, user_id: &str) -> rusqlite::Result<()> {
    conn.execute(
        "UPDATE chats SET creator_id = ?1 WHERE id = ?2",
        params![user_id, chat_id],
    )?;
    Ok(())
}

pub fn rename_chat(conn: &Connection, chat_id: &str, name: &str) -> rusqlite::Result<()> {
    conn.execute(
        "UPDATE chats SET name = ?1 WHERE id = ?2",
        params![name, chat_id],
    )?;
    Ok(())
}

/// Delete a chat; members, messages, and attachment rows cascade.
pub fn delete_chat(conn: &Connection, chat_id: &str) -> rusqlite::Result<()> {
    conn.execute("DELETE FROM chats WHERE id = ?1", params![chat_id])?;
    Ok(())
}

pub fn user_name(conn: &Connection, user_id: &str) -> rusqlite::Result<Option<String>> {
    conn.query_row(
        "SELECT name FROM users WHERE id = ?1",
        params![user_id],
        |row| row.get(0),
    )
    .optional()
}

/// A message ready to persist, with any stored attachments.
#[derive(Debug)]
pub struct NewMessage<'a> {
    pub chat_id: &'a str,
    pub sender_id: &'a str,
    pub content: &'a str,
    pub attachments: &'a [StoredFile],
}

/// Persist a message plus its attachment rows. Returns the persisted
/// message id and creation timestamp.
pub fn insert_message(conn: &Connection, message: &NewMessage<'_>) -> rusqlite::Result<(String, String)> {
    let message_id = Uuid::new_v4().to_string();
    let now = Utc::now().to_rfc3339();

    conn.execute(
        "INSERT INTO messages (id, chat_id, sender_id, content, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
        params![message_id, message.chat_id, message.sender_id, message.content, now],
    )?;

    for (position, file) in message.attachments.iter().enumerate() {
        conn.execute(
            "INSERT INTO attachments (id, message_id, public_id, url, position) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                Uuid::new_v4().to_string(),
                message_id,
                file.public_id,
                file.url,
                position as i64
            ],
        )?;
    }

    Ok((message_id, now))
}

pub fn count_messages(conn: &Connection, chat_id: &str) -> rusqlite::Result<i64> {
    conn.query_row(
        "SELECT COUNT(*) FROM messages WHERE chat_id = ?1",
        params![chat_id],
        |row| row.get(0),
    )
}

/// All attachment store ids referenced by a chat's messages, for object
/// store cleanup before the chat row (and its cascade) is deleted.
pub fn chat_attachment_public_ids(conn: &Connection, chat_id: &str) -> rusqlite::Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT a.public_id FROM attachments a
         JOIN messages m ON a.message_id = m.id
         WHERE m.chat_id = ?1",
    )?;
    let ids = stmt
        .query_map(params![chat_id], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ids)
}
