/// Database row types. These correspond 1:1 to the SQLite schema
/// defined in migrations.rs.

/// User record in the users table (password hash deliberately excluded;
/// the login path reads it ad hoc and never lets it escape the handler).
#[derive(Debug, Clone)]
pub struct UserRow {
    pub id: String,
    pub name: String,
    pub username: String,
    pub bio: String,
    pub avatar_url: Option<String>,
    pub created_at: String,
}

/// Group or direct chat
#[derive(Debug, Clone)]
pub struct ChatRow {
    pub id: String,
    pub name: String,
    pub is_group: bool,
    pub creator_id: Option<String>,
    pub created_at: String,
}

/// Pending friend request (destroyed on accept or reject)
#[derive(Debug, Clone)]
pub struct FriendRequestRow {
    pub id: String,
    pub sender_id: String,
    pub receiver_id: String,
}
