//! Presence tracking: the set of users currently viewing an active chat.
//!
//! Presence is distinct from connection liveness — a connected user is only
//! "online" here after a CHAT_JOINED signal. The set is informational
//! payload for ONLINE_USERS broadcasts; routing always goes through the
//! connection registry, never through this set.

use dashmap::DashSet;

/// Process-wide online-users set. Ephemeral — rebuilt from zero on restart.
#[derive(Debug, Default)]
pub struct PresenceTracker {
    online: DashSet<String>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Idempotent insert.
    pub fn mark_online(&self, user_id: &str) {
        self.online.insert(user_id.to_string());
    }

    /// Idempotent removal. Also called on disconnect so a crashed client
    /// that never sent CHAT_LEAVED still goes offline.
    pub fn mark_offline(&self, user_id: &str) {
        self.online.remove(user_id);
    }

    /// Current membership for broadcast payloads.
    pub fn snapshot(&self) -> Vec<String> {
        self.online.iter().map(|entry| entry.key().clone()).collect()
    }
}
