//! Connection registry: maps a user id to its single live WebSocket
//! connection. A user has at most one registration; a reconnect replaces
//! the previous one (the orphaned connection stays alive until its own
//! actor tears it down).

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;

use crate::ws::ConnectionSender;

/// Opaque identifier for one live connection, unique for the process
/// lifetime. Captured by the actor at connect time so disconnect cleanup
/// can tell its own registration apart from a newer one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionId(u64);

#[derive(Debug)]
struct Registration {
    id: ConnectionId,
    sender: ConnectionSender,
}

/// Process-wide user → connection map. Constructed once at startup and
/// injected through `AppState`.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: DashMap<String, Registration>,
    next_id: AtomicU64,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Associate a user with a connection, replacing any prior association.
    /// Returns the id the caller must hand back to `unregister`.
    pub fn register(&self, user_id: &str, sender: ConnectionSender) -> ConnectionId {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.connections
            .insert(user_id.to_string(), Registration { id, sender });
        tracing::debug!(user_id = %user_id, connection = id.0, "connection registered");
        id
    }

    /// Resolve users to live connection senders, preserving input order.
    /// Users with no live connection are silently omitted — this is the
    /// expected case for offline recipients.
    pub fn resolve(&self, users: &[String]) -> Vec<ConnectionSender> {
        users
            .iter()
            .filter_map(|user| self.connections.get(user).map(|reg| reg.sender.clone()))
            .collect()
    }

    /// Remove the association, but only when it still belongs to the given
    /// connection. A user who reconnected before the old connection's
    /// teardown completed keeps the newer registration. Returns whether an
    /// entry was removed.
    pub fn unregister(&self, user_id: &str, connection: ConnectionId) -> bool {
        let removed = self
            .connections
            .remove_if(user_id, |_, reg| reg.id == connection)
            .is_some();
        tracing::debug!(user_id = %user_id, connection = connection.0, removed, "connection unregistered");
        removed
    }

    /// Snapshot of all currently registered user ids.
    pub fn connected_users(&self) -> Vec<String> {
        self.connections
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn channel() -> (
        ConnectionSender,
        mpsc::UnboundedReceiver<axum::extract::ws::Message>,
    ) {
        mpsc::unbounded_channel()
    }

    #[test]
    fn resolve_returns_most_recent_registration() {
        let registry = ConnectionRegistry::new();
        let (tx_old, _rx_old) = channel();
        let (tx_new, mut rx_new) = channel();

        registry.register("u1", tx_old);
        registry.register("u1", tx_new);

        let resolved = registry.resolve(&["u1".to_string()]);
        assert_eq!(resolved.len(), 1);

        resolved[0]
            .send(axum::extract::ws::Message::Text("hi".into()))
            .unwrap();
        assert!(rx_new.try_recv().is_ok());
    }

    #[test]
    fn resolve_omits_offline_users_preserving_order() {
        let registry = ConnectionRegistry::new();
        let (tx_a, _rx_a) = channel();
        let (tx_c, _rx_c) = channel();
        registry.register("a", tx_a);
        registry.register("c", tx_c);

        let resolved = registry.resolve(&[
            "a".to_string(),
            "offline".to_string(),
            "c".to_string(),
        ]);
        assert_eq!(resolved.len(), 2);
    }

    #[test]
    fn unregister_is_noop_for_absent_user() {
        let registry = ConnectionRegistry::new();
        let (tx, _rx) = channel();
        let id = registry.register("u1", tx);
        assert!(!registry.unregister("nobody", id));
    }

    #[test]
    fn stale_unregister_keeps_newer_registration() {
        let registry = ConnectionRegistry::new();
        let (tx_old, _rx_old) = channel();
        let (tx_new, _rx_new) = channel();

        let old_id = registry.register("u1", tx_old);
        // User reconnects before the old connection's teardown runs.
        let _new_id = registry.register("u1", tx_new);

        assert!(!registry.unregister("u1", old_id));
        assert_eq!(registry.resolve(&["u1".to_string()]).len(), 1);
    }

    #[test]
    fn unregister_removes_own_registration() {
        let registry = ConnectionRegistry::new();
        let (tx, _rx) = channel();
        let id = registry.register("u1", tx);

        assert!(registry.unregister("u1", id));
        assert!(registry.resolve(&["u1".to_string()]).is_empty());
    }
}
