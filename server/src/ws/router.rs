//! Event router: fan-out of server events to the live connections of a
//! recipient list.
//!
//! Delivery is at-most-once and best-effort: events are serialized once,
//! pushed onto each resolved connection's outbound channel, and forgotten.
//! No acknowledgement, no retry. Offline recipients see the data later
//! only through persisted-state fetches (message history, chat lists).

use std::sync::Arc;

use axum::extract::ws::Message;

use crate::ws::protocol::ServerEvent;
use crate::ws::registry::ConnectionRegistry;

#[derive(Debug, Clone)]
pub struct EventRouter {
    registry: Arc<ConnectionRegistry>,
}

impl EventRouter {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self { registry }
    }

    /// Deliver an event to every recipient with a live connection.
    /// Zero resolved connections is a no-op, not an error.
    pub fn route(&self, recipients: &[String], event: &ServerEvent) {
        let senders = self.registry.resolve(recipients);
        if senders.is_empty() {
            return;
        }

        let Some(frame) = encode(event) else { return };
        for sender in senders {
            // A send error means the connection is mid-teardown; the actor
            // cleans up its own registration.
            let _ = sender.send(frame.clone());
        }
    }

    /// Deliver an event to every registered connection.
    pub fn broadcast(&self, event: &ServerEvent) {
        let users = self.registry.connected_users();
        self.route(&users, event);
    }
}

fn encode(event: &ServerEvent) -> Option<Message> {
    match serde_json::to_string(event) {
        Ok(text) => Some(Message::Text(text.into())),
        Err(err) => {
            tracing::error!(error = %err, "failed to encode server event");
            None
        }
    }
}
