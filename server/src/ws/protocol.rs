//! Typed WebSocket event protocol.
//!
//! Every event name carries an explicit payload variant; frames are JSON
//! text of the form `{"event": NAME, "data": PAYLOAD}`. Inbound frames
//! that fail to decode are logged and dropped — real-time-path errors have
//! no response channel.

use serde::{Deserialize, Serialize};

use crate::chat;
use crate::state::AppState;

/// Events a client may send to the server.
#[derive(Debug, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ClientEvent {
    /// New chat message. The member list a client supplies is ignored for
    /// routing — recipients are resolved from the stored chat membership.
    #[serde(rename = "NEW_MESSAGE")]
    NewMessage {
        #[serde(rename = "chatId")]
        chat_id: String,
        #[serde(default)]
        members: Vec<String>,
        message: String,
    },

    /// The user opened an active chat view.
    #[serde(rename = "CHAT_JOINED")]
    ChatJoined {
        #[serde(rename = "userId")]
        user_id: String,
        members: Vec<String>,
    },

    /// The user left the active chat view.
    #[serde(rename = "CHAT_LEAVED")]
    ChatLeaved {
        #[serde(rename = "userId")]
        user_id: String,
        members: Vec<String>,
    },
}

/// Events the server pushes to clients.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data")]
pub enum ServerEvent {
    #[serde(rename = "NEW_MESSAGE")]
    NewMessage {
        #[serde(rename = "chatId")]
        chat_id: String,
        message: LiveMessage,
    },

    /// Lightweight unread-count nudge accompanying every NEW_MESSAGE.
    #[serde(rename = "NEW_MESSAGE_ALERT")]
    NewMessageAlert {
        #[serde(rename = "chatId")]
        chat_id: String,
    },

    #[serde(rename = "ONLINE_USERS")]
    OnlineUsers(Vec<String>),

    #[serde(rename = "ALERT")]
    Alert(AlertPayload),

    /// Signal only — recipients refetch their chat list over HTTP.
    #[serde(rename = "REFETCH_CHATS")]
    RefetchChats,

    /// A friend request arrived for the recipient.
    #[serde(rename = "NEW_REQUEST")]
    NewRequest,
}

/// ALERT carries either a bare text or a chat-scoped message.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum AlertPayload {
    Text(String),
    Scoped {
        message: String,
        #[serde(rename = "chatId")]
        chat_id: String,
    },
}

/// Real-time projection of a message: denormalized sender display fields
/// for delivery, never persisted as-is.
#[derive(Debug, Clone, Serialize)]
pub struct LiveMessage {
    pub id: String,
    pub content: String,
    pub attachments: Vec<LiveAttachment>,
    pub sender: LiveSender,
    #[serde(rename = "chatId")]
    pub chat_id: String,
    #[serde(rename = "createdAt")]
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct LiveAttachment {
    pub id: String,
    pub url: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct LiveSender {
    pub id: String,
    pub name: String,
}

/// Handle an incoming text frame: decode the typed event and dispatch.
pub async fn handle_text_frame(text: &str, state: &AppState, user_id: &str, user_name: &str) {
    let event = match serde_json::from_str::<ClientEvent>(text) {
        Ok(event) => event,
        Err(err) => {
            tracing::warn!(user_id = %user_id, error = %err, "undecodable client event");
            return;
        }
    };

    dispatch(event, state, user_id, user_name).await;
}

async fn dispatch(event: ClientEvent, state: &AppState, user_id: &str, user_name: &str) {
    match event {
        ClientEvent::NewMessage {
            chat_id,
            members: _,
            message,
        } => {
            chat::messages::send_live_message(state, user_id, user_name, &chat_id, message).await;
        }
        ClientEvent::ChatJoined { user_id, members } => {
            state.presence.mark_online(&user_id);
            state
                .router
                .route(&members, &ServerEvent::OnlineUsers(state.presence.snapshot()));
        }
        ClientEvent::ChatLeaved { user_id, members } => {
            state.presence.mark_offline(&user_id);
            state
                .router
                .route(&members, &ServerEvent::OnlineUsers(state.presence.snapshot()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_new_message_decodes() {
        let frame = r#"{"event":"NEW_MESSAGE","data":{"chatId":"c1","members":["a","b"],"message":"hi"}}"#;
        let event: ClientEvent = serde_json::from_str(frame).unwrap();
        match event {
            ClientEvent::NewMessage {
                chat_id, message, ..
            } => {
                assert_eq!(chat_id, "c1");
                assert_eq!(message, "hi");
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn unknown_event_name_fails_to_decode() {
        let frame = r#"{"event":"SELF_DESTRUCT","data":{}}"#;
        assert!(serde_json::from_str::<ClientEvent>(frame).is_err());
    }

    #[test]
    fn alert_serializes_both_shapes() {
        let text = ServerEvent::Alert(AlertPayload::Text("Welcome to Trip group".into()));
        let json = serde_json::to_value(&text).unwrap();
        assert_eq!(json["event"], "ALERT");
        assert_eq!(json["data"], "Welcome to Trip group");

        let scoped = ServerEvent::Alert(AlertPayload::Scoped {
            message: "U2 has been removed from the group".into(),
            chat_id: "c1".into(),
        });
        let json = serde_json::to_value(&scoped).unwrap();
        assert_eq!(json["data"]["chatId"], "c1");
    }

    #[test]
    fn online_users_event_uses_wire_name() {
        let event = ServerEvent::OnlineUsers(vec!["u1".into()]);
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "ONLINE_USERS");
        assert_eq!(json["data"][0], "u1");
    }
}
