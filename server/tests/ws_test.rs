//! Integration tests for the real-time path: WebSocket auth, message
//! fan-out, presence signals, disconnect cleanup, and the
//! broadcast-before-persist guarantee.

use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;

use parley_server::chat::store;
use parley_server::db::DbPool;

type WsStream = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

async fn start_test_server() -> (SocketAddr, DbPool, Vec<u8>) {
    let tmp_dir = tempfile::tempdir().expect("Failed to create temp dir");
    let data_dir = tmp_dir.path().to_str().unwrap().to_string();

    let db = parley_server::db::init_db(&data_dir).expect("Failed to init DB");
    let jwt_secret = parley_server::auth::jwt::load_or_generate_jwt_secret(&data_dir)
        .expect("Failed to generate JWT secret");
    let store = parley_server::storage::AttachmentStore::new(
        &data_dir,
        "http://localhost:0".to_string(),
        Duration::from_secs(5),
    );

    let state = parley_server::state::AppState::new(db.clone(), store, jwt_secret.clone());
    let app = parley_server::routes::build_router(state);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
        let _keep = tmp_dir;
    });

    (addr, db, jwt_secret)
}

fn seed_user(db: &DbPool, jwt_secret: &[u8], id: &str, name: &str) -> String {
    let conn = db.lock().unwrap();
    conn.execute(
        "INSERT INTO users (id, name, username, password_hash, bio, created_at)
         VALUES (?1, ?2, ?3, 'x', '', ?4)",
        rusqlite::params![id, name, name, chrono::Utc::now().to_rfc3339()],
    )
    .unwrap();
    parley_server::auth::jwt::issue_access_token(jwt_secret, id).unwrap()
}

fn seed_direct_chat(db: &DbPool, a: &str, b: &str) -> String {
    let conn = db.lock().unwrap();
    store::insert_chat(
        &conn,
        &format!("{}-{}", a, b),
        false,
        None,
        &[a.to_string(), b.to_string()],
    )
    .unwrap()
}

async fn connect_ws(addr: SocketAddr, token: &str) -> WsStream {
    let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{}/ws?token={}", addr, token))
        .await
        .expect("WebSocket connect failed");
    ws
}

/// Read the next JSON event frame, panicking after the timeout.
async fn next_event(ws: &mut WsStream) -> serde_json::Value {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("timed out waiting for event")
            .expect("stream ended")
            .expect("ws error");
        match msg {
            Message::Text(text) => return serde_json::from_str(&text).unwrap(),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected frame: {:?}", other),
        }
    }
}

/// Assert that no event arrives within a short window.
async fn assert_silent(ws: &mut WsStream) {
    let result = tokio::time::timeout(Duration::from_millis(300), ws.next()).await;
    if let Ok(Some(Ok(Message::Text(text)))) = result {
        panic!("expected silence, got: {}", text);
    }
}

fn new_message_frame(chat_id: &str, members: &[&str], message: &str) -> Message {
    Message::Text(
        json!({
            "event": "NEW_MESSAGE",
            "data": { "chatId": chat_id, "members": members, "message": message },
        })
        .to_string()
        .into(),
    )
}

// =============================================================================
// Tests
// =============================================================================

#[tokio::test]
async fn test_invalid_token_is_closed_with_4002() {
    let (addr, _db, _secret) = start_test_server().await;

    let (mut ws, _) =
        tokio_tungstenite::connect_async(format!("ws://{}/ws?token=garbage", addr))
            .await
            .expect("upgrade should succeed before close");

    match tokio::time::timeout(Duration::from_secs(2), ws.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap()
    {
        Message::Close(Some(frame)) => assert_eq!(u16::from(frame.code), 4002),
        other => panic!("expected close frame, got {:?}", other),
    }
}

#[tokio::test]
async fn test_new_message_fans_out_to_chat_members() {
    let (addr, db, secret) = start_test_server().await;
    let t1 = seed_user(&db, &secret, "u1", "U1");
    let t2 = seed_user(&db, &secret, "u2", "U2");
    let chat_id = seed_direct_chat(&db, "u1", "u2");

    let mut ws1 = connect_ws(addr, &t1).await;
    let mut ws2 = connect_ws(addr, &t2).await;

    ws1.send(new_message_frame(&chat_id, &["u1", "u2"], "hello"))
        .await
        .unwrap();

    // NEW_MESSAGE arrives first, then the alert, at every member.
    let event = next_event(&mut ws2).await;
    assert_eq!(event["event"], "NEW_MESSAGE");
    assert_eq!(event["data"]["chatId"], chat_id.as_str());
    assert_eq!(event["data"]["message"]["content"], "hello");
    assert_eq!(event["data"]["message"]["sender"]["name"], "U1");

    let event = next_event(&mut ws2).await;
    assert_eq!(event["event"], "NEW_MESSAGE_ALERT");
    assert_eq!(event["data"]["chatId"], chat_id.as_str());

    let event = next_event(&mut ws1).await;
    assert_eq!(event["event"], "NEW_MESSAGE");

    // The fire-and-forget persistence lands shortly after the broadcast.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let conn = db.lock().unwrap();
    assert_eq!(store::count_messages(&conn, &chat_id).unwrap(), 1);
}

#[tokio::test]
async fn test_broadcast_happens_even_when_persistence_fails() {
    let (addr, db, secret) = start_test_server().await;
    let t1 = seed_user(&db, &secret, "u1", "U1");
    let t2 = seed_user(&db, &secret, "u2", "U2");
    let chat_id = seed_direct_chat(&db, "u1", "u2");

    // Break the write path after validation data is in place.
    {
        let conn = db.lock().unwrap();
        conn.execute_batch("DROP TABLE attachments; DROP TABLE messages;")
            .unwrap();
    }

    let mut ws1 = connect_ws(addr, &t1).await;
    let mut ws2 = connect_ws(addr, &t2).await;

    ws1.send(new_message_frame(&chat_id, &["u1", "u2"], "doomed write"))
        .await
        .unwrap();

    // Delivery must not depend on durability.
    let event = next_event(&mut ws2).await;
    assert_eq!(event["event"], "NEW_MESSAGE");
    assert_eq!(event["data"]["message"]["content"], "doomed write");
    let event = next_event(&mut ws2).await;
    assert_eq!(event["event"], "NEW_MESSAGE_ALERT");
}

#[tokio::test]
async fn test_non_member_sender_is_dropped() {
    let (addr, db, secret) = start_test_server().await;
    seed_user(&db, &secret, "u1", "U1");
    let t2 = seed_user(&db, &secret, "u2", "U2");
    let t3 = seed_user(&db, &secret, "u3", "U3");
    let chat_id = seed_direct_chat(&db, "u1", "u2");

    let mut ws2 = connect_ws(addr, &t2).await;
    let mut ws3 = connect_ws(addr, &t3).await;

    // u3 is not a member of the chat; nothing may reach u2.
    ws3.send(new_message_frame(&chat_id, &["u1", "u2"], "intruder"))
        .await
        .unwrap();

    assert_silent(&mut ws2).await;

    let conn = db.lock().unwrap();
    assert_eq!(store::count_messages(&conn, &chat_id).unwrap(), 0);
}

#[tokio::test]
async fn test_presence_join_and_leave_broadcast_online_users() {
    let (addr, db, secret) = start_test_server().await;
    let t1 = seed_user(&db, &secret, "u1", "U1");
    let t2 = seed_user(&db, &secret, "u2", "U2");

    let mut ws1 = connect_ws(addr, &t1).await;
    let mut ws2 = connect_ws(addr, &t2).await;

    ws1.send(Message::Text(
        json!({
            "event": "CHAT_JOINED",
            "data": { "userId": "u1", "members": ["u1", "u2"] },
        })
        .to_string()
        .into(),
    ))
    .await
    .unwrap();

    let event = next_event(&mut ws2).await;
    assert_eq!(event["event"], "ONLINE_USERS");
    let online = event["data"].as_array().unwrap();
    assert!(online.iter().any(|u| u.as_str() == Some("u1")));

    ws1.send(Message::Text(
        json!({
            "event": "CHAT_LEAVED",
            "data": { "userId": "u1", "members": ["u1", "u2"] },
        })
        .to_string()
        .into(),
    ))
    .await
    .unwrap();

    // Drain u1's own copy of the join broadcast, then check the leave.
    let _ = next_event(&mut ws1).await;
    let event = next_event(&mut ws2).await;
    assert_eq!(event["event"], "ONLINE_USERS");
    let online = event["data"].as_array().unwrap();
    assert!(!online.iter().any(|u| u.as_str() == Some("u1")));
}

#[tokio::test]
async fn test_disconnect_clears_presence_without_leave_signal() {
    let (addr, db, secret) = start_test_server().await;
    let t1 = seed_user(&db, &secret, "u1", "U1");
    let t2 = seed_user(&db, &secret, "u2", "U2");

    let mut ws1 = connect_ws(addr, &t1).await;
    let mut ws2 = connect_ws(addr, &t2).await;

    ws1.send(Message::Text(
        json!({
            "event": "CHAT_JOINED",
            "data": { "userId": "u1", "members": ["u1", "u2"] },
        })
        .to_string()
        .into(),
    ))
    .await
    .unwrap();
    let event = next_event(&mut ws2).await;
    assert_eq!(event["event"], "ONLINE_USERS");

    // Abrupt drop: no CHAT_LEAVED, just the socket going away.
    drop(ws1);

    let event = next_event(&mut ws2).await;
    assert_eq!(event["event"], "ONLINE_USERS");
    let online = event["data"].as_array().unwrap();
    assert!(
        !online.iter().any(|u| u.as_str() == Some("u1")),
        "disconnect must clear presence"
    );
}

#[tokio::test]
async fn test_chat_deletion_sends_one_refetch_to_former_members() {
    let (addr, db, secret) = start_test_server().await;
    let t1 = seed_user(&db, &secret, "u1", "U1");
    let t2 = seed_user(&db, &secret, "u2", "U2");
    let chat_id = seed_direct_chat(&db, "u1", "u2");

    let mut ws2 = connect_ws(addr, &t2).await;

    let resp = reqwest::Client::new()
        .delete(format!("http://{}/api/chat/{}", addr, chat_id))
        .header("Authorization", format!("Bearer {}", t1))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let event = next_event(&mut ws2).await;
    assert_eq!(event["event"], "REFETCH_CHATS");

    // Exactly one refresh signal.
    assert_silent(&mut ws2).await;
}

#[tokio::test]
async fn test_group_creation_alerts_members() {
    let (addr, db, secret) = start_test_server().await;
    let t1 = seed_user(&db, &secret, "u1", "U1");
    let t2 = seed_user(&db, &secret, "u2", "U2");
    seed_user(&db, &secret, "u3", "U3");

    let mut ws2 = connect_ws(addr, &t2).await;

    let resp = reqwest::Client::new()
        .post(format!("http://{}/api/chat/group", addr))
        .header("Authorization", format!("Bearer {}", t1))
        .json(&json!({ "name": "Trip", "members": ["u2", "u3"] }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 201);

    let event = next_event(&mut ws2).await;
    assert_eq!(event["event"], "ALERT");
    assert_eq!(event["data"], "Welcome to Trip group");

    let event = next_event(&mut ws2).await;
    assert_eq!(event["event"], "REFETCH_CHATS");
}
