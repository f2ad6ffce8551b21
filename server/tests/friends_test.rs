//! Integration tests for friend requests and the direct chats they form.

use futures_util::StreamExt;
use serde_json::json;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;

use parley_server::db::DbPool;

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

async fn send_request(addr: SocketAddr, token: &str, user_id: &str) -> reqwest::Response {
    reqwest::Client::new()
        .put(format!("http://{}/api/user/send-request", addr))
        .header("Authorization", format!("Bearer {}", token))
        .json(&json!({ "userId": user_id }))
        .send()
        .await
        .unwrap()
}

async fn notifications(addr: SocketAddr, token: &str) -> serde_json::Value {
    reqwest::Client::new()
        .get(format!("http://{}/api/user/notifications", addr))
        .header("Authorization", format!("Bearer {}", token))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap()
}

async fn my_chats(addr: SocketAddr, token: &str) -> serde_json::Value {
    reqwest::Client::new()
        .get(format!("http://{}/api/chat/my", addr))
        .header("Authorization", format!("Bearer {}", token))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap()
}

// =============================================================================
// Tests
// =============================================================================

#[tokio::test]
async fn test_accepting_request_forms_direct_chat() {
    let (addr, db, secret) = start_test_server().await;
    let t1 = seed_user(&db, &secret, "u1", "U1");
    let t2 = seed_user(&db, &secret, "u2", "U2");

    let resp = send_request(addr, &t1, "u2").await;
    assert_eq!(resp.status(), 200);

    let body = notifications(addr, &t2).await;
    let requests = body["requests"].as_array().unwrap();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0]["sender"]["id"], "u1");
    let request_id = requests[0]["id"].as_str().unwrap().to_string();

    let resp = reqwest::Client::new()
        .put(format!("http://{}/api/user/accept-request", addr))
        .header("Authorization", format!("Bearer {}", t2))
        .json(&json!({ "requestId": request_id, "accept": true }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["senderId"], "u1");

    // Both sides now share one non-group chat.
    for token in [&t1, &t2] {
        let body = my_chats(addr, token).await;
        let chats = body["chats"].as_array().unwrap();
        assert_eq!(chats.len(), 1);
        assert_eq!(chats[0]["isGroup"], false);
    }

    // The request is destroyed on accept.
    let body = notifications(addr, &t2).await;
    assert!(body["requests"].as_array().unwrap().is_empty());

    // Both members count as friends now.
    let body: serde_json::Value = reqwest::Client::new()
        .get(format!("http://{}/api/user/friends", addr))
        .header("Authorization", format!("Bearer {}", t1))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let friends = body["friends"].as_array().unwrap();
    assert_eq!(friends.len(), 1);
    assert_eq!(friends[0]["id"], "u2");
}

#[tokio::test]
async fn test_duplicate_request_is_conflict_in_both_directions() {
    let (addr, db, secret) = start_test_server().await;
    let t1 = seed_user(&db, &secret, "u1", "U1");
    let t2 = seed_user(&db, &secret, "u2", "U2");

    assert_eq!(send_request(addr, &t1, "u2").await.status(), 200);
    assert_eq!(send_request(addr, &t1, "u2").await.status(), 400);
    // The reverse direction is the same unordered pair.
    assert_eq!(send_request(addr, &t2, "u1").await.status(), 400);
}

#[tokio::test]
async fn test_only_receiver_may_respond() {
    let (addr, db, secret) = start_test_server().await;
    let t1 = seed_user(&db, &secret, "u1", "U1");
    let t2 = seed_user(&db, &secret, "u2", "U2");

    send_request(addr, &t1, "u2").await;
    let body = notifications(addr, &t2).await;
    let request_id = body["requests"][0]["id"].as_str().unwrap().to_string();

    let resp = reqwest::Client::new()
        .put(format!("http://{}/api/user/accept-request", addr))
        .header("Authorization", format!("Bearer {}", t1))
        .json(&json!({ "requestId": request_id, "accept": true }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);
}

#[tokio::test]
async fn test_rejection_destroys_request_without_chat() {
    let (addr, db, secret) = start_test_server().await;
    let t1 = seed_user(&db, &secret, "u1", "U1");
    let t2 = seed_user(&db, &secret, "u2", "U2");

    send_request(addr, &t1, "u2").await;
    let body = notifications(addr, &t2).await;
    let request_id = body["requests"][0]["id"].as_str().unwrap().to_string();

    let resp = reqwest::Client::new()
        .put(format!("http://{}/api/user/accept-request", addr))
        .header("Authorization", format!("Bearer {}", t2))
        .json(&json!({ "requestId": request_id, "accept": false }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let body = notifications(addr, &t2).await;
    assert!(body["requests"].as_array().unwrap().is_empty());

    let body = my_chats(addr, &t2).await;
    assert!(body["chats"].as_array().unwrap().is_empty());

    // Pair is free again after rejection.
    assert_eq!(send_request(addr, &t1, "u2").await.status(), 200);
}

#[tokio::test]
async fn test_receiver_gets_new_request_event() {
    let (addr, db, secret) = start_test_server().await;
    let t1 = seed_user(&db, &secret, "u1", "U1");
    let t2 = seed_user(&db, &secret, "u2", "U2");

    let (mut ws2, _) =
        tokio_tungstenite::connect_async(format!("ws://{}/ws?token={}", addr, t2))
            .await
            .unwrap();

    send_request(addr, &t1, "u2").await;

    let msg = tokio::time::timeout(Duration::from_secs(2), ws2.next())
        .await
        .expect("timed out waiting for NEW_REQUEST")
        .unwrap()
        .unwrap();
    match msg {
        Message::Text(text) => {
            let event: serde_json::Value = serde_json::from_str(&text).unwrap();
            assert_eq!(event["event"], "NEW_REQUEST");
        }
        other => panic!("unexpected frame: {:?}", other),
    }
}

#[tokio::test]
async fn test_request_to_unknown_user_is_not_found() {
    let (addr, db, secret) = start_test_server().await;
    let t1 = seed_user(&db, &secret, "u1", "U1");
    assert_eq!(send_request(addr, &t1, "ghost").await.status(), 404);
}
