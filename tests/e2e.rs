//! End-to-end tests driving live client sessions against a started server.

use std::time::Duration;

use leasy_client::{ChatSession, SessionConfig, SessionEvent};
use leasy_core::ids::UserId;
use leasy_core::wire::{ChatPayload, RoutingIdentity};
use leasy_server::{ServerConfig, ServerHandle};
use leasy_store::Database;
use tokio::sync::broadcast;

async fn start_server() -> (ServerHandle, String) {
    let handle = leasy_server::start(
        ServerConfig {
            port: 0,
            ..Default::default()
        },
        Database::in_memory().unwrap(),
    )
    .await
    .unwrap();
    let base = format!("http://127.0.0.1:{}", handle.port);
    (handle, base)
}

async fn seed_user(base: &str, firstname: &str, lastname: &str) -> UserId {
    let body: serde_json::Value = reqwest::Client::new()
        .post(format!("{base}/users"))
        .json(&serde_json::json!({"firstname": firstname, "lastname": lastname}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    UserId::from_raw(body["user"]["id"].as_str().unwrap())
}

async fn create_conversation(base: &str, host: &UserId, applicant: &UserId) {
    let resp = reqwest::Client::new()
        .post(format!("{base}/chat/create"))
        .json(&serde_json::json!({
            "host_id": host,
            "applicant_id": applicant,
        }))
        .send()
        .await
        .unwrap();
    assert!(resp.status().is_success());
}

fn session(base: &str, sender: &UserId, counterparty: &UserId, origin: &str) -> ChatSession {
    ChatSession::connect(SessionConfig::new(
        base,
        RoutingIdentity {
            sender: sender.clone(),
            counterparty: counterparty.clone(),
            origin: origin.into(),
        },
    ))
}

/// Poll /health until the expected number of connections is registered.
async fn wait_for_connections(base: &str, expected: u64) {
    let client = reqwest::Client::new();
    for _ in 0..100 {
        let body: serde_json::Value = client
            .get(format!("{base}/health"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        if body["connections"].as_u64() == Some(expected) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("expected {expected} registered connections");
}

/// Wait for the next pushed message on a session's event stream.
async fn recv_message(rx: &mut broadcast::Receiver<SessionEvent>) -> Option<ChatPayload> {
    let deadline = Duration::from_secs(5);
    tokio::time::timeout(deadline, async {
        loop {
            match rx.recv().await {
                Ok(SessionEvent::Message(payload)) => return Some(payload),
                Ok(_) => continue,
                Err(_) => return None,
            }
        }
    })
    .await
    .unwrap_or(None)
}

#[tokio::test]
async fn live_push_fans_out_per_origin_and_dedups_within_origin() {
    let (_handle, base) = start_server().await;
    let host = seed_user(&base, "Hanna", "Host").await;
    let applicant = seed_user(&base, "Arno", "Applicant").await;
    create_conversation(&base, &host, &applicant).await;

    // The applicant has three windows open towards the host: one overview
    // tab and the chat page opened twice under the same origin tag.
    let overview = session(&base, &applicant, &host, "overview");
    let chat_one = session(&base, &applicant, &host, "chat");
    let chat_two = session(&base, &applicant, &host, "chat");
    let mut overview_rx = overview.subscribe();
    let mut chat_one_rx = chat_one.subscribe();
    let mut chat_two_rx = chat_two.subscribe();

    // The host's own window
    let host_session = session(&base, &host, &applicant, "chat");
    let mut host_rx = host_session.subscribe();

    wait_for_connections(&base, 4).await;

    let stored = host_session.send_text("hello").await.unwrap();
    assert_eq!(stored.text.as_deref(), Some("hello"));

    // Distinct origin: exactly one copy
    let received = recv_message(&mut overview_rx).await.expect("overview push");
    assert_eq!(received.text.as_deref(), Some("hello"));
    assert_eq!(received.sender, host);

    // Identical origin twice: exactly one of the two receives it
    let one = recv_message(&mut chat_one_rx).await;
    let two = recv_message(&mut chat_two_rx).await;
    assert_eq!(
        usize::from(one.is_some()) + usize::from(two.is_some()),
        1,
        "same-origin duplicate window must receive exactly one copy"
    );

    // The sender's own window never sees its push come back
    assert!(recv_message(&mut host_rx).await.is_none());

    // Local transcript reflects the confirmed send
    assert_eq!(host_session.transcript().len(), 1);
}

#[tokio::test]
async fn unread_marker_set_for_offline_recipient_and_cleared_on_open() {
    let (_handle, base) = start_server().await;
    let host = seed_user(&base, "Hanna", "Host").await;
    let applicant = seed_user(&base, "Arno", "Applicant").await;
    create_conversation(&base, &host, &applicant).await;

    // The applicant is offline; the host sends anyway.
    let host_session = session(&base, &host, &applicant, "chat");
    wait_for_connections(&base, 1).await;
    host_session.send_text("hello").await.unwrap();

    // The applicant's profile now flags the host as unread.
    let client = reqwest::Client::new();
    let profile: serde_json::Value = client
        .get(format!("{base}/users/{applicant}"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let unread = profile["user"]["unread_from"].as_array().unwrap();
    assert_eq!(unread.len(), 1);
    assert_eq!(unread[0], host.as_str());

    // The applicant comes online and opens the conversation: the message is
    // there via the pull path and the flag is cleared.
    let applicant_session = session(&base, &applicant, &host, "chat");
    let conversation = applicant_session.open().await.unwrap();
    assert_eq!(conversation.messages.len(), 1);
    assert_eq!(conversation.messages[0].text.as_deref(), Some("hello"));

    let profile: serde_json::Value = client
        .get(format!("{base}/users/{applicant}"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(profile["user"]["unread_from"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn unresolvable_announce_is_never_registered() {
    let (_handle, base) = start_server().await;
    // Only one of the two identities exists.
    let host = seed_user(&base, "Hanna", "Host").await;
    let ghost = UserId::from_raw("user_ghost");

    let _session = session(&base, &host, &ghost, "chat");

    // Give the handshake time to be rejected; the registry must stay empty.
    tokio::time::sleep(Duration::from_millis(500)).await;
    let body: serde_json::Value = reqwest::Client::new()
        .get(format!("{base}/health"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["connections"], 0);
}

#[tokio::test]
async fn conversation_create_is_idempotent_across_role_order() {
    let (_handle, base) = start_server().await;
    let host = seed_user(&base, "Hanna", "Host").await;
    let applicant = seed_user(&base, "Arno", "Applicant").await;

    let client = reqwest::Client::new();
    let first: serde_json::Value = client
        .post(format!("{base}/chat/create"))
        .json(&serde_json::json!({"host_id": &host, "applicant_id": &applicant}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let second: serde_json::Value = client
        .post(format!("{base}/chat/create"))
        .json(&serde_json::json!({"host_id": &applicant, "applicant_id": &host}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(first["conversation"]["id"], second["conversation"]["id"]);
}
