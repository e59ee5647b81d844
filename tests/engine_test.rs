// Connection lifecycle: handshake, single session, disconnect and presence

mod common;

use std::sync::Arc;

use common::*;
use rusty_relay::config::EngineConfig;
use rusty_relay::core::connection::{CloseCode, ConnectionPhase};
use rusty_relay::core::ConnectParams;
use rusty_relay::error::RelayError;
use rusty_relay::storage::Presence;

#[tokio::test]
async fn test_auth_success_without_room() {
    let harness = Harness::new().await;
    let token = harness.token(ALICE).await;

    let (mut alice, result) = harness.connect_with(ConnectParams::new(token)).await;
    assert!(result.is_ok());

    let frames = alice.drain();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0]["type"], "auth_success");
    assert_eq!(frames[0]["userId"], 1);
    assert_eq!(frames[0]["username"], "alice");

    assert_eq!(alice.conn.phase(), ConnectionPhase::Authenticated);
    assert!(harness.engine.registry().is_online(ALICE).await);
    assert_eq!(harness.store.presence(ALICE).await, Some(Presence::Online));
}

#[tokio::test]
async fn test_missing_token_closes_with_auth_failure() {
    let harness = Harness::new().await;

    let (mut client, result) = harness.connect_with(ConnectParams::default()).await;
    assert_eq!(result, Err(RelayError::MissingToken));
    assert_eq!(client.close_code(), Some(CloseCode::AuthFailed));

    let frames = client.drain();
    assert_eq!(frames[0]["type"], "error");
    assert_eq!(frames[0]["code"], "auth_failed");

    let (client, _) = harness.connect_with(ConnectParams::new("   ")).await;
    assert_eq!(client.close_code(), Some(CloseCode::AuthFailed));
    assert_eq!(harness.engine.metrics().snapshot().auth_failures, 2);
}

#[tokio::test]
async fn test_invalid_token_closes_with_auth_failure() {
    let harness = Harness::new().await;

    let (client, result) = harness
        .connect_with(ConnectParams::new("not-a-session"))
        .await;
    assert!(matches!(result, Err(RelayError::AuthError(_))));
    assert_eq!(client.close_code(), Some(CloseCode::AuthFailed));
    assert_eq!(harness.engine.registry().connection_count().await, 0);
    assert_eq!(harness.store.presence(ALICE).await, None);
}

#[tokio::test]
async fn test_malformed_room_id_closes_with_protocol_code() {
    let harness = Harness::new().await;
    let token = harness.token(ALICE).await;

    for raw in ["abc", "0", "-5", "5.5"] {
        let (mut client, result) = harness
            .connect_with(ConnectParams::new(token.clone()).with_room(raw))
            .await;
        assert!(matches!(result, Err(RelayError::InvalidField(_))));
        assert_eq!(client.close_code(), Some(CloseCode::ProtocolError));
        assert_eq!(client.drain()[0]["code"], "invalid_field");
    }
    assert!(!harness.engine.registry().is_online(ALICE).await);
}

#[tokio::test]
async fn test_unavailable_backend_rejects_before_registration() {
    let harness = Harness::new().await;
    let token = harness.token(ALICE).await;
    harness.store.set_offline(true);

    let (mut client, result) = harness.connect_with(ConnectParams::new(token)).await;
    assert!(matches!(result, Err(RelayError::ServiceUnavailable(_))));
    assert_eq!(client.close_code(), Some(CloseCode::ServiceUnavailable));
    assert_eq!(client.drain()[0]["code"], "service_unavailable");
    assert_eq!(harness.engine.registry().connection_count().await, 0);
}

#[tokio::test]
async fn test_connect_with_room_joins_it() {
    let harness = Harness::new().await;
    let token = harness.token(ALICE).await;

    let (mut alice, result) = harness
        .connect_with(ConnectParams::new(token).with_room(GENERAL))
        .await;
    assert!(result.is_ok());
    assert_eq!(alice.conn.room_id(), Some(GENERAL));

    let frames = alice.drain();
    let kinds: Vec<&str> = frames.iter().filter_map(|f| f["type"].as_str()).collect();
    assert_eq!(kinds, vec!["auth_success", "userJoined", "server_message"]);
    assert_eq!(frames[2]["text"], "You joined general");
}

#[tokio::test]
async fn test_failed_connect_join_keeps_connection_open() {
    let harness = Harness::new().await;
    let token = harness.token(CAROL).await;

    let (mut carol, result) = harness
        .connect_with(ConnectParams::new(token).with_room(GENERAL))
        .await;
    assert!(result.is_ok());
    assert_eq!(carol.close_code(), None);
    assert_eq!(carol.conn.phase(), ConnectionPhase::Authenticated);

    let errors = carol.drain_type("error");
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0]["code"], "not_room_member");
    assert_eq!(errors[0]["context"], "room_join");
    assert_eq!(errors[0]["roomId"], 5);
    assert!(!harness.engine.rooms().room_exists(GENERAL).await);
}

#[tokio::test]
async fn test_strict_connect_join_closes_forbidden() {
    let harness = Harness::with_config(EngineConfig {
        strict_connect_join: true,
        ..EngineConfig::default()
    })
    .await;
    let token = harness.token(CAROL).await;

    let (carol, result) = harness
        .connect_with(ConnectParams::new(token).with_room(GENERAL))
        .await;
    assert_eq!(result, Err(RelayError::NotRoomMember(GENERAL)));
    assert_eq!(carol.close_code(), Some(CloseCode::Forbidden));
}

#[tokio::test]
async fn test_second_session_supersedes_first() {
    let harness = Harness::new().await;
    let mut first = harness.joined(ALICE, GENERAL).await;
    let mut bob = harness.joined(BOB, GENERAL).await;
    first.drain();

    let second = harness.connect(ALICE).await;

    let errors = first.drain_type("error");
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0]["code"], "superseded");
    assert_eq!(first.close_code(), Some(CloseCode::Superseded));
    assert!(first.conn.is_closed());

    let live = harness.engine.registry().connections_for(ALICE).await;
    assert_eq!(live.len(), 1);
    assert_eq!(live[0].id, second.conn.id);

    // The old socket left the room it was in
    assert_eq!(harness.engine.rooms().member_count(GENERAL).await, 1);
    assert_eq!(bob.drain_type("userLeft").len(), 1);

    // Alice never went offline in between
    assert_eq!(harness.store.presence_log(ALICE).await, vec![Presence::Online]);
    assert_eq!(harness.engine.metrics().snapshot().sessions_superseded, 1);

    // The transport reporting the old socket closed later is a no-op
    harness.engine.disconnect(&first.conn).await;
    assert!(harness.engine.registry().is_online(ALICE).await);
}

#[tokio::test]
async fn test_disconnect_is_idempotent() {
    let harness = Harness::new().await;
    let alice = harness.joined(ALICE, GENERAL).await;
    let mut bob = harness.joined(BOB, GENERAL).await;

    harness.engine.disconnect(&alice.conn).await;
    harness.engine.disconnect(&alice.conn).await;
    harness.engine.on_error(&alice.conn, &RelayError::Internal("late".into())).await;

    assert_eq!(bob.drain_type("userLeft").len(), 1);
    assert_eq!(alice.close_code(), Some(CloseCode::Normal));
    assert_eq!(
        harness.store.presence_log(ALICE).await,
        vec![Presence::Online, Presence::Offline]
    );

    let leaves = harness
        .store
        .room_messages(GENERAL)
        .await
        .into_iter()
        .filter(|m| m.kind.as_str() == "system_leave")
        .count();
    assert_eq!(leaves, 1);
    assert_eq!(harness.engine.metrics().snapshot().connections_closed, 1);
}

#[tokio::test]
async fn test_presence_goes_offline_once_under_concurrent_closes() {
    let harness = Harness::new().await;
    let alice = harness.joined(ALICE, GENERAL).await;

    let mut handles = Vec::new();
    for _ in 0..8 {
        let engine = Arc::clone(&harness.engine);
        let conn = Arc::clone(&alice.conn);
        handles.push(tokio::spawn(async move { engine.disconnect(&conn).await }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(
        harness.store.presence_log(ALICE).await,
        vec![Presence::Online, Presence::Offline]
    );
    assert!(!harness.engine.rooms().room_exists(GENERAL).await);
    assert_eq!(harness.engine.registry().connection_count().await, 0);
}

#[tokio::test]
async fn test_presence_follows_reconnects() {
    let harness = Harness::new().await;

    for _ in 0..3 {
        let alice = harness.connect(ALICE).await;
        harness.engine.disconnect(&alice.conn).await;
    }

    assert_eq!(
        harness.store.presence_log(ALICE).await,
        vec![
            Presence::Online,
            Presence::Offline,
            Presence::Online,
            Presence::Offline,
            Presence::Online,
            Presence::Offline
        ]
    );
}

#[tokio::test]
async fn test_error_path_closes_connection() {
    let harness = Harness::new().await;
    let mut alice = harness.joined(ALICE, GENERAL).await;

    harness
        .engine
        .on_error(&alice.conn, &RelayError::Internal("boom".to_string()))
        .await;

    let errors = alice.drain_type("error");
    assert_eq!(errors[0]["code"], "server_error");
    assert_eq!(alice.close_code(), Some(CloseCode::ServerError));
    assert!(!harness.engine.registry().is_online(ALICE).await);
    assert!(!harness.engine.rooms().room_exists(GENERAL).await);
}

#[tokio::test]
async fn test_frames_before_handshake_are_ignored() {
    let harness = Harness::new().await;
    let (conn, mut io) = harness.engine.open_connection();

    harness
        .engine
        .on_frame(&conn, r#"{"type":"join_room","roomId":5}"#)
        .await;

    assert!(io.frames.try_recv().is_err());
    assert!(!harness.engine.rooms().room_exists(GENERAL).await);
}
