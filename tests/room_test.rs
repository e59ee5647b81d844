// Room join, leave, broadcast and room messages

mod common;

use common::*;
use std::sync::Arc;

use rusty_relay::config::{EngineConfig, StorageFailurePolicy};
use rusty_relay::core::ServerMessage;
use rusty_relay::error::RelayError;
use rusty_relay::storage::RoomMessageKind;

#[tokio::test]
async fn test_join_announces_to_whole_room() {
    let harness = Harness::new().await;
    let mut alice = harness.joined(ALICE, GENERAL).await;
    let mut bob = harness.connect(BOB).await;

    harness.send(&bob, r#"{"type":"join_room","roomId":5}"#).await;

    let joined = alice.drain_type("userJoined");
    assert_eq!(joined.len(), 1);
    assert_eq!(joined[0]["userId"], 2);
    assert_eq!(joined[0]["username"], "bob");
    assert_eq!(joined[0]["roomId"], 5);

    let frames = bob.drain();
    assert_eq!(frames[0]["type"], "userJoined");
    assert_eq!(frames[1]["type"], "server_message");
    assert_eq!(frames[1]["text"], "You joined general");
    assert_eq!(frames[1]["roomId"], 5);

    assert_eq!(harness.engine.rooms().member_count(GENERAL).await, 2);
}

#[tokio::test]
async fn test_non_member_join_is_rejected_without_state_change() {
    let harness = Harness::new().await;
    let mut carol = harness.connect(CAROL).await;

    harness.send(&carol, r#"{"type":"join_room","roomId":5}"#).await;

    let frames = carol.drain();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0]["type"], "error");
    assert_eq!(frames[0]["context"], "room_join");
    assert_eq!(frames[0]["roomId"], 5);
    assert_eq!(carol.conn.room_id(), None);
    assert!(!harness.engine.rooms().room_exists(GENERAL).await);
    assert!(harness.store.room_messages(GENERAL).await.is_empty());
}

#[tokio::test]
async fn test_unknown_room_is_a_membership_error() {
    let harness = Harness::new().await;
    let mut alice = harness.connect(ALICE).await;

    harness.send(&alice, r#"{"type":"join_room","roomId":99}"#).await;

    let errors = alice.drain_type("error");
    assert_eq!(errors[0]["code"], "not_room_member");
    assert!(!harness.engine.rooms().room_exists(99).await);
}

#[tokio::test]
async fn test_joining_a_second_room_is_rejected() {
    let harness = Harness::new().await;
    let mut alice = harness.joined(ALICE, GENERAL).await;

    harness.send(&alice, r#"{"type":"join_room","roomId":6}"#).await;

    let errors = alice.drain_type("error");
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0]["code"], "already_in_room");
    assert_eq!(errors[0]["roomId"], 6);
    assert_eq!(alice.conn.room_id(), Some(GENERAL));
    assert!(!harness.engine.rooms().room_exists(OPS).await);
    assert_eq!(
        harness.engine.rooms().get_room_members(GENERAL).await,
        vec![alice.conn.id.clone()]
    );
}

#[tokio::test]
async fn test_leave_notifies_remaining_members_and_deletes_empty_room() {
    let harness = Harness::new().await;
    let mut alice = harness.joined(ALICE, GENERAL).await;
    let mut bob = harness.joined(BOB, GENERAL).await;
    alice.drain();

    harness.send(&alice, r#"{"type":"leave_room"}"#).await;

    let frames = alice.drain();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0]["type"], "server_message");
    assert_eq!(frames[0]["text"], "You left general");
    assert_eq!(alice.conn.room_id(), None);

    let left = bob.drain_type("userLeft");
    assert_eq!(left.len(), 1);
    assert_eq!(left[0]["userId"], 1);
    assert!(harness.engine.rooms().room_exists(GENERAL).await);

    harness.send(&bob, r#"{"type":"leave_room"}"#).await;
    assert!(!harness.engine.rooms().room_exists(GENERAL).await);
    assert!(harness.engine.rooms().active_rooms().await.is_empty());

    // Switching rooms is leave then join
    harness.send(&alice, r#"{"type":"join_room","roomId":6}"#).await;
    assert_eq!(alice.conn.room_id(), Some(OPS));
}

#[tokio::test]
async fn test_leave_outside_a_room() {
    let harness = Harness::new().await;
    let mut alice = harness.connect(ALICE).await;

    harness.send(&alice, r#"{"type":"leave_room"}"#).await;

    let errors = alice.drain_type("error");
    assert_eq!(errors[0]["code"], "not_in_room");
    assert_eq!(errors[0]["context"], "room_leave");
}

#[tokio::test]
async fn test_room_message_reaches_everyone_including_sender() {
    let harness = Harness::new().await;
    let mut alice = harness.joined(ALICE, GENERAL).await;
    let mut bob = harness.joined(BOB, GENERAL).await;
    alice.drain();

    harness.say(&alice, "hi").await;

    for client in [&mut alice, &mut bob] {
        let messages = client.drain_type("room_message");
        assert_eq!(messages.len(), 1);
        let msg = &messages[0];
        assert_eq!(msg["senderId"], 1);
        assert_eq!(msg["senderName"], "alice");
        assert_eq!(msg["roomId"], 5);
        assert_eq!(msg["text"], "hi");
        assert!(msg["messageId"].is_u64());
        assert!(msg["timestamp"].is_string());
    }

    let kinds: Vec<RoomMessageKind> = harness
        .store
        .room_messages(GENERAL)
        .await
        .into_iter()
        .map(|m| m.kind)
        .collect();
    assert_eq!(
        kinds,
        vec![
            RoomMessageKind::SystemJoin,
            RoomMessageKind::SystemJoin,
            RoomMessageKind::Text
        ]
    );
}

#[tokio::test]
async fn test_room_message_outside_a_room() {
    let harness = Harness::new().await;
    let mut alice = harness.connect(ALICE).await;

    harness.say(&alice, "anyone?").await;

    let errors = alice.drain_type("error");
    assert_eq!(errors[0]["code"], "not_in_room");
    assert_eq!(errors[0]["context"], "room_message");
}

#[tokio::test]
async fn test_messages_arrive_in_submission_order() {
    let harness = Harness::new().await;
    let alice = harness.joined(ALICE, GENERAL).await;
    let mut bob = harness.joined(BOB, GENERAL).await;

    for i in 0..20 {
        harness.say(&alice, &format!("m{}", i)).await;
    }

    let texts: Vec<String> = bob
        .drain_type("room_message")
        .into_iter()
        .map(|m| m["text"].as_str().unwrap().to_string())
        .collect();
    let expected: Vec<String> = (0..20).map(|i| format!("m{}", i)).collect();
    assert_eq!(texts, expected);
}

#[tokio::test]
async fn test_best_effort_broadcast_without_id_on_storage_failure() {
    let harness = Harness::new().await;
    let mut alice = harness.joined(ALICE, GENERAL).await;
    let mut bob = harness.joined(BOB, GENERAL).await;
    alice.drain();
    harness.store.set_failing_writes(true);

    harness.say(&alice, "still here").await;

    for client in [&mut alice, &mut bob] {
        let messages = client.drain_type("room_message");
        assert_eq!(messages.len(), 1);
        assert!(messages[0].get("messageId").is_none());
        assert_eq!(messages[0]["text"], "still here");
    }
    assert_eq!(harness.engine.metrics().snapshot().persistence_failures, 1);
}

#[tokio::test]
async fn test_reject_policy_reports_storage_failure() {
    let harness = Harness::with_config(EngineConfig {
        room_persistence: StorageFailurePolicy::Reject,
        ..EngineConfig::default()
    })
    .await;
    let mut alice = harness.joined(ALICE, GENERAL).await;
    let mut bob = harness.joined(BOB, GENERAL).await;
    alice.drain();
    harness.store.set_failing_writes(true);

    harness.say(&alice, "lost").await;

    let frames = alice.drain();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0]["code"], "storage_failure");
    assert_eq!(frames[0]["context"], "room_message");
    assert!(bob.drain().is_empty());
    assert!(alice.close_code().is_none());
}

#[tokio::test]
async fn test_broadcast_to_missing_room_is_noop() {
    let harness = Harness::new().await;
    let delivered = harness
        .engine
        .rooms()
        .broadcast(42, &ServerMessage::notice("hello", Some(42)), None)
        .await;
    assert_eq!(delivered, 0);
    assert!(!harness.engine.rooms().room_exists(42).await);
}

#[tokio::test]
async fn test_broadcast_excludes_connection() {
    let harness = Harness::new().await;
    let mut alice = harness.joined(ALICE, GENERAL).await;
    let mut bob = harness.joined(BOB, GENERAL).await;
    alice.drain();

    let delivered = harness
        .engine
        .rooms()
        .broadcast(
            GENERAL,
            &ServerMessage::notice("maintenance soon", Some(GENERAL)),
            Some(alice.conn.id.as_str()),
        )
        .await;

    assert_eq!(delivered, 1);
    assert!(alice.drain().is_empty());
    assert_eq!(bob.drain_type("server_message").len(), 1);
}

#[tokio::test]
async fn test_membership_backend_failure_is_reported() {
    let harness = Harness::new().await;
    let mut alice = harness.connect(ALICE).await;
    harness.store.set_offline(true);

    harness.send(&alice, r#"{"type":"join_room","roomId":5}"#).await;

    let errors = alice.drain_type("error");
    assert_eq!(errors[0]["code"], RelayError::ServiceUnavailable(String::new()).code());
    assert_eq!(errors[0]["context"], "room_join");
    assert!(alice.close_code().is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_room_stays_consistent_when_joins_race_disconnects() {
    let harness = Harness::with_config(EngineConfig {
        messages_per_minute: 0,
        ..EngineConfig::default()
    })
    .await;
    let engine = Arc::clone(&harness.engine);
    let users: Vec<u64> = (100..116).collect();
    for user_id in &users {
        harness.store.add_member(GENERAL, *user_id).await.unwrap();
    }

    for _ in 0..20 {
        let mut clients = Vec::new();
        for user_id in &users {
            clients.push(harness.connect(*user_id).await);
        }

        let mut tasks = Vec::new();
        for (i, client) in clients.iter().enumerate() {
            let (engine_a, conn_a) = (Arc::clone(&engine), Arc::clone(&client.conn));
            tasks.push(tokio::spawn(async move {
                engine_a.on_frame(&conn_a, r#"{"type":"join_room","roomId":5}"#).await;
                if i % 3 == 0 {
                    engine_a.on_frame(&conn_a, r#"{"type":"leave_room"}"#).await;
                }
                engine_a
                    .on_frame(&conn_a, r#"{"type":"room_message","text":"hi"}"#)
                    .await;
            }));

            if i % 2 == 0 {
                let (engine_b, conn_b) = (Arc::clone(&engine), Arc::clone(&client.conn));
                tasks.push(tokio::spawn(async move {
                    engine_b.disconnect(&conn_b).await;
                }));
            }
        }
        for task in tasks {
            task.await.unwrap();
        }

        // Closed connections never linger, live ones are listed iff they think they joined
        let members = engine.rooms().get_room_members(GENERAL).await;
        for client in &clients {
            let listed = members.contains(&client.conn.id);
            if client.conn.is_closed() {
                assert!(!listed, "closed connection {} left in room", client.conn.id);
            } else {
                assert_eq!(listed, client.conn.room_id() == Some(GENERAL));
            }
        }
        assert_eq!(engine.rooms().room_exists(GENERAL).await, !members.is_empty());

        for client in &clients {
            engine.disconnect(&client.conn).await;
        }
        assert!(!engine.rooms().room_exists(GENERAL).await);
        assert_eq!(engine.rooms().member_count(GENERAL).await, 0);
    }
}
