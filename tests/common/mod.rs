// Shared fixtures for the relay integration tests
#![allow(dead_code)]

use serde_json::Value;
use std::sync::Arc;

use rusty_relay::auth::Identity;
use rusty_relay::config::EngineConfig;
use rusty_relay::core::connection::{CloseCode, Connection, ConnectionIo};
use rusty_relay::core::{Collaborators, ConnectParams, Engine};
use rusty_relay::error::Result;
use rusty_relay::storage::MemoryStore;

pub const ALICE: u64 = 1;
pub const BOB: u64 = 2;
pub const CAROL: u64 = 3;

/// Room 5 "general": alice and bob. Room 6 "ops": alice and bob. Carol belongs nowhere.
pub const GENERAL: u64 = 5;
pub const OPS: u64 = 6;

pub fn username(user_id: u64) -> &'static str {
    match user_id {
        ALICE => "alice",
        BOB => "bob",
        CAROL => "carol",
        _ => "someone",
    }
}

/// A connection as the transport sees it
pub struct Client {
    pub conn: Arc<Connection>,
    pub io: ConnectionIo,
}

impl Client {
    /// Everything queued so far, decoded
    pub fn drain(&mut self) -> Vec<Value> {
        let mut frames = Vec::new();
        while let Ok(text) = self.io.frames.try_recv() {
            frames.push(serde_json::from_str(&text).expect("outbound frames are JSON"));
        }
        frames
    }

    /// Queued frames of one type, discarding the rest
    pub fn drain_type(&mut self, kind: &str) -> Vec<Value> {
        self.drain()
            .into_iter()
            .filter(|frame| frame["type"] == kind)
            .collect()
    }

    pub fn close_code(&self) -> Option<CloseCode> {
        self.conn.close_frame().map(|frame| frame.code)
    }
}

pub struct Harness {
    pub engine: Arc<Engine>,
    pub store: Arc<MemoryStore>,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_config(EngineConfig::default()).await
    }

    pub async fn with_config(config: EngineConfig) -> Self {
        let store = Arc::new(MemoryStore::new());
        store.create_room(GENERAL, "general").await;
        store.create_room(OPS, "ops").await;
        for room in [GENERAL, OPS] {
            store.add_member(room, ALICE).await.unwrap();
            store.add_member(room, BOB).await.unwrap();
        }

        let engine = Arc::new(Engine::new(
            config,
            Collaborators {
                auth: store.clone(),
                membership: store.clone(),
                persistence: store.clone(),
            },
        ));

        Self { engine, store }
    }

    pub async fn token(&self, user_id: u64) -> String {
        self.store
            .issue_token(Identity::new(user_id, username(user_id)))
            .await
    }

    /// Open a connection and run the handshake with the given parameters
    pub async fn connect_with(&self, params: ConnectParams) -> (Client, Result<()>) {
        let (conn, io) = self.engine.open_connection();
        let result = self.engine.connect(&conn, params).await;
        (Client { conn, io }, result)
    }

    /// Authenticated connection with its auth_success already consumed
    pub async fn connect(&self, user_id: u64) -> Client {
        let token = self.token(user_id).await;
        let (mut client, result) = self.connect_with(ConnectParams::new(token)).await;
        result.expect("handshake succeeds");
        let frames = client.drain();
        assert_eq!(frames[0]["type"], "auth_success");
        client
    }

    /// Authenticated connection joined to a room, inbox emptied
    pub async fn joined(&self, user_id: u64, room_id: u64) -> Client {
        let mut client = self.connect(user_id).await;
        self.send(&client, &format!(r#"{{"type":"join_room","roomId":{}}}"#, room_id))
            .await;
        assert_eq!(client.conn.room_id(), Some(room_id));
        client.drain();
        client
    }

    pub async fn send(&self, client: &Client, raw: &str) {
        self.engine.on_frame(&client.conn, raw).await;
    }

    pub async fn say(&self, client: &Client, text: &str) {
        let raw = serde_json::json!({"type": "room_message", "text": text}).to_string();
        self.send(client, &raw).await;
    }
}
