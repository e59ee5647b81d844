use log::{error, info, warn};
use std::net::SocketAddr;
use std::sync::Arc;

use rusty_relay::auth::{JwtAuthValidator, TokenManager};
use rusty_relay::config::ServerConfig;
use rusty_relay::core::{Collaborators, Engine};
use rusty_relay::handlers::routes;
use rusty_relay::storage::MemoryStore;

#[tokio::main]
async fn main() {
    // Initialize env
    let dotenv_result = dotenvy::dotenv();

    // Initialize logging
    env_logger::init();

    match dotenv_result {
        Ok(path) => info!("Environment variables loaded from {}", path.display()),
        Err(e) => warn!("Failed to load .env file: {}", e),
    }

    let config = match ServerConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {}", e);
            std::process::exit(1);
        }
    };

    info!("Configuration: host={}, port={}", config.host, config.port);
    info!(
        "Engine: buffer={}, backpressure={:?}, room persistence={:?}, direct persistence={:?}",
        config.engine.outbound_buffer,
        config.engine.backpressure,
        config.engine.room_persistence,
        config.engine.direct_persistence
    );
    if config.engine.legacy_plaintext {
        warn!("Legacy plain-text room messages are enabled");
    }

    let mut tokens = TokenManager::new(&config.jwt_secret);
    if let Some(issuer) = &config.jwt_issuer {
        tokens = tokens.with_issuer(issuer);
    }

    let store = Arc::new(if config.open_rooms {
        warn!("Open rooms enabled: room membership is not enforced");
        MemoryStore::with_open_rooms()
    } else {
        MemoryStore::new()
    });

    for seed in &config.rooms {
        store.create_room(seed.room_id, seed.name.as_str()).await;
        for member in &seed.members {
            if let Err(e) = store.add_member(seed.room_id, *member).await {
                error!("Failed to seed member {} of room {}: {}", member, seed.room_id, e);
            }
        }
    }
    info!("Seeded {} room(s) into the in-memory store", config.rooms.len());

    let engine = Arc::new(Engine::new(
        config.engine.clone(),
        Collaborators {
            auth: Arc::new(JwtAuthValidator::new(tokens)),
            membership: store.clone(),
            persistence: store,
        },
    ));
    engine.start_background_tasks();

    // Build the server address
    let addr: SocketAddr = match format!("{}:{}", config.host, config.port).parse() {
        Ok(addr) => addr,
        Err(e) => {
            error!("Failed to parse server address: {}", e);
            std::process::exit(1);
        }
    };

    let server = warp::serve(routes(engine));

    match (config.enable_tls, &config.tls_cert_path, &config.tls_key_path) {
        (true, Some(cert_path), Some(key_path)) => {
            info!("Starting Rusty Relay server on wss://{}", addr);
            server
                .tls()
                .cert_path(cert_path)
                .key_path(key_path)
                .run(addr)
                .await;
        }
        _ => {
            info!("Starting Rusty Relay server on ws://{}", addr);
            server.run(addr).await;
        }
    }
}
