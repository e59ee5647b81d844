//! Server configuration module
//! Loads listener, credential and engine parameters from the environment

use std::env;
use std::path::Path;
use std::str::FromStr;

use crate::constants::{
    DEFAULT_HOST, DEFAULT_MAX_FRAME_BYTES, DEFAULT_MAX_MESSAGE_CHARS, DEFAULT_MESSAGES_PER_MINUTE,
    DEFAULT_OUTBOUND_BUFFER, DEFAULT_PORT,
};
use crate::core::connection::BackpressurePolicy;
use crate::core::{RoomId, UserId};
use crate::error::{RelayError, Result};

/// What to do with a message whose persistence failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageFailurePolicy {
    /// Deliver anyway, without a message id
    BestEffort,
    /// Abort delivery and report the failure to the sender
    Reject,
}

impl FromStr for StorageFailurePolicy {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "best_effort" => Ok(StorageFailurePolicy::BestEffort),
            "reject" => Ok(StorageFailurePolicy::Reject),
            other => Err(RelayError::ConfigError(format!(
                "Unknown storage failure policy '{}', expected 'best_effort' or 'reject'",
                other
            ))),
        }
    }
}

/// A room and its members loaded into the in-memory store at startup
///
/// Parsed from `id:name:member,member`, e.g. `5:general:1,2`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomSeed {
    pub room_id: RoomId,
    pub name: String,
    pub members: Vec<UserId>,
}

impl FromStr for RoomSeed {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || {
            RelayError::ConfigError(format!(
                "Invalid room entry '{}', expected 'id:name:member,member'",
                s
            ))
        };

        let mut parts = s.trim().splitn(3, ':');
        let room_id = parts
            .next()
            .and_then(|id| id.trim().parse::<RoomId>().ok())
            .filter(|id| *id > 0)
            .ok_or_else(invalid)?;
        let name = parts
            .next()
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .ok_or_else(invalid)?
            .to_string();
        let members = match parts.next() {
            Some(list) => list
                .split(',')
                .map(str::trim)
                .filter(|member| !member.is_empty())
                .map(|member| member.parse::<UserId>().map_err(|_| invalid()))
                .collect::<Result<Vec<_>>>()?,
            None => Vec::new(),
        };

        Ok(Self {
            room_id,
            name,
            members,
        })
    }
}

fn parse_rooms(raw: &str) -> Result<Vec<RoomSeed>> {
    raw.split(';')
        .filter(|entry| !entry.trim().is_empty())
        .map(str::parse)
        .collect()
}

/// Tunables of the relay engine
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Capacity of each connection's outbound queue
    pub outbound_buffer: usize,
    pub backpressure: BackpressurePolicy,
    pub room_persistence: StorageFailurePolicy,
    pub direct_persistence: StorageFailurePolicy,
    /// Treat non-JSON frames from a joined connection as room messages
    pub legacy_plaintext: bool,
    /// Close the connection when the join requested at connect time fails
    pub strict_connect_join: bool,
    pub max_frame_bytes: usize,
    pub max_message_chars: usize,
    /// 0 disables rate limiting
    pub messages_per_minute: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            outbound_buffer: DEFAULT_OUTBOUND_BUFFER,
            backpressure: BackpressurePolicy::Drop,
            room_persistence: StorageFailurePolicy::BestEffort,
            direct_persistence: StorageFailurePolicy::Reject,
            legacy_plaintext: false,
            strict_connect_join: false,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            max_message_chars: DEFAULT_MAX_MESSAGE_CHARS,
            messages_per_minute: DEFAULT_MESSAGES_PER_MINUTE,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.outbound_buffer == 0 {
            return Err(RelayError::ConfigError(
                "outbound buffer must hold at least one frame".to_string(),
            ));
        }
        if self.max_frame_bytes == 0 || self.max_message_chars == 0 {
            return Err(RelayError::ConfigError(
                "frame and message limits must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Server configuration parameters
///
/// There is no `Default`: the JWT secret must always be supplied explicitly.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// JWT secret for token validation
    pub jwt_secret: String,
    /// Expected `iss` claim, if any
    pub jwt_issuer: Option<String>,
    /// Let every authenticated user into every room (in-memory membership only)
    pub open_rooms: bool,
    /// Rooms and memberships seeded into the in-memory store
    pub rooms: Vec<RoomSeed>,
    /// TLS configuration
    pub tls_cert_path: Option<String>,
    pub tls_key_path: Option<String>,
    pub enable_tls: bool,
    pub engine: EngineConfig,
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T> {
    match lookup(key) {
        Some(raw) => raw.trim().parse().map_err(|_| {
            RelayError::ConfigError(format!("{} has an invalid value '{}'", key, raw))
        }),
        None => Ok(default),
    }
}

fn parse_flag(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: bool) -> Result<bool> {
    match lookup(key) {
        Some(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => Ok(true),
            "false" | "0" | "no" => Ok(false),
            _ => Err(RelayError::ConfigError(format!(
                "{} must be a boolean, got '{}'",
                key, raw
            ))),
        },
        None => Ok(default),
    }
}

impl ServerConfig {
    /// Validate that a secret meets security requirements
    fn validate_jwt_secret(secret: &str) -> Result<()> {
        if secret.len() < 32 {
            return Err(RelayError::ConfigError(
                "JWT secret must be at least 32 characters long".to_string(),
            ));
        }

        // Check for insecure default or example values
        let insecure_patterns = [
            "your-secret-key",
            "change-this",
            "test-secret",
            "default",
            "secret",
            "password",
            "12345",
        ];

        for pattern in &insecure_patterns {
            if secret.contains(pattern) {
                return Err(RelayError::ConfigError(format!(
                    "JWT secret contains insecure pattern '{}'. Generate one with: openssl rand -base64 32",
                    pattern
                )));
            }
        }

        if secret.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(RelayError::ConfigError(
                "JWT secret should contain mixed characters (letters, numbers, symbols)".to_string(),
            ));
        }

        Ok(())
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration from any key lookup, `from_env` uses the process environment
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let host = lookup("RUSTY_RELAY_HOST").unwrap_or_else(|| DEFAULT_HOST.to_string());
        let port = parse_var(&lookup, "RUSTY_RELAY_PORT", DEFAULT_PORT)?;

        let jwt_secret = lookup("RUSTY_RELAY_JWT_SECRET")
            .or_else(|| lookup("JWT_SECRET"))
            .ok_or_else(|| {
                RelayError::ConfigError(
                    "JWT_SECRET environment variable is required. \
                     Generate one with: openssl rand -base64 32"
                        .to_string(),
                )
            })?;
        Self::validate_jwt_secret(&jwt_secret)?;

        let jwt_issuer = lookup("RUSTY_RELAY_JWT_ISSUER").filter(|issuer| !issuer.is_empty());
        let open_rooms = parse_flag(&lookup, "RUSTY_RELAY_OPEN_ROOMS", false)?;
        let rooms = match lookup("RUSTY_RELAY_ROOMS") {
            Some(raw) => parse_rooms(&raw)?,
            None => Vec::new(),
        };

        // TLS configuration
        let enable_tls = parse_flag(&lookup, "RUSTY_RELAY_ENABLE_TLS", false)?;
        let tls_cert_path = lookup("RUSTY_RELAY_TLS_CERT_PATH");
        let tls_key_path = lookup("RUSTY_RELAY_TLS_KEY_PATH");

        if enable_tls {
            let (Some(cert_path), Some(key_path)) = (&tls_cert_path, &tls_key_path) else {
                return Err(RelayError::ConfigError(
                    "TLS is enabled but RUSTY_RELAY_TLS_CERT_PATH or RUSTY_RELAY_TLS_KEY_PATH is not set"
                        .to_string(),
                ));
            };
            if !Path::new(cert_path).exists() {
                return Err(RelayError::ConfigError(format!(
                    "TLS certificate file does not exist: {}",
                    cert_path
                )));
            }
            if !Path::new(key_path).exists() {
                return Err(RelayError::ConfigError(format!(
                    "TLS private key file does not exist: {}",
                    key_path
                )));
            }
        }

        let defaults = EngineConfig::default();
        let engine = EngineConfig {
            outbound_buffer: parse_var(&lookup, "RUSTY_RELAY_OUTBOUND_BUFFER", defaults.outbound_buffer)?,
            backpressure: parse_var(&lookup, "RUSTY_RELAY_BACKPRESSURE", defaults.backpressure)?,
            room_persistence: parse_var(&lookup, "RUSTY_RELAY_ROOM_PERSISTENCE", defaults.room_persistence)?,
            direct_persistence: parse_var(
                &lookup,
                "RUSTY_RELAY_DIRECT_PERSISTENCE",
                defaults.direct_persistence,
            )?,
            legacy_plaintext: parse_flag(&lookup, "RUSTY_RELAY_LEGACY_PLAINTEXT", defaults.legacy_plaintext)?,
            strict_connect_join: parse_flag(
                &lookup,
                "RUSTY_RELAY_STRICT_CONNECT_JOIN",
                defaults.strict_connect_join,
            )?,
            max_frame_bytes: parse_var(&lookup, "RUSTY_RELAY_MAX_FRAME_BYTES", defaults.max_frame_bytes)?,
            max_message_chars: parse_var(&lookup, "RUSTY_RELAY_MAX_MESSAGE_CHARS", defaults.max_message_chars)?,
            messages_per_minute: parse_var(
                &lookup,
                "RUSTY_RELAY_RATE_LIMIT_MSG_PER_MIN",
                defaults.messages_per_minute,
            )?,
        };
        engine.validate()?;

        Ok(Self {
            host,
            port,
            jwt_secret,
            jwt_issuer,
            open_rooms,
            rooms,
            tls_cert_path,
            tls_key_path,
            enable_tls,
            engine,
        })
    }
}
