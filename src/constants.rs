// Fundamental configuration constants
pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 8080;
pub const WS_PATH: &str = "ws";

// Engine defaults
pub const DEFAULT_OUTBOUND_BUFFER: usize = 256;
pub const DEFAULT_MAX_FRAME_BYTES: usize = 8192;
pub const DEFAULT_MAX_MESSAGE_CHARS: usize = 2000;
pub const DEFAULT_MESSAGES_PER_MINUTE: u32 = 60;

// Session tokens issued by the in-memory store live for 30 days
pub const SESSION_TOKEN_TTL_DAYS: i64 = 30;

// Upper bounds on identity claims accepted from a token
pub const MAX_TOKEN_LEN: usize = 1000;
pub const MAX_USERNAME_LEN: usize = 50;
