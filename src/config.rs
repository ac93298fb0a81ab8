//! # Server Configuration Module
//!
//! Environment-backed configuration for the dispatch core.
//!
//! ## Environment Variables
//!
//! - `MICROSERV_COMPRESS` — enable gzip response compression (`1`/`true`)
//! - `MICROSERV_COMPRESS_MIN_SIZE` / `MICROSERV_COMPRESS_MAX_SIZE` — byte
//!   window inside which a response body is compressed (decimal or `0x` hex)
//! - `MICROSERV_NO_LOG_GETS` — drop every log record for GET requests
//! - `MICROSERV_LOG_WS_ACTION` — record every WebSocket action dispatch
//!
//! Everything else is configured in code at startup; CLI and config-file
//! loading live outside this crate.

use once_cell::sync::Lazy;
use std::collections::{HashMap, HashSet};
use std::env;

/// Header names dropped from log records by default: pure client noise.
static DEFAULT_NO_LOG_HEADERS: Lazy<HashSet<String>> = Lazy::new(|| {
    [
        "accept",
        "accept-encoding",
        "accept-language",
        "cache-control",
        "connection",
        "pragma",
        "upgrade-insecure-requests",
    ]
    .into_iter()
    .map(str::to_string)
    .collect()
});

/// Field names masked in logs by default (lowercased, hyphens stripped).
static DEFAULT_ENCRYPT_FIELDS: Lazy<HashSet<String>> = Lazy::new(|| {
    ["password", "secure", "token", "accesstoken"]
        .into_iter()
        .map(str::to_string)
        .collect()
});

fn parse_size(val: &str, default: usize) -> usize {
    if let Some(hex) = val.strip_prefix("0x") {
        usize::from_str_radix(hex, 16).unwrap_or(default)
    } else {
        val.parse().unwrap_or(default)
    }
}

fn env_flag(name: &str) -> Option<bool> {
    env::var(name)
        .ok()
        .map(|v| matches!(v.as_str(), "1" | "true" | "yes"))
}

/// Process-wide settings consumed by the dispatcher, the WebSocket engine
/// and the access-log writer.
///
/// Construct with [`ServerConfig::default()`] and override fields, or load
/// the environment-tunable subset with [`ServerConfig::from_env()`].
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Identifier of this server instance, first field of every log record.
    pub server_id: String,
    /// Application/service identifier.
    pub app: String,
    /// Bind address reported in log records.
    pub addr: String,
    /// Enable gzip compression of HTTP response bodies.
    pub compress: bool,
    /// Smallest body size (bytes) considered for compression.
    pub compress_min_size: usize,
    /// Largest body size (bytes) considered for compression.
    pub compress_max_size: usize,
    /// Sequence truncation limit for logged input arguments (0 collapses a
    /// sequence into a `"<type> (<len>)"` placeholder).
    pub log_input_array_num: usize,
    /// Sequence truncation limit for logged results.
    pub log_output_array_num: usize,
    /// When set, only these (lowercased) top-level result fields are logged.
    pub log_output_fields: Option<HashSet<String>>,
    /// Suppress every log record for GET requests, WebSocket sessions
    /// included (upgrades arrive as GETs).
    pub no_log_gets: bool,
    /// Record a WSACTION entry for every successful WebSocket dispatch.
    pub log_websocket_action: bool,
    /// Honor `x-real-ip` even when the request carried no request id.
    pub accept_real_ip_without_request_id: bool,
    /// Status code written for requests recovered from a panic or handler error.
    pub panic_status: u16,
    /// Header key carrying the session id; `None` disables session handling.
    pub session_key: Option<String>,
    /// Header key carrying the client id; `None` disables client propagation.
    pub client_key: Option<String>,
    /// Lowercased header names excluded from log records.
    pub no_log_headers: HashSet<String>,
    /// Lowercased field names (hyphens stripped) masked wherever they appear
    /// in logged headers, arguments or results.
    pub encrypt_log_fields: HashSet<String>,
    /// Liveness path: answered by a built-in 200/503 when no route claims
    /// it, and never logged either way.
    pub health_check_path: String,
    /// Header consulted by the default token auth checker.
    pub auth_token_header: String,
    /// Token -> level mapping backing the default auth checker.
    pub access_tokens: HashMap<String, u32>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            server_id: String::new(),
            app: String::new(),
            addr: String::new(),
            compress: true,
            compress_min_size: 1024,
            compress_max_size: 4_194_304,
            log_input_array_num: 10,
            log_output_array_num: 3,
            log_output_fields: None,
            no_log_gets: false,
            log_websocket_action: true,
            accept_real_ip_without_request_id: false,
            panic_status: 599,
            session_key: None,
            client_key: None,
            no_log_headers: DEFAULT_NO_LOG_HEADERS.clone(),
            encrypt_log_fields: DEFAULT_ENCRYPT_FIELDS.clone(),
            health_check_path: "/__CHECK__".to_string(),
            auth_token_header: "access-token".to_string(),
            access_tokens: HashMap::new(),
        }
    }
}

impl ServerConfig {
    /// Load the environment-tunable subset on top of the defaults.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Some(v) = env_flag("MICROSERV_COMPRESS") {
            cfg.compress = v;
        }
        if let Ok(v) = env::var("MICROSERV_COMPRESS_MIN_SIZE") {
            cfg.compress_min_size = parse_size(&v, cfg.compress_min_size);
        }
        if let Ok(v) = env::var("MICROSERV_COMPRESS_MAX_SIZE") {
            cfg.compress_max_size = parse_size(&v, cfg.compress_max_size);
        }
        if let Some(v) = env_flag("MICROSERV_NO_LOG_GETS") {
            cfg.no_log_gets = v;
        }
        if let Some(v) = env_flag("MICROSERV_LOG_WS_ACTION") {
            cfg.log_websocket_action = v;
        }
        cfg
    }

    /// True when `name` (lowercased, hyphens stripped) must be masked in logs.
    pub fn requires_mask(&self, name: &str) -> bool {
        let key = name.to_lowercase().replace('-', "");
        self.encrypt_log_fields.contains(&key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_enable_compression_window() {
        let cfg = ServerConfig::default();
        assert!(cfg.compress);
        assert!(cfg.compress_min_size < cfg.compress_max_size);
    }

    #[test]
    fn mask_check_strips_hyphens_and_case() {
        let cfg = ServerConfig::default();
        assert!(cfg.requires_mask("Access-Token"));
        assert!(cfg.requires_mask("PASSWORD"));
        assert!(!cfg.requires_mask("username"));
    }

    #[test]
    fn parse_size_accepts_hex() {
        assert_eq!(parse_size("0x400", 0), 1024);
        assert_eq!(parse_size("2048", 0), 2048);
        assert_eq!(parse_size("bogus", 7), 7);
    }
}
