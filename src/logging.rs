//! Access-log records and sinks.
//!
//! One [`AccessLogEntry`] is emitted per HTTP request and per WebSocket
//! event, with a fixed field order so downstream collectors can parse
//! records positionally. Values pass through [`crate::sanitize`] before they
//! get here; sinks never see raw bulk payloads.

use serde::Serialize;
use serde_json::Value;
use std::sync::Mutex;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Output format for [`init_tracing`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// One JSON object per line, for collectors.
    #[default]
    Json,
    /// Human-readable, for local runs.
    Pretty,
}

/// Install a process-wide `tracing` subscriber filtered by `RUST_LOG`
/// (default `info`). Embedders with their own subscriber can skip this;
/// calling it twice is a no-op.
pub fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let result = match format {
        LogFormat::Json => builder.json().with_current_span(false).try_init(),
        LogFormat::Pretty => builder.pretty().try_init(),
    };
    if let Err(e) = result {
        tracing::debug!(error = %e, "tracing subscriber already installed");
    }
}

/// Event-type tag carried in the `extra.type` field of every record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogTag {
    Access,
    Fail,
    Reject,
    Panic,
    WsOpen,
    WsAction,
    WsActionError,
    WsReject,
    WsClose,
}

impl LogTag {
    pub fn as_str(self) -> &'static str {
        match self {
            LogTag::Access => "ACCESS",
            LogTag::Fail => "FAIL",
            LogTag::Reject => "REJECT",
            LogTag::Panic => "PANIC",
            LogTag::WsOpen => "WSOPEN",
            LogTag::WsAction => "WSACTION",
            LogTag::WsActionError => "WSACTIONERROR",
            LogTag::WsReject => "WSREJECT",
            LogTag::WsClose => "WSCLOSE",
        }
    }
}

/// One access-log record. Field order is part of the contract.
#[derive(Debug, Clone, Serialize)]
pub struct AccessLogEntry {
    pub server_id: String,
    pub app: String,
    pub addr: String,
    pub client_ip: String,
    pub from_app: String,
    pub from_node: String,
    pub client_id: String,
    pub session_id: String,
    pub request_id: String,
    pub host: String,
    pub scheme: String,
    pub proto: String,
    pub auth_level: u32,
    /// Reserved; always 0.
    pub priority: i32,
    pub method: String,
    pub path: String,
    pub headers: Value,
    pub args: Value,
    pub used_ms: f64,
    pub status: u16,
    pub out_headers: Value,
    pub out_len: u64,
    pub result: Value,
    /// Tagged extra info; always contains a `type` field with the event tag.
    pub extra: Value,
}

impl AccessLogEntry {
    /// The event-type tag recorded in `extra.type`.
    pub fn tag(&self) -> Option<&str> {
        self.extra.get("type").and_then(Value::as_str)
    }
}

/// Destination for access-log records.
pub trait LogSink: Send + Sync {
    fn emit(&self, entry: AccessLogEntry);
}

/// Default sink: one `tracing` event per record, JSON-encoded under the
/// `microserv::access` target.
pub struct TracingSink;

impl LogSink for TracingSink {
    fn emit(&self, entry: AccessLogEntry) {
        match serde_json::to_string(&entry) {
            Ok(encoded) => {
                info!(target: "microserv::access", entry = %encoded, "access record")
            }
            Err(e) => error!(target: "microserv::access", error = %e, "unencodable access record"),
        }
    }
}

/// In-memory sink for tests and introspection.
#[derive(Default)]
pub struct MemorySink {
    entries: Mutex<Vec<AccessLogEntry>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything recorded so far.
    pub fn entries(&self) -> Vec<AccessLogEntry> {
        self.entries.lock().map(|e| e.clone()).unwrap_or_default()
    }

    /// Records carrying the given tag.
    pub fn tagged(&self, tag: LogTag) -> Vec<AccessLogEntry> {
        self.entries()
            .into_iter()
            .filter(|e| e.tag() == Some(tag.as_str()))
            .collect()
    }
}

impl LogSink for MemorySink {
    fn emit(&self, entry: AccessLogEntry) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.push(entry);
        }
    }
}

/// Per-request diagnostic logger handed to handlers and injected objects.
///
/// Carries the request id so every diagnostic line correlates with the
/// request's access record.
#[derive(Clone, Debug)]
pub struct RequestLogger {
    request_id: String,
}

impl RequestLogger {
    pub fn new(request_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
        }
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn info(&self, message: &str) {
        info!(request_id = %self.request_id, "{message}");
    }

    pub fn error(&self, message: &str, detail: Value) {
        error!(request_id = %self.request_id, detail = %detail, "{message}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry(tag: LogTag) -> AccessLogEntry {
        AccessLogEntry {
            server_id: "s1".into(),
            app: "app".into(),
            addr: "127.0.0.1:8080".into(),
            client_ip: "10.0.0.1".into(),
            from_app: String::new(),
            from_node: String::new(),
            client_id: String::new(),
            session_id: String::new(),
            request_id: "r1".into(),
            host: "example.com".into(),
            scheme: "http".into(),
            proto: "1.1".into(),
            auth_level: 0,
            priority: 0,
            method: "GET".into(),
            path: "/".into(),
            headers: json!({}),
            args: json!({}),
            used_ms: 0.2,
            status: 200,
            out_headers: json!({}),
            out_len: 0,
            result: Value::Null,
            extra: json!({"type": tag.as_str()}),
        }
    }

    #[test]
    fn memory_sink_filters_by_tag() {
        let sink = MemorySink::new();
        sink.emit(entry(LogTag::Access));
        sink.emit(entry(LogTag::Fail));
        sink.emit(entry(LogTag::Access));
        assert_eq!(sink.tagged(LogTag::Access).len(), 2);
        assert_eq!(sink.tagged(LogTag::Fail).len(), 1);
        assert!(sink.tagged(LogTag::Panic).is_empty());
    }

    #[test]
    fn serialized_field_order_is_stable() {
        let encoded = serde_json::to_string(&entry(LogTag::Access)).unwrap();
        let server = encoded.find("server_id").unwrap();
        let status = encoded.find("\"status\"").unwrap();
        let extra = encoded.find("\"extra\"").unwrap();
        assert!(server < status && status < extra);
    }
}
