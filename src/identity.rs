//! Identity propagation across service hops.
//!
//! Each request carries a small set of `x-*` headers naming the originating
//! request, client and session. Normalization resolves them once per request,
//! writes the resolved values back onto the request header map (so
//! collaborators and log records observe the same view) and echoes the
//! request id and session id to the response.

use crate::config::ServerConfig;
use crate::ids::RequestId;
use crate::server::request::HttpRequest;
use crate::server::response::Response;

pub const X_REQUEST_ID: &str = "x-request-id";
pub const X_REAL_IP: &str = "x-real-ip";
pub const X_HOST: &str = "x-host";
pub const X_SCHEME: &str = "x-scheme";
pub const X_SESSION_ID: &str = "x-session-id";
pub const X_CLIENT_ID: &str = "x-client-id";
pub const X_FROM_APP: &str = "x-from-app";
pub const X_FROM_NODE: &str = "x-from-node";

/// Mints ids for sessions. Swap in a custom generator when session ids must
/// follow an external scheme.
pub trait IdGenerator: Send + Sync {
    fn generate(&self) -> String;
}

/// Default generator: ULID, same family as request ids.
pub struct UlidGenerator;

impl IdGenerator for UlidGenerator {
    fn generate(&self) -> String {
        RequestId::new().to_string()
    }
}

/// Resolved identity for one request, consumed by the access-log writer.
#[derive(Debug, Clone, Default)]
pub struct Identity {
    pub request_id: String,
    pub client_ip: String,
    pub host: String,
    pub scheme: String,
    pub session_id: String,
    pub client_id: String,
    pub from_app: String,
    pub from_node: String,
}

/// Resolve identity headers, write them back onto the request and echo the
/// request id (and session id, when session handling is configured) to the
/// response.
///
/// `x-real-ip` is only honored when the inbound request already carried a
/// request id, i.e. came through a trusted upstream hop, unless
/// `accept_real_ip_without_request_id` is set. A missing session id is minted
/// by `session_gen` under the configured session key.
pub fn normalize(
    req: &mut HttpRequest,
    resp: &mut Response,
    cfg: &ServerConfig,
    session_gen: &dyn IdGenerator,
) -> Identity {
    let had_request_id = req.header(X_REQUEST_ID).is_some();
    let request_id = RequestId::from_header_or_new(req.header(X_REQUEST_ID)).to_string();
    req.set_header(X_REQUEST_ID, request_id.clone());
    resp.set_header(X_REQUEST_ID, &request_id);

    let trust_real_ip = had_request_id || cfg.accept_real_ip_without_request_id;
    let client_ip = match req.header(X_REAL_IP) {
        Some(ip) if trust_real_ip && !ip.is_empty() => ip.to_string(),
        _ => req.remote_ip().to_string(),
    };
    req.set_header(X_REAL_IP, client_ip.clone());

    let host = match req.header(X_HOST) {
        Some(h) if !h.is_empty() => h.to_string(),
        _ => req.host.clone(),
    };
    let scheme = match req.header(X_SCHEME) {
        Some(s) if !s.is_empty() => s.to_string(),
        _ if req.tls => "https".to_string(),
        _ => "http".to_string(),
    };
    req.set_header(X_HOST, host.clone());
    req.set_header(X_SCHEME, scheme.clone());

    let session_id = match &cfg.session_key {
        Some(key) => {
            let existing = req
                .header(key)
                .map(str::to_string)
                .or_else(|| req.cookie(key))
                .filter(|v| !v.is_empty());
            let sid = existing.unwrap_or_else(|| session_gen.generate());
            req.set_header(key, sid.clone());
            resp.set_header(key, &sid);
            sid
        }
        None => String::new(),
    };

    let client_id = match &cfg.client_key {
        Some(key) => req
            .header(key)
            .map(str::to_string)
            .or_else(|| req.cookie(key))
            .unwrap_or_default(),
        None => String::new(),
    };

    Identity {
        request_id,
        client_ip,
        host,
        scheme,
        session_id,
        client_id,
        from_app: req.header(X_FROM_APP).unwrap_or_default().to_string(),
        from_node: req.header(X_FROM_NODE).unwrap_or_default().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::response::BufferWriter;
    use http::Method;

    fn request() -> HttpRequest {
        let mut req = HttpRequest::new(Method::GET, "/");
        req.remote_addr = "10.0.0.9:41000".to_string();
        req.host = "svc.local".to_string();
        req
    }

    #[test]
    fn mints_request_id_and_echoes_it() {
        let mut req = request();
        let (writer, handle) = BufferWriter::pair();
        let mut resp = Response::new(writer);
        let id = normalize(&mut req, &mut resp, &ServerConfig::default(), &UlidGenerator);
        assert!(!id.request_id.is_empty());
        assert_eq!(req.header(X_REQUEST_ID), Some(id.request_id.as_str()));
        resp.flush().unwrap();
        assert_eq!(handle.header(X_REQUEST_ID), Some(id.request_id.clone()));
    }

    #[test]
    fn real_ip_requires_upstream_request_id() {
        let cfg = ServerConfig::default();
        let (writer, _handle) = BufferWriter::pair();
        let mut resp = Response::new(writer);

        let mut bare = request();
        bare.set_header(X_REAL_IP, "1.2.3.4");
        let id = normalize(&mut bare, &mut resp, &cfg, &UlidGenerator);
        assert_eq!(id.client_ip, "10.0.0.9");

        let (writer, _handle) = BufferWriter::pair();
        let mut resp = Response::new(writer);
        let mut trusted = request();
        trusted.set_header(X_REQUEST_ID, "req-1");
        trusted.set_header(X_REAL_IP, "1.2.3.4");
        let id = normalize(&mut trusted, &mut resp, &cfg, &UlidGenerator);
        assert_eq!(id.client_ip, "1.2.3.4");
    }

    #[test]
    fn real_ip_toggle_trusts_anyone() {
        let cfg = ServerConfig {
            accept_real_ip_without_request_id: true,
            ..ServerConfig::default()
        };
        let (writer, _handle) = BufferWriter::pair();
        let mut resp = Response::new(writer);
        let mut req = request();
        req.set_header(X_REAL_IP, "1.2.3.4");
        let id = normalize(&mut req, &mut resp, &cfg, &UlidGenerator);
        assert_eq!(id.client_ip, "1.2.3.4");
    }

    #[test]
    fn session_id_is_minted_when_configured() {
        let cfg = ServerConfig {
            session_key: Some("x-session-id".to_string()),
            ..ServerConfig::default()
        };
        let (writer, handle) = BufferWriter::pair();
        let mut resp = Response::new(writer);
        let mut req = request();
        let id = normalize(&mut req, &mut resp, &cfg, &UlidGenerator);
        assert!(!id.session_id.is_empty());
        assert_eq!(req.header("x-session-id"), Some(id.session_id.as_str()));
        resp.flush().unwrap();
        assert_eq!(handle.header("x-session-id"), Some(id.session_id.clone()));
    }

    #[test]
    fn scheme_follows_tls_when_not_propagated() {
        let (writer, _handle) = BufferWriter::pair();
        let mut resp = Response::new(writer);
        let mut req = request();
        req.tls = true;
        let id = normalize(&mut req, &mut resp, &ServerConfig::default(), &UlidGenerator);
        assert_eq!(id.scheme, "https");
        assert_eq!(id.host, "svc.local");
    }
}
