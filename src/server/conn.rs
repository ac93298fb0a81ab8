//! Per-connection serving loop.
//!
//! One coroutine owns one TCP connection: parse a request head with
//! `httparse`, read the body, dispatch, repeat while keep-alive holds. When
//! a request upgrades to WebSocket the loop hands the raw stream to
//! `tungstenite` and ends once the session loop returns.

use crate::dispatcher::Dispatcher;
use crate::server::request::HttpRequest;
use crate::server::response::{status_reason, ResponseWriter};
use crate::websocket::{UpgradeConfig, WsConnection, WsError, WsUpgrader};
use http::Method;
use may::net::TcpStream;
use serde_json::Value;
use std::io::{self, Read, Write};
use std::net::Shutdown;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};
use tungstenite::handshake::derive_accept_key;
use tungstenite::protocol::{Message, Role, WebSocket, WebSocketConfig};

const MAX_HEADERS: usize = 64;
const READ_CHUNK: usize = 4096;
const MAX_HEAD_BYTES: usize = 64 * 1024;

struct Head {
    method: Method,
    target: String,
    proto: String,
    headers: Vec<(String, String)>,
    head_len: usize,
}

fn parse_head(buf: &[u8]) -> io::Result<Option<Head>> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut parsed = httparse::Request::new(&mut headers);
    match parsed.parse(buf) {
        Ok(httparse::Status::Complete(head_len)) => {
            let method = parsed
                .method
                .and_then(|m| Method::from_bytes(m.as_bytes()).ok())
                .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "bad method"))?;
            let target = parsed
                .path
                .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "bad target"))?
                .to_string();
            let proto = match parsed.version {
                Some(0) => "1.0".to_string(),
                _ => "1.1".to_string(),
            };
            let headers = parsed
                .headers
                .iter()
                .map(|h| {
                    (
                        h.name.to_ascii_lowercase(),
                        String::from_utf8_lossy(h.value).into_owned(),
                    )
                })
                .collect();
            Ok(Some(Head {
                method,
                target,
                proto,
                headers,
                head_len,
            }))
        }
        Ok(httparse::Status::Partial) => Ok(None),
        Err(e) => Err(io::Error::new(io::ErrorKind::InvalidData, e.to_string())),
    }
}

/// Serve every request arriving on `stream` until the peer hangs up, the
/// connection upgrades, or keep-alive ends.
pub fn handle_connection(dispatcher: Arc<Dispatcher>, stream: TcpStream) {
    let peer = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_default();
    let mut stream = stream;
    let mut buf: Vec<u8> = Vec::with_capacity(READ_CHUNK);

    loop {
        let head = match read_head(&mut stream, &mut buf) {
            Ok(Some(head)) => head,
            Ok(None) => break,
            Err(e) => {
                debug!(peer = %peer, error = %e, "dropping unparseable connection");
                break;
            }
        };

        let content_length = head
            .headers
            .iter()
            .find(|(name, _)| name == "content-length")
            .and_then(|(_, v)| v.parse::<usize>().ok())
            .unwrap_or(0);
        let body = match read_body(&mut stream, &mut buf, head.head_len, content_length) {
            Ok(body) => body,
            Err(e) => {
                debug!(peer = %peer, error = %e, "body read failed");
                break;
            }
        };

        let mut req = HttpRequest::new(head.method, &head.target);
        req.proto = head.proto.clone();
        req.remote_addr = peer.clone();
        for (name, value) in &head.headers {
            req.set_header(name, value.clone());
        }
        req.host = req.header("host").unwrap_or_default().to_string();
        if !body.is_empty() {
            req.body = Some(body);
        }

        let keep_alive = match req.header("connection").map(str::to_ascii_lowercase) {
            Some(v) if v.contains("close") => false,
            None if head.proto == "1.0" => false,
            _ => true,
        };

        let upgraded = Arc::new(AtomicBool::new(false));
        let upgrader: Option<Box<dyn WsUpgrader>> = if wants_upgrade(&req) {
            match stream.try_clone() {
                Ok(clone) => Some(Box::new(StreamUpgrader {
                    stream: clone,
                    key: req.header("sec-websocket-key").map(str::to_string),
                    offered_protocols: req
                        .header("sec-websocket-protocol")
                        .map(str::to_string),
                    consumed: upgraded.clone(),
                })),
                Err(e) => {
                    warn!(error = %e, "cannot clone stream for upgrade");
                    None
                }
            }
        } else {
            None
        };

        let writer = match stream.try_clone() {
            Ok(clone) => StreamWriter::new(clone, keep_alive),
            Err(e) => {
                warn!(error = %e, "cannot clone stream for response");
                break;
            }
        };
        dispatcher.dispatch(req, Box::new(writer), upgrader);

        if upgraded.load(Ordering::SeqCst) || !keep_alive || dispatcher.status().is_stopping() {
            break;
        }
    }
}

fn wants_upgrade(req: &HttpRequest) -> bool {
    let connection = req
        .header("connection")
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    let upgrade = req
        .header("upgrade")
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    connection.contains("upgrade") && upgrade == "websocket"
}

fn read_head(stream: &mut TcpStream, buf: &mut Vec<u8>) -> io::Result<Option<Head>> {
    loop {
        if let Some(head) = parse_head(buf)? {
            return Ok(Some(head));
        }
        if buf.len() > MAX_HEAD_BYTES {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "request head too large",
            ));
        }
        let mut chunk = [0u8; READ_CHUNK];
        let n = stream.read(&mut chunk)?;
        if n == 0 {
            return Ok(None);
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

/// Pull the body out of `buf`, reading more as needed, and leave any
/// pipelined bytes behind for the next request.
fn read_body(
    stream: &mut TcpStream,
    buf: &mut Vec<u8>,
    head_len: usize,
    content_length: usize,
) -> io::Result<Vec<u8>> {
    while buf.len() < head_len + content_length {
        let mut chunk = [0u8; READ_CHUNK];
        let n = stream.read(&mut chunk)?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "body truncated",
            ));
        }
        buf.extend_from_slice(&chunk[..n]);
    }
    let body = buf[head_len..head_len + content_length].to_vec();
    buf.drain(..head_len + content_length);
    Ok(body)
}

/// Buffers one response and writes it on flush, so `Content-Length` can be
/// set from the final body. Nothing is sent unless a status was written.
pub struct StreamWriter {
    stream: TcpStream,
    keep_alive: bool,
    status: Option<u16>,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
    sent: bool,
}

impl StreamWriter {
    pub fn new(stream: TcpStream, keep_alive: bool) -> Self {
        Self {
            stream,
            keep_alive,
            status: None,
            headers: Vec::new(),
            body: Vec::new(),
            sent: false,
        }
    }
}

impl ResponseWriter for StreamWriter {
    fn write_status(&mut self, status: u16) {
        self.status.get_or_insert(status);
    }

    fn set_header(&mut self, name: &str, value: &str) {
        let name = name.to_ascii_lowercase();
        if let Some(slot) = self.headers.iter_mut().find(|(n, _)| *n == name) {
            slot.1 = value.to_string();
        } else {
            self.headers.push((name, value.to_string()));
        }
    }

    fn write(&mut self, bytes: &[u8]) -> io::Result<usize> {
        self.body.extend_from_slice(bytes);
        Ok(bytes.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        let Some(status) = self.status else {
            return Ok(());
        };
        if self.sent {
            return Ok(());
        }
        self.sent = true;
        let mut out = format!("HTTP/1.1 {} {}\r\n", status, status_reason(status));
        for (name, value) in &self.headers {
            if name == "content-length" || name == "connection" {
                continue;
            }
            out.push_str(name);
            out.push_str(": ");
            out.push_str(value);
            out.push_str("\r\n");
        }
        out.push_str(&format!("content-length: {}\r\n", self.body.len()));
        out.push_str(if self.keep_alive {
            "connection: keep-alive\r\n\r\n"
        } else {
            "connection: close\r\n\r\n"
        });
        self.stream.write_all(out.as_bytes())?;
        if !self.body.is_empty() {
            self.stream.write_all(&self.body)?;
        }
        self.stream.flush()
    }
}

/// Upgrades the connection in place: writes the 101 handshake and wraps the
/// raw stream in a `tungstenite` server socket.
struct StreamUpgrader {
    stream: TcpStream,
    key: Option<String>,
    offered_protocols: Option<String>,
    consumed: Arc<AtomicBool>,
}

impl WsUpgrader for StreamUpgrader {
    fn upgrade(
        mut self: Box<Self>,
        config: &UpgradeConfig,
    ) -> Result<Arc<dyn WsConnection>, WsError> {
        let key = self
            .key
            .take()
            .ok_or_else(|| WsError::Upgrade("missing sec-websocket-key".to_string()))?;
        let accept = derive_accept_key(key.as_bytes());

        let mut response = format!(
            "HTTP/1.1 101 Switching Protocols\r\nupgrade: websocket\r\nconnection: Upgrade\r\nsec-websocket-accept: {accept}\r\n"
        );
        if let (Some(wanted), Some(offered)) = (&config.subprotocol, &self.offered_protocols) {
            if offered
                .split(',')
                .any(|p| p.trim().eq_ignore_ascii_case(wanted))
            {
                response.push_str(&format!("sec-websocket-protocol: {wanted}\r\n"));
            }
        }
        response.push_str("\r\n");
        self.stream
            .write_all(response.as_bytes())
            .and_then(|()| self.stream.flush())
            .map_err(|e| WsError::Upgrade(e.to_string()))?;

        self.consumed.store(true, Ordering::SeqCst);

        let raw = self
            .stream
            .try_clone()
            .map_err(|e| WsError::Upgrade(e.to_string()))?;
        let mut ws_config = WebSocketConfig::default();
        if let Some(max) = config.max_message_size {
            ws_config = ws_config.max_message_size(Some(max));
        }
        let socket = WebSocket::from_raw_socket(self.stream, Role::Server, Some(ws_config));
        Ok(Arc::new(TungsteniteConn {
            socket: Mutex::new(socket),
            raw,
            closed: AtomicBool::new(false),
        }))
    }
}

/// `tungstenite` socket behind the engine's connection seam. The extra raw
/// handle lets `close` interrupt a blocking read via socket shutdown.
struct TungsteniteConn {
    socket: Mutex<WebSocket<TcpStream>>,
    raw: TcpStream,
    closed: AtomicBool,
}

impl WsConnection for TungsteniteConn {
    fn read_message(&self) -> Result<Option<Value>, WsError> {
        let mut socket = self
            .socket
            .lock()
            .map_err(|_| WsError::Read("socket lock poisoned".to_string()))?;
        loop {
            match socket.read() {
                Ok(Message::Text(text)) => {
                    return serde_json::from_str(text.as_str())
                        .map(Some)
                        .map_err(|e| WsError::Read(e.to_string()));
                }
                Ok(Message::Binary(bytes)) => {
                    return serde_json::from_slice(&bytes)
                        .map(Some)
                        .map_err(|e| WsError::Read(e.to_string()));
                }
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) | Ok(Message::Frame(_)) => {}
                Ok(Message::Close(_)) => return Ok(None),
                Err(tungstenite::Error::ConnectionClosed)
                | Err(tungstenite::Error::AlreadyClosed) => return Ok(None),
                Err(e) => {
                    if self.closed.load(Ordering::SeqCst) {
                        return Ok(None);
                    }
                    return Err(WsError::Read(e.to_string()));
                }
            }
        }
    }

    fn write_text(&self, text: &str) -> Result<(), WsError> {
        let mut socket = self
            .socket
            .lock()
            .map_err(|_| WsError::Write("socket lock poisoned".to_string()))?;
        socket
            .send(Message::Text(text.to_string().into()))
            .map_err(|e| WsError::Write(e.to_string()))
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        if let Err(e) = self.raw.shutdown(Shutdown::Both) {
            debug!(error = %e, "websocket shutdown");
        }
    }
}
