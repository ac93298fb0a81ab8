use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex};

/// Transport seam: anything that can carry a response back to the client.
///
/// Implementations are expected to tolerate `write_status` arriving at most
/// once and headers arriving before the first body write.
pub trait ResponseWriter: Send {
    fn write_status(&mut self, status: u16);
    fn set_header(&mut self, name: &str, value: &str);
    fn write(&mut self, bytes: &[u8]) -> io::Result<usize>;
    fn flush(&mut self) -> io::Result<()>;
}

pub fn status_reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        201 => "Created",
        101 => "Switching Protocols",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => "OK",
    }
}

/// Response wrapper owning the transport writer.
///
/// Tracks the status (default 200) and bytes written, and holds headers a
/// reverse-proxy collaborator wants merged. Proxy headers are copied to the
/// writer on the first write, flush or status write, not immediately; the
/// upstream-failure codes 502/503/504 skip the local status write so the
/// proxy's own handling still applies.
pub struct Response {
    writer: Box<dyn ResponseWriter>,
    status: u16,
    out_len: usize,
    status_written: bool,
    headers: HashMap<String, String>,
    proxy_headers: Option<HashMap<String, String>>,
}

impl Response {
    pub fn new(writer: Box<dyn ResponseWriter>) -> Self {
        Response {
            writer,
            status: 200,
            out_len: 0,
            status_written: false,
            headers: HashMap::new(),
            proxy_headers: None,
        }
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn out_len(&self) -> usize {
        self.out_len
    }

    /// Headers as they will appear on the wire, including still-deferred
    /// proxy headers. Used for the access record.
    pub fn headers_snapshot(&self) -> HashMap<String, String> {
        let mut snap = self.headers.clone();
        if let Some(proxy) = &self.proxy_headers {
            for (k, v) in proxy {
                snap.insert(k.clone(), v.clone());
            }
        }
        snap
    }

    /// Set a header. While proxy headers are pending, writes land in the
    /// proxy set so the merge keeps a single source of truth.
    pub fn set_header(&mut self, name: &str, value: &str) {
        let name = name.to_ascii_lowercase();
        if let Some(proxy) = &mut self.proxy_headers {
            proxy.insert(name, value.to_string());
            return;
        }
        self.headers.insert(name.clone(), value.to_string());
        self.writer.set_header(&name, value);
    }

    /// Install headers from a reverse-proxy collaborator; merged on the next
    /// write, flush or status write.
    pub fn set_proxy_headers(&mut self, headers: HashMap<String, String>) {
        let lowered = headers
            .into_iter()
            .map(|(k, v)| (k.to_ascii_lowercase(), v))
            .collect();
        self.proxy_headers = Some(lowered);
    }

    fn merge_proxy_headers(&mut self) {
        if let Some(proxy) = self.proxy_headers.take() {
            for (k, v) in proxy {
                self.writer.set_header(&k, &v);
                self.headers.insert(k, v);
            }
        }
    }

    /// Record (and usually emit) the status code.
    pub fn write_status(&mut self, status: u16) {
        self.status = status;
        if self.proxy_headers.is_some() && matches!(status, 502 | 503 | 504) {
            // Let the proxy collaborator's own handling win.
            return;
        }
        if !self.status_written {
            self.writer.write_status(status);
            self.status_written = true;
        }
        self.merge_proxy_headers();
    }

    pub fn write(&mut self, bytes: &[u8]) -> io::Result<usize> {
        self.out_len += bytes.len();
        self.merge_proxy_headers();
        if !self.status_written {
            self.writer.write_status(self.status);
            self.status_written = true;
        }
        self.writer.write(bytes)
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.merge_proxy_headers();
        self.writer.flush()
    }
}

/// In-memory [`ResponseWriter`] with a shared inspection handle. The bundled
/// transport uses a stream-backed writer; this one backs tests and any
/// embedding that wants to capture a response.
#[derive(Default, Debug)]
pub struct BufferInner {
    pub status: Option<u16>,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
    pub flushed: bool,
}

#[derive(Clone, Default)]
pub struct BufferHandle(Arc<Mutex<BufferInner>>);

impl BufferHandle {
    pub fn status(&self) -> Option<u16> {
        self.0.lock().ok().and_then(|b| b.status)
    }

    pub fn header(&self, name: &str) -> Option<String> {
        self.0
            .lock()
            .ok()
            .and_then(|b| b.headers.get(&name.to_ascii_lowercase()).cloned())
    }

    pub fn body(&self) -> Vec<u8> {
        self.0.lock().map(|b| b.body.clone()).unwrap_or_default()
    }

    pub fn body_string(&self) -> String {
        String::from_utf8_lossy(&self.body()).into_owned()
    }

    pub fn flushed(&self) -> bool {
        self.0.lock().map(|b| b.flushed).unwrap_or(false)
    }
}

pub struct BufferWriter(BufferHandle);

impl BufferWriter {
    pub fn pair() -> (Box<dyn ResponseWriter>, BufferHandle) {
        let handle = BufferHandle::default();
        (Box::new(BufferWriter(handle.clone())), handle)
    }
}

impl ResponseWriter for BufferWriter {
    fn write_status(&mut self, status: u16) {
        if let Ok(mut inner) = self.0 .0.lock() {
            inner.status.get_or_insert(status);
        }
    }

    fn set_header(&mut self, name: &str, value: &str) {
        if let Ok(mut inner) = self.0 .0.lock() {
            inner.headers.insert(name.to_ascii_lowercase(), value.to_string());
        }
    }

    fn write(&mut self, bytes: &[u8]) -> io::Result<usize> {
        if let Ok(mut inner) = self.0 .0.lock() {
            inner.body.extend_from_slice(bytes);
        }
        Ok(bytes.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if let Ok(mut inner) = self.0 .0.lock() {
            inner.flushed = true;
        }
        Ok(())
    }
}
