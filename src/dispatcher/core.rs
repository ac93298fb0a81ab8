//! The request pipeline.
//!
//! One call to [`Dispatcher::dispatch`] carries a request from identity
//! normalization to the access record: collaborator short-circuits, route
//! resolution, argument assembly, pre-filters, auth, the handler (HTTP) or
//! the session loop (WebSocket), post-filters, encoding, compression and
//! logging. Failures travel as [`DispatchError`] to a single boundary at the
//! end of the pipeline; a panic anywhere in the pipeline (filters, auth,
//! handler) is caught at that same boundary. Per-request scoped injections
//! are released on every exit, panic included, and every exit path reaches
//! the final response flush.

use crate::binder::{self, ArgError, BindContext, HandlerResult, Injector};
use crate::config::ServerConfig;
use crate::filters::{PostFilter, PreFilter};
use crate::identity::{self, IdGenerator, Identity, UlidGenerator};
use crate::logging::{AccessLogEntry, LogSink, LogTag, RequestLogger, TracingSink};
use crate::router::{Resolution, RouteTable};
use crate::sanitize::{mask, sanitize};
use crate::security::AuthGate;
use crate::server::request::{ArgMap, HttpRequest};
use crate::server::response::{Response, ResponseWriter};
use crate::shutdown::ServerStatus;
use crate::websocket::{self, SessionContext, WsError, WsUpgrader};
use flate2::write::GzEncoder;
use flate2::Compression;
use serde_json::{json, Value};
use std::io::Write;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::debug;

/// Terminal failure of one request.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("bad request: {0}")]
    Client(String),
    #[error("authorization rejected")]
    Auth,
    #[error("no route matched")]
    NotFound,
    #[error(transparent)]
    Upgrade(#[from] WsError),
    #[error(transparent)]
    Handler(#[from] anyhow::Error),
}

/// An external request handler tried before route resolution: rewrite
/// engine, proxy forwarder, static file server. Returning `true` means the
/// request was handled fully.
pub trait Collaborator: Send + Sync {
    fn handle(
        &self,
        req: &mut HttpRequest,
        resp: &mut Response,
        started: Instant,
        logger: &RequestLogger,
    ) -> bool;
}

type ErrorHandler = Arc<dyn Fn(&DispatchError, &mut Response) + Send + Sync>;

/// The dispatch core. Configure and register everything first, then share it
/// behind an `Arc` with the transport.
pub struct Dispatcher {
    config: Arc<ServerConfig>,
    routes: RouteTable,
    auth: Arc<AuthGate>,
    injector: Arc<Injector>,
    sink: Arc<dyn LogSink>,
    status: Arc<ServerStatus>,
    session_gen: Arc<dyn IdGenerator>,
    pre_filters: Vec<Arc<dyn PreFilter>>,
    post_filters: Vec<Arc<dyn PostFilter>>,
    rewrites: Vec<Arc<dyn Collaborator>>,
    proxies: Vec<Arc<dyn Collaborator>>,
    statics: Vec<Arc<dyn Collaborator>>,
    error_handler: ErrorHandler,
}

impl Dispatcher {
    pub fn new(config: ServerConfig, injector: Injector) -> Self {
        let config = Arc::new(config);
        let panic_status = config.panic_status;
        Self {
            auth: Arc::new(AuthGate::new(config.clone())),
            config,
            routes: RouteTable::new(),
            injector: Arc::new(injector),
            sink: Arc::new(TracingSink),
            status: Arc::new(ServerStatus::new()),
            session_gen: Arc::new(UlidGenerator),
            pre_filters: Vec::new(),
            post_filters: Vec::new(),
            rewrites: Vec::new(),
            proxies: Vec::new(),
            statics: Vec::new(),
            error_handler: Arc::new(move |err, resp| {
                if let DispatchError::Handler(_) = err {
                    resp.write_status(panic_status);
                }
            }),
        }
    }

    pub fn config(&self) -> &Arc<ServerConfig> {
        &self.config
    }

    pub fn auth(&self) -> &Arc<AuthGate> {
        &self.auth
    }

    pub fn injector(&self) -> &Arc<Injector> {
        &self.injector
    }

    pub fn status(&self) -> &Arc<ServerStatus> {
        &self.status
    }

    pub fn routes_mut(&mut self) -> &mut RouteTable {
        &mut self.routes
    }

    pub fn set_log_sink(&mut self, sink: Arc<dyn LogSink>) {
        self.sink = sink;
    }

    pub fn set_session_generator(&mut self, generator: Arc<dyn IdGenerator>) {
        self.session_gen = generator;
    }

    /// Replace how a recovered handler error maps to a response.
    pub fn set_error_handler<F>(&mut self, handler: F)
    where
        F: Fn(&DispatchError, &mut Response) + Send + Sync + 'static,
    {
        self.error_handler = Arc::new(handler);
    }

    pub fn add_pre_filter(&mut self, filter: Arc<dyn PreFilter>) {
        self.pre_filters.push(filter);
    }

    pub fn add_post_filter(&mut self, filter: Arc<dyn PostFilter>) {
        self.post_filters.push(filter);
    }

    pub fn add_rewrite(&mut self, collaborator: Arc<dyn Collaborator>) {
        self.rewrites.push(collaborator);
    }

    pub fn add_proxy(&mut self, collaborator: Arc<dyn Collaborator>) {
        self.proxies.push(collaborator);
    }

    pub fn add_static(&mut self, collaborator: Arc<dyn Collaborator>) {
        self.statics.push(collaborator);
    }

    /// Serve one request to completion. `upgrader` is the transport's
    /// upgrade capability, consumed only when the request resolves to a
    /// WebSocket service and no pre-filter answered first.
    pub fn dispatch(
        self: &Arc<Self>,
        mut req: HttpRequest,
        writer: Box<dyn ResponseWriter>,
        upgrader: Option<Box<dyn WsUpgrader>>,
    ) {
        let started = Instant::now();
        let _request_guard = self.status.begin_request();
        let mut resp = Response::new(writer);
        let identity = identity::normalize(&mut req, &mut resp, &self.config, &*self.session_gen);
        let logger = RequestLogger::new(&identity.request_id);
        let _scope = self.injector.scope_guard(&identity.request_id);

        let mut handled = false;
        for collaborator in self
            .rewrites
            .iter()
            .chain(self.proxies.iter())
            .chain(self.statics.iter())
        {
            if collaborator.handle(&mut req, &mut resp, started, &logger) {
                self.emit(
                    LogTag::Access,
                    &req,
                    &resp,
                    &identity,
                    0,
                    &ArgMap::new(),
                    Value::Null,
                    Value::Null,
                    started,
                );
                handled = true;
                break;
            }
        }

        if !handled {
            let mut state = LogState::default();
            // One recovery boundary for the whole pipeline: a panic in a
            // filter, the auth checker or the handler lands here.
            let outcome = catch_unwind(AssertUnwindSafe(|| {
                self.run(&mut req, &mut resp, upgrader, &identity, &logger, &mut state)
            }))
            .unwrap_or_else(|payload| {
                Err(DispatchError::Handler(anyhow::anyhow!(
                    websocket::core::panic_text(payload)
                )))
            });

            match outcome {
                Ok(Flow::Answered) => {
                    self.emit(
                        LogTag::Access,
                        &req,
                        &resp,
                        &identity,
                        state.auth_level,
                        &state.args,
                        state.result.clone(),
                        Value::Null,
                        started,
                    );
                }
                Ok(Flow::Silent) => {}
                Err(err) => {
                    let (tag, extra) = match &err {
                        DispatchError::Client(msg) => {
                            resp.write_status(400);
                            (LogTag::Fail, json!({"error": msg}))
                        }
                        DispatchError::Auth => {
                            resp.write_status(403);
                            (LogTag::Reject, Value::Null)
                        }
                        DispatchError::NotFound => {
                            resp.write_status(404);
                            (LogTag::Fail, json!({"error": "not found"}))
                        }
                        DispatchError::Upgrade(e) => {
                            resp.write_status(500);
                            (LogTag::WsOpen, json!({"error": e.to_string()}))
                        }
                        DispatchError::Handler(e) => {
                            (self.error_handler)(&err, &mut resp);
                            (LogTag::Panic, json!({"error": e.to_string()}))
                        }
                    };
                    // Favicon misses answer 404 but never pollute the log.
                    let favicon_miss = matches!(err, DispatchError::NotFound)
                        && req.path == "/favicon.ico";
                    if !favicon_miss {
                        self.emit(
                            tag,
                            &req,
                            &resp,
                            &identity,
                            state.auth_level,
                            &state.args,
                            Value::Null,
                            extra,
                            started,
                        );
                    }
                }
            }
        }

        if let Err(e) = resp.flush() {
            debug!(error = %e, "response flush failed");
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn run(
        self: &Arc<Self>,
        req: &mut HttpRequest,
        resp: &mut Response,
        upgrader: Option<Box<dyn WsUpgrader>>,
        identity: &Identity,
        logger: &RequestLogger,
        state: &mut LogState,
    ) -> Result<Flow, DispatchError> {
        enum Target {
            Http(Arc<crate::router::Route>),
            Ws(Arc<crate::websocket::WebSocketService>),
        }

        let (target, captures, auth_level) = match self.routes.resolve(&req.method, &req.path) {
            Resolution::Http { route, captures } => {
                let level = route.auth_level;
                (Target::Http(route), captures, level)
            }
            Resolution::Ws { service, captures } => {
                let level = service.auth_level;
                (Target::Ws(service), captures, level)
            }
            Resolution::NotFound => {
                // Built-in liveness answer; a route registered on the health
                // path takes precedence over it.
                if req.path == self.config.health_check_path {
                    let status = if self.status.is_stopping() { 503 } else { 200 };
                    resp.write_status(status);
                    return Ok(Flow::Silent);
                }
                return Err(DispatchError::NotFound);
            }
        };
        state.auth_level = auth_level;

        let capture_pairs: Vec<(String, String)> = captures.into_iter().collect();
        let mut args = binder::assemble_args(req, &capture_pairs).map_err(|e| match e {
            ArgError::MalformedJson(inner) => DispatchError::Client(inner.to_string()),
        })?;

        // Pre-filters run before auth and before the HTTP/WebSocket fork. A
        // filter that answers also keeps a WebSocket path from upgrading;
        // its result still flows through the post-filter chain.
        for filter in &self.pre_filters {
            if let Some(result) = filter.before(&mut args, req, resp) {
                state.args = args.clone();
                let result = self.apply_post_filters(&args, req, resp, Some(result));
                return Ok(match result {
                    Some(HandlerResult::None) | None => Flow::Silent,
                    Some(result) => {
                        state.result = self.write_result(req, resp, &result, logger);
                        Flow::Answered
                    }
                });
            }
        }

        if !self.auth.check_http(auth_level, req, &args) {
            state.args = args;
            return Err(DispatchError::Auth);
        }
        state.args = args.clone();

        match target {
            Target::Http(route) => {
                let req_arc = Arc::new(req.clone());
                let ctx = BindContext {
                    args: &args,
                    request: Some(req_arc),
                    logger: logger.clone(),
                    connection: None,
                    session: None,
                    injector: &self.injector,
                    request_id: logger.request_id(),
                };
                let params = binder::bind(&route.handler.descriptor, &ctx);
                let result = (route.handler.func)(params).map_err(DispatchError::Handler)?;
                let result = self.apply_post_filters(&args, req, resp, Some(result));

                match result {
                    Some(HandlerResult::None) | None => Ok(Flow::Silent),
                    Some(result) => {
                        state.result = self.write_result(req, resp, &result, logger);
                        Ok(Flow::Answered)
                    }
                }
            }
            Target::Ws(service) => {
                let upgrader = upgrader.ok_or_else(|| {
                    DispatchError::Upgrade(WsError::Upgrade(
                        "transport cannot upgrade this connection".to_string(),
                    ))
                })?;
                let conn = upgrader
                    .upgrade(&service.upgrade)
                    .map_err(DispatchError::Upgrade)?;
                let base = self.base_entry(req, resp, identity, auth_level);
                websocket::run_session(SessionContext {
                    service,
                    conn,
                    request: Arc::new(req.clone()),
                    args,
                    logger: logger.clone(),
                    injector: self.injector.clone(),
                    config: self.config.clone(),
                    sink: self.sink.clone(),
                    status: self.status.clone(),
                    auth: self.auth.clone(),
                    base,
                });
                Ok(Flow::Silent)
            }
        }
    }

    /// Run the post-filter chain, letting each filter replace the result in
    /// turn until one asks to stop.
    fn apply_post_filters(
        &self,
        args: &ArgMap,
        req: &HttpRequest,
        resp: &mut Response,
        mut result: Option<HandlerResult>,
    ) -> Option<HandlerResult> {
        for filter in &self.post_filters {
            let (replacement, stop) = filter.after(args, req, resp, result.as_ref());
            if let Some(replacement) = replacement {
                result = Some(replacement);
            }
            if stop {
                break;
            }
        }
        result
    }

    /// Encode and write a handler result. Returns the value recorded for the
    /// access log (wire bytes stay untruncated).
    fn write_result(
        &self,
        req: &HttpRequest,
        resp: &mut Response,
        result: &HandlerResult,
        logger: &RequestLogger,
    ) -> Value {
        let (body, logged): (Vec<u8>, Value) = match result {
            HandlerResult::None => return Value::Null,
            HandlerResult::Text(text) => (text.clone().into_bytes(), Value::String(text.clone())),
            HandlerResult::Bytes(bytes) => (
                bytes.clone(),
                Value::String(format!("bytes ({})", bytes.len())),
            ),
            HandlerResult::Json(value) => {
                resp.set_header("content-type", "application/json");
                match serde_json::to_vec(value) {
                    Ok(encoded) => (encoded, value.clone()),
                    Err(e) => {
                        logger.error("result encoding failed", json!(e.to_string()));
                        return Value::Null;
                    }
                }
            }
        };

        let body = self.maybe_compress(req, resp, body, logger);
        if let Err(e) = resp.write(&body) {
            // The transport is assumed partially committed; log and move on.
            logger.error("response write failed", json!(e.to_string()));
        }
        logged
    }

    /// Gzip the body when enabled, sized within the configured window and
    /// accepted by the client. Compression failure falls back to the plain
    /// body.
    fn maybe_compress(
        &self,
        req: &HttpRequest,
        resp: &mut Response,
        body: Vec<u8>,
        logger: &RequestLogger,
    ) -> Vec<u8> {
        if !self.config.compress
            || body.len() < self.config.compress_min_size
            || body.len() > self.config.compress_max_size
            || !accepts_gzip(req)
        {
            return body;
        }
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        let compressed = encoder
            .write_all(&body)
            .and_then(|()| encoder.finish());
        match compressed {
            Ok(compressed) => {
                resp.set_header("content-encoding", "gzip");
                compressed
            }
            Err(e) => {
                logger.error("gzip failed, sending plain body", json!(e.to_string()));
                body
            }
        }
    }

    fn base_entry(
        &self,
        req: &HttpRequest,
        resp: &Response,
        identity: &Identity,
        auth_level: u32,
    ) -> AccessLogEntry {
        AccessLogEntry {
            server_id: self.config.server_id.clone(),
            app: self.config.app.clone(),
            addr: self.config.addr.clone(),
            client_ip: identity.client_ip.clone(),
            from_app: identity.from_app.clone(),
            from_node: identity.from_node.clone(),
            client_id: identity.client_id.clone(),
            session_id: identity.session_id.clone(),
            request_id: identity.request_id.clone(),
            host: identity.host.clone(),
            scheme: identity.scheme.clone(),
            proto: req.proto.clone(),
            auth_level,
            priority: 0,
            method: req.method.to_string(),
            path: req.path.clone(),
            headers: self.logged_headers(&req.headers),
            args: Value::Null,
            used_ms: 0.0,
            status: resp.status(),
            out_headers: self.logged_headers(&resp.headers_snapshot()),
            out_len: 0,
            result: Value::Null,
            extra: Value::Null,
        }
    }

    /// Headers as logged: configured noise dropped, sensitive values masked.
    fn logged_headers(
        &self,
        headers: &std::collections::HashMap<String, String>,
    ) -> Value {
        let mut out = ArgMap::new();
        for (name, value) in headers {
            if self.config.no_log_headers.contains(name.as_str()) {
                continue;
            }
            let logged = if self.config.requires_mask(name) {
                mask(value)
            } else {
                value.clone()
            };
            out.insert(name.clone(), Value::String(logged));
        }
        Value::Object(out)
    }

    #[allow(clippy::too_many_arguments)]
    fn emit(
        &self,
        tag: LogTag,
        req: &HttpRequest,
        resp: &Response,
        identity: &Identity,
        auth_level: u32,
        args: &ArgMap,
        result: Value,
        extra: Value,
        started: Instant,
    ) {
        if self.config.no_log_gets && req.method == http::Method::GET {
            return;
        }
        if req.path == self.config.health_check_path {
            return;
        }
        let mut entry = self.base_entry(req, resp, identity, auth_level);
        entry.status = resp.status();
        entry.used_ms = started.elapsed().as_secs_f64() * 1000.0;
        entry.args = sanitize(
            &Value::Object(args.clone()),
            None,
            self.config.log_input_array_num,
            1,
            &self.config.encrypt_log_fields,
        );
        entry.result = sanitize(
            &result,
            self.config.log_output_fields.as_ref(),
            self.config.log_output_array_num,
            1,
            &self.config.encrypt_log_fields,
        );
        entry.out_headers = self.logged_headers(&resp.headers_snapshot());
        entry.out_len = out_len_of(resp);
        let mut extra_obj = match extra {
            Value::Object(map) => map,
            Value::Null => ArgMap::new(),
            other => {
                let mut map = ArgMap::new();
                map.insert("detail".to_string(), other);
                map
            }
        };
        extra_obj.insert("type".to_string(), Value::String(tag.as_str().to_string()));
        entry.extra = Value::Object(extra_obj);
        self.sink.emit(entry);
    }
}

/// Output length for the record: bytes written, or the declared
/// `Content-Length` when the body was handed off without local writes.
fn out_len_of(resp: &Response) -> u64 {
    let written = resp.out_len() as u64;
    if written > 0 {
        return written;
    }
    resp.headers_snapshot()
        .get("content-length")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0)
}

fn accepts_gzip(req: &HttpRequest) -> bool {
    req.header("accept-encoding")
        .map(|v| v.to_ascii_lowercase().contains("gzip"))
        .unwrap_or(false)
}

/// How a successfully handled request finished.
enum Flow {
    /// A body (possibly empty) was produced; emit an ACCESS record.
    Answered,
    /// Nothing to record here: a `None` result, or a WebSocket session that
    /// wrote its own records.
    Silent,
}

struct LogState {
    args: ArgMap,
    auth_level: u32,
    result: Value,
}

impl Default for LogState {
    fn default() -> Self {
        Self {
            args: ArgMap::new(),
            auth_level: 0,
            result: Value::Null,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::Method;

    #[test]
    fn gzip_requires_client_support() {
        let mut req = HttpRequest::new(Method::GET, "/");
        assert!(!accepts_gzip(&req));
        req.set_header("accept-encoding", "br, GZIP");
        assert!(accepts_gzip(&req));
    }
}
