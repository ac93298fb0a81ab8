//! WebSocket services, actions and the session loop.
//!
//! A service is registered on a path like any route. When an HTTP request
//! matches it, the dispatcher upgrades the connection, runs the open handler
//! and hands the connection to [`run_session`], which reads envelopes and
//! dispatches them to named actions sequentially until the peer closes, a
//! transport error occurs or an action fails.

use crate::binder::{self, BindContext, BoundParams, HandlerDescriptor};
use crate::config::ServerConfig;
use crate::logging::{AccessLogEntry, LogSink, LogTag, RequestLogger};
use crate::sanitize::sanitize;
use crate::security::AuthGate;
use crate::server::request::{ArgMap, HttpRequest};
use crate::shutdown::ServerStatus;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, RwLock};
use std::time::Instant;
use thiserror::Error;
use tracing::debug;

pub use crate::binder::SessionValue;

/// WebSocket transport failure.
#[derive(Debug, Error)]
pub enum WsError {
    #[error("websocket read failed: {0}")]
    Read(String),
    #[error("websocket write failed: {0}")]
    Write(String),
    #[error("websocket upgrade failed: {0}")]
    Upgrade(String),
    #[error("websocket connection closed")]
    Closed,
}

/// A live WebSocket connection, as the engine sees it.
///
/// `read_message` blocks until the next complete JSON message; `Ok(None)`
/// means the peer closed cleanly. `close` must also interrupt a concurrent
/// blocking read, so shutdown can force a session loop to exit.
pub trait WsConnection: Send + Sync {
    fn read_message(&self) -> Result<Option<Value>, WsError>;
    fn write_text(&self, text: &str) -> Result<(), WsError>;
    fn close(&self);
}

/// Performs the HTTP upgrade and yields the connection. Supplied by the
/// transport; consumed at most once per request.
pub trait WsUpgrader: Send {
    fn upgrade(self: Box<Self>, config: &UpgradeConfig) -> Result<Arc<dyn WsConnection>, WsError>;
}

/// Upgrade-time knobs for one service.
#[derive(Debug, Clone, Default)]
pub struct UpgradeConfig {
    /// Subprotocol echoed in the handshake when the client offers it.
    pub subprotocol: Option<String>,
    /// Largest inbound message accepted, in bytes. `None` leaves the
    /// transport default.
    pub max_message_size: Option<usize>,
}

/// Reply from an action handler. `action` names the envelope the reply goes
/// out under; both fields `None` means nothing is written back.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ActionReply {
    pub action: Option<String>,
    pub data: Option<Value>,
}

/// A registered action handler.
#[derive(Clone)]
pub struct WsHandlerSpec {
    pub descriptor: HandlerDescriptor,
    pub func: Arc<dyn Fn(BoundParams) -> Result<ActionReply, anyhow::Error> + Send + Sync>,
}

impl WsHandlerSpec {
    pub fn new<F>(descriptor: HandlerDescriptor, func: F) -> Self
    where
        F: Fn(BoundParams) -> Result<ActionReply, anyhow::Error> + Send + Sync + 'static,
    {
        Self {
            descriptor,
            func: Arc::new(func),
        }
    }
}

/// One named action on a service.
pub struct WsAction {
    pub auth_level: u32,
    /// Recorded for operators; never consulted by dispatch.
    pub priority: i32,
    pub spec: WsHandlerSpec,
}

/// Open handler: runs once after the upgrade, may establish session state.
#[derive(Clone)]
pub struct WsOpenSpec {
    pub descriptor: HandlerDescriptor,
    pub func: Arc<dyn Fn(BoundParams) -> Result<Option<SessionValue>, anyhow::Error> + Send + Sync>,
}

/// Close handler: runs once when the loop ends, whatever ended it.
#[derive(Clone)]
pub struct WsCloseSpec {
    pub descriptor: HandlerDescriptor,
    pub func: Arc<dyn Fn(BoundParams) -> Result<(), anyhow::Error> + Send + Sync>,
}

type Decoder = Arc<dyn Fn(&Value) -> Result<(String, ArgMap), anyhow::Error> + Send + Sync>;
type Encoder = Arc<dyn Fn(&ActionReply) -> Result<Option<String>, anyhow::Error> + Send + Sync>;

/// Default inbound envelope: an object carrying an `action` field dispatches
/// under that name with the whole object as arguments; anything else goes to
/// the fallback action wrapped as `{"data": message}`.
pub fn default_decode(message: &Value) -> Result<(String, ArgMap), anyhow::Error> {
    if let Value::Object(map) = message {
        if let Some(action) = map.get("action") {
            let name = match action {
                Value::String(name) => name.clone(),
                other => other.to_string(),
            };
            return Ok((name, map.clone()));
        }
    }
    let mut args = ArgMap::new();
    args.insert("data".to_string(), message.clone());
    Ok((String::new(), args))
}

/// Default outbound envelope: the reply data with the action name merged in
/// as `action`. A reply without data writes nothing.
pub fn default_encode(reply: &ActionReply) -> Result<Option<String>, anyhow::Error> {
    let mut out = match &reply.data {
        Some(Value::Object(map)) => map.clone(),
        Some(other) => {
            let mut map = ArgMap::new();
            map.insert("data".to_string(), other.clone());
            map
        }
        None => return Ok(None),
    };
    if let Some(action) = &reply.action {
        out.insert("action".to_string(), Value::String(action.clone()));
    }
    Ok(Some(serde_json::to_string(&Value::Object(out))?))
}

/// A WebSocket service bound to one path.
pub struct WebSocketService {
    pub auth_level: u32,
    /// Recorded for operators; never consulted by matching.
    pub priority: i32,
    pub upgrade: UpgradeConfig,
    open: Option<WsOpenSpec>,
    close: Option<WsCloseSpec>,
    decoder: Decoder,
    encoder: Encoder,
    actions: RwLock<HashMap<String, Arc<WsAction>>>,
}

impl WebSocketService {
    pub fn new(auth_level: u32, priority: i32, upgrade: UpgradeConfig) -> Self {
        Self {
            auth_level,
            priority,
            upgrade,
            open: None,
            close: None,
            decoder: Arc::new(default_decode),
            encoder: Arc::new(default_encode),
            actions: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_open<F>(mut self, descriptor: HandlerDescriptor, func: F) -> Self
    where
        F: Fn(BoundParams) -> Result<Option<SessionValue>, anyhow::Error> + Send + Sync + 'static,
    {
        self.open = Some(WsOpenSpec {
            descriptor,
            func: Arc::new(func),
        });
        self
    }

    pub fn with_close<F>(mut self, descriptor: HandlerDescriptor, func: F) -> Self
    where
        F: Fn(BoundParams) -> Result<(), anyhow::Error> + Send + Sync + 'static,
    {
        self.close = Some(WsCloseSpec {
            descriptor,
            func: Arc::new(func),
        });
        self
    }

    /// Replace the inbound envelope decoder.
    pub fn with_decoder<F>(mut self, decoder: F) -> Self
    where
        F: Fn(&Value) -> Result<(String, ArgMap), anyhow::Error> + Send + Sync + 'static,
    {
        self.decoder = Arc::new(decoder);
        self
    }

    /// Replace the outbound envelope encoder.
    pub fn with_encoder<F>(mut self, encoder: F) -> Self
    where
        F: Fn(&ActionReply) -> Result<Option<String>, anyhow::Error> + Send + Sync + 'static,
    {
        self.encoder = Arc::new(encoder);
        self
    }

    fn action(&self, name: &str) -> Option<Arc<WsAction>> {
        let actions = self.actions.read().ok()?;
        actions
            .get(name)
            .or_else(|| actions.get(""))
            .cloned()
    }
}

/// Handle returned by service registration; adds named actions to the
/// service. The action named `""` is the fallback for unmatched names.
#[derive(Clone)]
pub struct ActionRegister {
    service: Arc<WebSocketService>,
}

impl ActionRegister {
    pub fn new(service: Arc<WebSocketService>) -> Self {
        Self { service }
    }

    pub fn register_action<F>(
        &self,
        name: &str,
        auth_level: u32,
        priority: i32,
        descriptor: HandlerDescriptor,
        func: F,
    ) where
        F: Fn(BoundParams) -> Result<ActionReply, anyhow::Error> + Send + Sync + 'static,
    {
        let action = Arc::new(WsAction {
            auth_level,
            priority,
            spec: WsHandlerSpec::new(descriptor, func),
        });
        if let Ok(mut actions) = self.service.actions.write() {
            actions.insert(name.to_string(), action);
        }
    }
}

/// Everything a session loop needs, assembled by the dispatcher.
pub struct SessionContext {
    pub service: Arc<WebSocketService>,
    pub conn: Arc<dyn WsConnection>,
    pub request: Arc<HttpRequest>,
    pub args: ArgMap,
    pub logger: RequestLogger,
    pub injector: Arc<crate::binder::Injector>,
    pub config: Arc<ServerConfig>,
    pub sink: Arc<dyn LogSink>,
    pub status: Arc<ServerStatus>,
    pub auth: Arc<AuthGate>,
    /// Prefilled identity/transport fields; per-event fields are overwritten
    /// before each emit.
    pub base: AccessLogEntry,
}

impl SessionContext {
    fn record(&self, tag: LogTag, used_ms: f64, args: Value, result: Value, extra: Value) {
        // WebSocket upgrades ride on GET requests, so the GET suppression
        // silences session records too.
        if self.config.no_log_gets && self.request.method == http::Method::GET {
            return;
        }
        let mut entry = self.base.clone();
        entry.used_ms = used_ms;
        entry.args = args;
        entry.result = result;
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

    fn bind(
        &self,
        descriptor: &HandlerDescriptor,
        args: &ArgMap,
        session: &Option<SessionValue>,
    ) -> BoundParams {
        let ctx = BindContext {
            args,
            request: Some(self.request.clone()),
            logger: self.logger.clone(),
            connection: Some(self.conn.clone()),
            session: session.clone(),
            injector: &self.injector,
            request_id: self.logger.request_id(),
        };
        binder::bind(descriptor, &ctx)
    }

    fn sanitized_in(&self, args: &ArgMap) -> Value {
        sanitize(
            &Value::Object(args.clone()),
            None,
            self.config.log_input_array_num,
            1,
            &self.config.encrypt_log_fields,
        )
    }

    fn sanitized_out(&self, value: &Value) -> Value {
        sanitize(
            value,
            self.config.log_output_fields.as_ref(),
            self.config.log_output_array_num,
            1,
            &self.config.encrypt_log_fields,
        )
    }
}

/// Run one connection's session to completion.
///
/// Opens the session, then reads and dispatches envelopes sequentially. The
/// loop ends on peer close, read error, or an action/encode/write failure;
/// whatever ends it, the close handler runs, the connection leaves the
/// shutdown set and one WSCLOSE record is emitted.
pub fn run_session(ctx: SessionContext) {
    let opened_at = Instant::now();
    let request_id = ctx.logger.request_id().to_string();

    ctx.record(
        LogTag::WsOpen,
        ms_since(opened_at),
        ctx.sanitized_in(&ctx.args),
        Value::Null,
        json!({"message": "upgraded"}),
    );

    let session = match open_session(&ctx) {
        Ok(session) => session,
        Err(err) => {
            ctx.record(
                LogTag::Panic,
                ms_since(opened_at),
                ctx.sanitized_in(&ctx.args),
                Value::Null,
                json!({"error": err.to_string()}),
            );
            ctx.conn.close();
            return;
        }
    };

    ctx.status.register_connection(&request_id, ctx.conn.clone());

    loop {
        let message = match ctx.conn.read_message() {
            Ok(Some(message)) => message,
            Ok(None) => break,
            Err(err) => {
                ctx.logger.error("websocket read ended", json!(err.to_string()));
                break;
            }
        };

        let (action_name, action_args) = match (ctx.service.decoder)(&message) {
            Ok(decoded) => decoded,
            Err(err) => {
                ctx.logger
                    .error("websocket decode failed", json!(err.to_string()));
                continue;
            }
        };

        let Some(action) = ctx.service.action(&action_name) else {
            debug!(action = %action_name, "no handler for websocket action");
            continue;
        };

        if !ctx.auth.check_action(
            action.auth_level,
            &ctx.request,
            &action_name,
            &action_args,
            session.as_ref(),
        ) {
            ctx.record(
                LogTag::WsReject,
                0.0,
                ctx.sanitized_in(&action_args),
                Value::Null,
                json!({"action": action_name}),
            );
            continue;
        }

        let started = Instant::now();
        let params = ctx.bind(&action.spec.descriptor, &action_args, &session);
        let func = action.spec.func.clone();
        let outcome = catch_unwind(AssertUnwindSafe(|| func(params)))
            .unwrap_or_else(|payload| Err(anyhow::anyhow!(panic_text(payload))));

        let mut reply = match outcome {
            Ok(reply) => reply,
            Err(err) => {
                ctx.record(
                    LogTag::WsActionError,
                    ms_since(started),
                    ctx.sanitized_in(&action_args),
                    Value::Null,
                    json!({"action": action_name, "error": err.to_string()}),
                );
                break;
            }
        };

        // An action that names no reply action answers under its own name.
        if reply.action.is_none() {
            reply.action = Some(action_name.clone());
        }

        let encoded = match (ctx.service.encoder)(&reply) {
            Ok(encoded) => encoded,
            Err(err) => {
                ctx.record(
                    LogTag::WsActionError,
                    ms_since(started),
                    ctx.sanitized_in(&action_args),
                    Value::Null,
                    json!({"action": action_name, "error": err.to_string()}),
                );
                break;
            }
        };

        let mut reply_value = Value::Null;
        if let Some(text) = encoded {
            reply_value = serde_json::from_str(&text).unwrap_or(Value::String(text.clone()));
            if let Err(err) = ctx.conn.write_text(&text) {
                ctx.record(
                    LogTag::WsActionError,
                    ms_since(started),
                    ctx.sanitized_in(&action_args),
                    Value::Null,
                    json!({"action": action_name, "error": err.to_string()}),
                );
                break;
            }
        }

        if ctx.config.log_websocket_action {
            ctx.record(
                LogTag::WsAction,
                ms_since(started),
                ctx.sanitized_in(&action_args),
                ctx.sanitized_out(&reply_value),
                json!({"action": action_name}),
            );
        }
    }

    if let Some(close) = &ctx.service.close {
        let params = ctx.bind(&close.descriptor, &ctx.args, &session);
        if let Err(err) = (close.func)(params) {
            ctx.logger
                .error("websocket close handler failed", json!(err.to_string()));
        }
    }
    ctx.status.deregister_connection(&request_id);
    ctx.conn.close();
    ctx.record(
        LogTag::WsClose,
        ms_since(opened_at),
        ctx.sanitized_in(&ctx.args),
        Value::Null,
        Value::Null,
    );
}

fn open_session(ctx: &SessionContext) -> Result<Option<SessionValue>, anyhow::Error> {
    let Some(open) = &ctx.service.open else {
        return Ok(None);
    };
    let params = ctx.bind(&open.descriptor, &ctx.args, &None);
    let func = open.func.clone();
    catch_unwind(AssertUnwindSafe(|| func(params)))
        .unwrap_or_else(|payload| Err(anyhow::anyhow!(panic_text(payload))))
}

fn ms_since(start: Instant) -> f64 {
    start.elapsed().as_secs_f64() * 1000.0
}

pub(crate) fn panic_text(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic".to_string()
    }
}
