use microserv::binder::{HandlerDescriptor, HandlerResult, Injector, ParamRole};
use microserv::config::ServerConfig;
use microserv::dispatcher::Dispatcher;
use microserv::filters::PreFilter;
use microserv::logging::{LogTag, MemorySink};
use microserv::security::ActionAuthChecker;
use microserv::server::request::{ArgMap, HttpRequest};
use microserv::server::response::{BufferHandle, BufferWriter, Response};
use microserv::websocket::{
    ActionReply, ActionRegister, SessionValue, UpgradeConfig, WebSocketService, WsConnection,
    WsError, WsUpgrader,
};
use http::Method;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Scripted connection: replays queued inbound messages, captures writes.
struct ScriptedConn {
    inbound: Mutex<VecDeque<Value>>,
    sent: Mutex<Vec<Value>>,
    closed: AtomicBool,
}

impl ScriptedConn {
    fn new(messages: Vec<Value>) -> Arc<Self> {
        Arc::new(Self {
            inbound: Mutex::new(messages.into()),
            sent: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        })
    }

    fn sent(&self) -> Vec<Value> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl WsConnection for ScriptedConn {
    fn read_message(&self) -> Result<Option<Value>, WsError> {
        Ok(self.inbound.lock().ok().and_then(|mut q| q.pop_front()))
    }

    fn write_text(&self, text: &str) -> Result<(), WsError> {
        let value = serde_json::from_str(text).map_err(|e| WsError::Write(e.to_string()))?;
        if let Ok(mut sent) = self.sent.lock() {
            sent.push(value);
        }
        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

struct MockUpgrader {
    conn: Arc<ScriptedConn>,
    upgraded: Arc<AtomicBool>,
}

impl WsUpgrader for MockUpgrader {
    fn upgrade(self: Box<Self>, _config: &UpgradeConfig) -> Result<Arc<dyn WsConnection>, WsError> {
        self.upgraded.store(true, Ordering::SeqCst);
        Ok(self.conn)
    }
}

struct Harness {
    dispatcher: Dispatcher,
    sink: Arc<MemorySink>,
    register: ActionRegister,
}

fn harness(config: ServerConfig, service: WebSocketService) -> Harness {
    let sink = Arc::new(MemorySink::new());
    let mut dispatcher = Dispatcher::new(config, Injector::new());
    dispatcher.set_log_sink(sink.clone());
    let register = dispatcher.routes_mut().register_websocket_service("/ws", service);
    Harness {
        dispatcher,
        sink,
        register,
    }
}

fn connect(
    dispatcher: Dispatcher,
    conn: Arc<ScriptedConn>,
) -> (BufferHandle, Arc<AtomicBool>) {
    let upgraded = Arc::new(AtomicBool::new(false));
    let upgrader = Box::new(MockUpgrader {
        conn,
        upgraded: upgraded.clone(),
    });
    let (writer, handle) = BufferWriter::pair();
    let mut req = HttpRequest::new(Method::GET, "/ws");
    req.remote_addr = "10.0.0.1:50000".to_string();
    Arc::new(dispatcher).dispatch(req, writer, Some(upgrader));
    (handle, upgraded)
}

#[test]
fn action_round_trip_with_records() {
    let h = harness(
        ServerConfig::default(),
        WebSocketService::new(0, 0, UpgradeConfig::default()),
    );
    h.register.register_action(
        "ping",
        0,
        0,
        HandlerDescriptor::default(),
        |_params| {
            Ok(ActionReply {
                action: Some("pong".to_string()),
                data: Some(json!({"ok": true})),
            })
        },
    );

    let conn = ScriptedConn::new(vec![json!({"action": "ping"})]);
    let (_handle, upgraded) = connect(h.dispatcher, conn.clone());

    assert!(upgraded.load(Ordering::SeqCst));
    assert_eq!(conn.sent(), vec![json!({"ok": true, "action": "pong"})]);
    assert!(conn.is_closed());

    assert_eq!(h.sink.tagged(LogTag::WsOpen).len(), 1);
    let actions = h.sink.tagged(LogTag::WsAction);
    assert_eq!(actions.len(), 1);
    assert_eq!(
        actions[0].extra.get("action").and_then(Value::as_str),
        Some("ping")
    );
    assert_eq!(actions[0].result, json!({"ok": true, "action": "pong"}));
    assert_eq!(h.sink.tagged(LogTag::WsClose).len(), 1);
    assert!(h.sink.tagged(LogTag::Access).is_empty());
}

#[test]
fn reply_action_defaults_to_inbound_name() {
    let h = harness(
        ServerConfig::default(),
        WebSocketService::new(0, 0, UpgradeConfig::default()),
    );
    h.register.register_action(
        "echo",
        0,
        0,
        HandlerDescriptor::default(),
        |_params| {
            Ok(ActionReply {
                action: None,
                data: Some(json!({"n": 1})),
            })
        },
    );

    let conn = ScriptedConn::new(vec![json!({"action": "echo"})]);
    let (_handle, _) = connect(h.dispatcher, conn.clone());
    assert_eq!(conn.sent(), vec![json!({"n": 1, "action": "echo"})]);
}

#[test]
fn action_logging_can_be_disabled() {
    let config = ServerConfig {
        log_websocket_action: false,
        ..ServerConfig::default()
    };
    let h = harness(config, WebSocketService::new(0, 0, UpgradeConfig::default()));
    h.register
        .register_action("ping", 0, 0, HandlerDescriptor::default(), |_params| {
            Ok(ActionReply {
                action: None,
                data: Some(json!({"ok": true})),
            })
        });

    let conn = ScriptedConn::new(vec![json!({"action": "ping"})]);
    let (_handle, _) = connect(h.dispatcher, conn.clone());

    assert_eq!(conn.sent().len(), 1);
    assert!(h.sink.tagged(LogTag::WsAction).is_empty());
    assert_eq!(h.sink.tagged(LogTag::WsClose).len(), 1);
}

struct Gatekeeper;
impl PreFilter for Gatekeeper {
    fn before(
        &self,
        _args: &mut ArgMap,
        _req: &HttpRequest,
        resp: &mut Response,
    ) -> Option<HandlerResult> {
        resp.write_status(409);
        Some(HandlerResult::Text("busy".to_string()))
    }
}

#[test]
fn answering_pre_filter_suppresses_the_upgrade() {
    let mut h = harness(
        ServerConfig::default(),
        WebSocketService::new(0, 0, UpgradeConfig::default()),
    );
    h.dispatcher.add_pre_filter(Arc::new(Gatekeeper));

    let conn = ScriptedConn::new(vec![json!({"action": "ping"})]);
    let (handle, upgraded) = connect(h.dispatcher, conn.clone());

    assert!(!upgraded.load(Ordering::SeqCst));
    assert_eq!(handle.status(), Some(409));
    assert_eq!(handle.body_string(), "busy");
    assert!(h.sink.tagged(LogTag::WsOpen).is_empty());
    assert_eq!(h.sink.tagged(LogTag::Access).len(), 1);
}

#[test]
fn failing_action_ends_the_loop_with_an_error_record() {
    let h = harness(
        ServerConfig::default(),
        WebSocketService::new(0, 0, UpgradeConfig::default()),
    );
    h.register
        .register_action("bad", 0, 0, HandlerDescriptor::default(), |_params| {
            Err(anyhow::anyhow!("backend gone"))
        });
    h.register
        .register_action("ping", 0, 0, HandlerDescriptor::default(), |_params| {
            Ok(ActionReply {
                action: None,
                data: Some(json!({"ok": true})),
            })
        });

    // The second message must never be dispatched.
    let conn = ScriptedConn::new(vec![json!({"action": "bad"}), json!({"action": "ping"})]);
    let (_handle, _) = connect(h.dispatcher, conn.clone());

    assert!(conn.sent().is_empty());
    assert!(conn.is_closed());
    let errors = h.sink.tagged(LogTag::WsActionError);
    assert_eq!(errors.len(), 1);
    assert_eq!(
        errors[0].extra.get("error").and_then(Value::as_str),
        Some("backend gone")
    );
    assert!(h.sink.tagged(LogTag::WsAction).is_empty());
    assert_eq!(h.sink.tagged(LogTag::WsClose).len(), 1);
}

#[test]
fn panicking_action_is_recorded_like_an_error() {
    let h = harness(
        ServerConfig::default(),
        WebSocketService::new(0, 0, UpgradeConfig::default()),
    );
    h.register
        .register_action("boom", 0, 0, HandlerDescriptor::default(), |_params| {
            panic!("ws kaboom");
        });

    let conn = ScriptedConn::new(vec![json!({"action": "boom"})]);
    let (_handle, _) = connect(h.dispatcher, conn.clone());

    let errors = h.sink.tagged(LogTag::WsActionError);
    assert_eq!(errors.len(), 1);
    assert_eq!(
        errors[0].extra.get("error").and_then(Value::as_str),
        Some("ws kaboom")
    );
}

struct DenyAll;
impl ActionAuthChecker for DenyAll {
    fn check(
        &self,
        _required: u32,
        _req: &HttpRequest,
        _action: &str,
        _args: &ArgMap,
        _session: Option<&SessionValue>,
    ) -> bool {
        false
    }
}

#[test]
fn rejected_action_continues_the_loop() {
    let h = harness(
        ServerConfig::default(),
        WebSocketService::new(0, 0, UpgradeConfig::default()),
    );
    h.dispatcher.auth().set_action_checker(Box::new(DenyAll));
    h.register
        .register_action("secure", 3, 0, HandlerDescriptor::default(), |_params| {
            Ok(ActionReply {
                action: None,
                data: Some(json!({"secret": 1})),
            })
        });
    h.register
        .register_action("ping", 0, 0, HandlerDescriptor::default(), |_params| {
            Ok(ActionReply {
                action: None,
                data: Some(json!({"ok": true})),
            })
        });

    let conn = ScriptedConn::new(vec![json!({"action": "secure"}), json!({"action": "ping"})]);
    let (_handle, _) = connect(h.dispatcher, conn.clone());

    let rejects = h.sink.tagged(LogTag::WsReject);
    assert_eq!(rejects.len(), 1);
    assert_eq!(
        rejects[0].extra.get("action").and_then(Value::as_str),
        Some("secure")
    );
    // Level-zero actions bypass the checker; the loop keeps going.
    assert_eq!(conn.sent(), vec![json!({"ok": true, "action": "ping"})]);
    assert_eq!(h.sink.tagged(LogTag::WsClose).len(), 1);
}

#[test]
fn unknown_action_without_fallback_is_skipped() {
    let h = harness(
        ServerConfig::default(),
        WebSocketService::new(0, 0, UpgradeConfig::default()),
    );
    h.register
        .register_action("known", 0, 0, HandlerDescriptor::default(), |_params| {
            Ok(ActionReply {
                action: None,
                data: Some(json!({"ok": true})),
            })
        });

    let conn = ScriptedConn::new(vec![json!({"action": "mystery"}), json!({"action": "known"})]);
    let (_handle, _) = connect(h.dispatcher, conn.clone());

    assert_eq!(conn.sent(), vec![json!({"ok": true, "action": "known"})]);
    assert!(h.sink.tagged(LogTag::WsActionError).is_empty());
}

#[test]
fn open_handler_state_reaches_actions() {
    let service = WebSocketService::new(0, 0, UpgradeConfig::default()).with_open(
        HandlerDescriptor::default(),
        |_params| {
            let state: SessionValue = Arc::new("greeted".to_string());
            Ok(Some(state))
        },
    );
    let h = harness(ServerConfig::default(), service);
    h.register.register_action(
        "whoami",
        0,
        0,
        HandlerDescriptor::new(vec![ParamRole::Session]),
        |params| {
            let state = params
                .session::<String>()
                .map(|s| s.as_str().to_string())
                .unwrap_or_default();
            Ok(ActionReply {
                action: None,
                data: Some(json!({"state": state})),
            })
        },
    );

    let conn = ScriptedConn::new(vec![json!({"action": "whoami"})]);
    let (_handle, _) = connect(h.dispatcher, conn.clone());
    assert_eq!(
        conn.sent(),
        vec![json!({"state": "greeted", "action": "whoami"})]
    );
}

#[test]
fn failing_open_handler_closes_without_a_session() {
    let service = WebSocketService::new(0, 0, UpgradeConfig::default()).with_open(
        HandlerDescriptor::default(),
        |_params| Err(anyhow::anyhow!("open denied")),
    );
    let h = harness(ServerConfig::default(), service);
    h.register
        .register_action("ping", 0, 0, HandlerDescriptor::default(), |_params| {
            Ok(ActionReply::default())
        });

    let conn = ScriptedConn::new(vec![json!({"action": "ping"})]);
    let (_handle, upgraded) = connect(h.dispatcher, conn.clone());

    assert!(upgraded.load(Ordering::SeqCst));
    assert!(conn.is_closed());
    assert!(conn.sent().is_empty());
    assert_eq!(h.sink.tagged(LogTag::WsOpen).len(), 1);
    let panics = h.sink.tagged(LogTag::Panic);
    assert_eq!(panics.len(), 1);
    assert_eq!(
        panics[0].extra.get("error").and_then(Value::as_str),
        Some("open denied")
    );
    assert!(h.sink.tagged(LogTag::WsClose).is_empty());
}

#[test]
fn no_log_gets_silences_session_records() {
    let config = ServerConfig {
        no_log_gets: true,
        ..ServerConfig::default()
    };
    let h = harness(config, WebSocketService::new(0, 0, UpgradeConfig::default()));
    h.register
        .register_action("ping", 0, 0, HandlerDescriptor::default(), |_params| {
            Ok(ActionReply {
                action: None,
                data: Some(json!({"ok": true})),
            })
        });

    // Upgrades ride on GET requests, so the session still runs but stays
    // out of the log.
    let conn = ScriptedConn::new(vec![json!({"action": "ping"})]);
    let (_handle, upgraded) = connect(h.dispatcher, conn.clone());

    assert!(upgraded.load(Ordering::SeqCst));
    assert_eq!(conn.sent(), vec![json!({"ok": true, "action": "ping"})]);
    assert!(h.sink.entries().is_empty());
}

#[test]
fn close_handler_runs_when_the_peer_disconnects() {
    let closed = Arc::new(AtomicBool::new(false));
    let seen = closed.clone();
    let service = WebSocketService::new(0, 0, UpgradeConfig::default()).with_close(
        HandlerDescriptor::default(),
        move |_params| {
            seen.store(true, Ordering::SeqCst);
            Ok(())
        },
    );
    let h = harness(ServerConfig::default(), service);

    let conn = ScriptedConn::new(vec![]);
    let (_handle, _) = connect(h.dispatcher, conn.clone());

    assert!(closed.load(Ordering::SeqCst));
    assert_eq!(h.sink.tagged(LogTag::WsClose).len(), 1);
}

#[test]
fn missing_upgrader_fails_the_request() {
    let h = harness(
        ServerConfig::default(),
        WebSocketService::new(0, 0, UpgradeConfig::default()),
    );

    let (writer, handle) = BufferWriter::pair();
    let mut req = HttpRequest::new(Method::GET, "/ws");
    req.remote_addr = "10.0.0.1:50000".to_string();
    Arc::new(h.dispatcher).dispatch(req, writer, None);

    assert_eq!(handle.status(), Some(500));
    let opens = h.sink.tagged(LogTag::WsOpen);
    assert_eq!(opens.len(), 1);
    assert!(opens[0].extra.get("error").is_some());
}
