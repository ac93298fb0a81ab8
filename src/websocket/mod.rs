//! WebSocket session engine: service/action registration, the per-connection
//! dispatch loop and the transport seams it runs over.

pub mod core;

pub use core::{
    run_session, ActionRegister, ActionReply, SessionContext, SessionValue, UpgradeConfig,
    WebSocketService, WsAction, WsConnection, WsError, WsHandlerSpec, WsUpgrader,
};
