//! # microserv
//!
//! **microserv** is the request-dispatch core of a coroutine-powered
//! HTTP/WebSocket microservice server, built on the `may` runtime.
//!
//! ## Overview
//!
//! microserv resolves inbound requests to registered handlers, assembles
//! handler arguments from every wire source (path captures, query string,
//! form and JSON bodies), enforces a level-based authorization gate, runs
//! pre/post filter chains, drives a stateful WebSocket action protocol, and
//! emits sanitized structured access logs for every request and WebSocket
//! event.
//!
//! ## Architecture
//!
//! The library is organized into these modules:
//!
//! - **[`router`]** - Route registry and matcher (exact maps plus templated
//!   patterns scanned in reverse registration order)
//! - **[`binder`]** - Argument-map assembly, descriptor-based parameter
//!   binding, lenient typed conversion and dependency injection
//! - **[`dispatcher`]** - The per-request pipeline and its error boundary
//! - **[`websocket`]** - WebSocket services, named actions and the
//!   per-connection session loop
//! - **[`security`]** - Swappable auth checker strategies with a token-table
//!   default
//! - **[`filters`]** - Pre/post filter traits around handler execution
//! - **[`sanitize`]** - Recursive log redaction, masking and truncation
//! - **[`logging`]** - Access-log records and sinks
//! - **[`identity`]** - Cross-hop identity header propagation
//! - **[`shutdown`]** - In-flight tracking and graceful drain
//! - **[`server`]** - Bundled TCP transport, request/response types and the
//!   WebSocket upgrade
//! - **[`config`]** - Process-wide settings with environment overrides
//!
//! ### Request Handling Flow
//!
//! ```mermaid
//! sequenceDiagram
//!     participant Client
//!     participant Server as HttpServer<br/>(may coroutine)
//!     participant Dispatcher
//!     participant Router as RouteTable
//!     participant Binder
//!     participant Auth as AuthGate
//!     participant Handler
//!     participant WS as WebSocket Session
//!
//!     Client->>Server: HTTP Request
//!     Server->>Dispatcher: dispatch(request)
//!     Dispatcher->>Dispatcher: Identity normalization<br/>(request id, real ip, session id)
//!     Dispatcher->>Dispatcher: Collaborators<br/>(rewrite, proxy, static)
//!     Dispatcher->>Router: resolve(method, path)
//!
//!     alt No route
//!         Dispatcher-->>Client: 404 + FAIL record
//!     end
//!
//!     Router-->>Dispatcher: route + captures
//!     Dispatcher->>Binder: assemble_args<br/>(captures, query, form, JSON)
//!     Dispatcher->>Dispatcher: Pre-filters
//!     Dispatcher->>Auth: check(auth_level)
//!
//!     alt Rejected
//!         Dispatcher-->>Client: 403 + REJECT record
//!     end
//!
//!     alt HTTP route
//!         Dispatcher->>Binder: bind(descriptor)
//!         Binder-->>Handler: BoundParams
//!         Handler-->>Dispatcher: HandlerResult
//!         Dispatcher->>Dispatcher: Post-filters, encode, gzip
//!         Dispatcher-->>Client: Response + ACCESS record
//!     else WebSocket route
//!         Dispatcher->>WS: upgrade + run_session
//!         WS->>WS: open handler, action loop
//!         WS-->>Client: action replies + WS* records
//!     end
//! ```
//!
//! ## Quick Start
//!
//! ```no_run
//! use microserv::binder::{HandlerDescriptor, HandlerResult, Injector, ParamRole};
//! use microserv::config::ServerConfig;
//! use microserv::dispatcher::Dispatcher;
//! use microserv::server::HttpServer;
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! let mut dispatcher = Dispatcher::new(ServerConfig::from_env(), Injector::new());
//! dispatcher.routes_mut().register_route(
//!     Some(http::Method::GET),
//!     "/users/{id}",
//!     0,
//!     0,
//!     microserv::binder::HttpHandlerSpec::new(
//!         HandlerDescriptor::new(vec![ParamRole::Input]),
//!         |params| {
//!             let args = params.input_value().cloned().unwrap_or_default();
//!             Ok(HandlerResult::Json(json!({ "user": args["id"] })))
//!         },
//!     ),
//! );
//! let handle = HttpServer(Arc::new(dispatcher)).start("0.0.0.0:8080").unwrap();
//! handle.join().unwrap();
//! ```
//!
//! ## Runtime Considerations
//!
//! microserv uses the `may` coroutine runtime, not tokio or async-std:
//!
//! - Each connection is served by one coroutine; HTTP requests run
//!   synchronously start-to-finish inside it
//! - A WebSocket connection keeps its coroutine for the lifetime of the
//!   session loop; reads and dispatches are strictly sequential
//! - Blocking operations should use `may`'s blocking facilities

pub mod binder;
pub mod config;
pub mod dispatcher;
pub mod filters;
pub mod identity;
pub mod ids;
pub mod logging;
pub mod router;
pub mod sanitize;
pub mod security;
pub mod server;
pub mod shutdown;
pub mod websocket;

pub use binder::{BoundParams, HandlerDescriptor, HandlerResult, HttpHandlerSpec, ParamRole};
pub use config::ServerConfig;
pub use dispatcher::{DispatchError, Dispatcher};
pub use ids::RequestId;
pub use logging::{init_tracing, AccessLogEntry, LogFormat, LogSink, LogTag};
pub use websocket::{ActionReply, ActionRegister, UpgradeConfig, WebSocketService};
