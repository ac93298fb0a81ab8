//! Bundled transport: request/response types shared with the dispatcher,
//! plus a `may`-coroutine TCP server that parses HTTP/1.1, hands requests to
//! the dispatcher and performs WebSocket upgrades on the raw stream.

pub mod conn;
pub mod http_server;
pub mod request;
pub mod response;

pub use http_server::{HttpServer, ServerHandle};
pub use request::{ArgMap, HttpRequest};
pub use response::{BufferHandle, BufferWriter, Response, ResponseWriter};
