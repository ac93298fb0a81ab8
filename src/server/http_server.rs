//! Listener bootstrap: binds a TCP address and serves each connection on its
//! own `may` coroutine.

use crate::dispatcher::Dispatcher;
use crate::server::conn;
use crate::shutdown::ServerStatus;
use may::coroutine::JoinHandle;
use may::net::TcpListener;
use std::io;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{info, warn};

/// Wraps a configured dispatcher so it can be bound to an address.
pub struct HttpServer(pub Arc<Dispatcher>);

/// Handle to a running server.
pub struct ServerHandle {
    addr: SocketAddr,
    handle: JoinHandle<()>,
    status: Arc<ServerStatus>,
}

impl ServerHandle {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Poll the bound address until it accepts connections. Useful in tests
    /// to avoid racing the accept loop.
    pub fn wait_ready(&self) -> io::Result<()> {
        for _ in 0..50 {
            if TcpStream::connect(self.addr).is_ok() {
                return Ok(());
            }
            thread::sleep(Duration::from_millis(5));
        }
        Err(io::Error::new(io::ErrorKind::TimedOut, "server not ready"))
    }

    /// Stop gracefully: drain in-flight work, force-close WebSocket
    /// connections, then cancel the accept loop.
    pub fn stop(self) {
        self.status.shutdown();
        // SAFETY: cancelling the accept coroutine is the intended shutdown
        // path; the handle is valid and the drain above has completed.
        unsafe {
            self.handle.coroutine().cancel();
        }
        let _ = self.handle.join();
    }

    /// Block until the accept loop exits.
    pub fn join(self) -> std::thread::Result<()> {
        self.handle.join()
    }
}

impl HttpServer {
    /// Bind `addr` and start serving.
    pub fn start<A: ToSocketAddrs>(self, addr: A) -> io::Result<ServerHandle> {
        let addr = addr
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "invalid address"))?;
        let listener = TcpListener::bind(addr)?;
        let local = listener.local_addr()?;
        let dispatcher = self.0;
        let status = dispatcher.status().clone();
        info!(addr = %local, "listening");

        let accept_status = status.clone();
        let handle = may::go!(move || {
            for stream in listener.incoming() {
                if accept_status.is_stopping() {
                    break;
                }
                match stream {
                    Ok(stream) => {
                        let dispatcher = dispatcher.clone();
                        may::go!(move || conn::handle_connection(dispatcher, stream));
                    }
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                    }
                }
            }
        });

        Ok(ServerHandle {
            addr: local,
            handle,
            status,
        })
    }
}
