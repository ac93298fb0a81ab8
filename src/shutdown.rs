//! Graceful-shutdown bookkeeping.
//!
//! Tracks how many HTTP requests are in flight (RAII guard) and which
//! WebSocket connections are open (keyed by request id). Shutdown stops
//! accepting, force-closes every open connection and then waits a bounded
//! time for the counters to drain.

use crate::websocket::WsConnection;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const DRAIN_ATTEMPTS: u32 = 25;
const DRAIN_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Default)]
pub struct ServerStatus {
    in_flight: AtomicI64,
    stopping: AtomicBool,
    connections: DashMap<String, Arc<dyn WsConnection>>,
}

impl ServerStatus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a request as in flight until the returned guard drops.
    pub fn begin_request(self: &Arc<Self>) -> RequestGuard {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        RequestGuard {
            status: self.clone(),
        }
    }

    pub fn in_flight(&self) -> i64 {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    /// Track an open WebSocket connection for the lifetime of its loop.
    pub fn register_connection(&self, request_id: &str, conn: Arc<dyn WsConnection>) {
        self.connections.insert(request_id.to_string(), conn);
    }

    pub fn deregister_connection(&self, request_id: &str) {
        self.connections.remove(request_id);
    }

    pub fn open_connections(&self) -> usize {
        self.connections.len()
    }

    /// Stop the server: mark stopping, force-close open WebSocket
    /// connections, then poll until requests drain or the bounded wait
    /// expires. Call from outside the serving coroutines.
    pub fn shutdown(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        let open = self.connections.len();
        if open > 0 {
            info!(connections = open, "closing open websocket connections");
            for entry in self.connections.iter() {
                entry.value().close();
            }
        }
        for _ in 0..DRAIN_ATTEMPTS {
            if self.in_flight() <= 0 && self.connections.is_empty() {
                info!("drained, shutting down");
                return;
            }
            std::thread::sleep(DRAIN_INTERVAL);
        }
        warn!(
            in_flight = self.in_flight(),
            connections = self.connections.len(),
            "shutdown wait expired with work outstanding"
        );
    }
}

/// Decrements the in-flight counter on drop, including the panic path.
pub struct RequestGuard {
    status: Arc<ServerStatus>,
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        self.status.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::websocket::WsError;
    use serde_json::Value;
    use std::sync::atomic::AtomicBool;

    #[test]
    fn guard_balances_the_counter() {
        let status = Arc::new(ServerStatus::new());
        {
            let _g1 = status.begin_request();
            let _g2 = status.begin_request();
            assert_eq!(status.in_flight(), 2);
        }
        assert_eq!(status.in_flight(), 0);
    }

    struct FakeConn {
        closed: AtomicBool,
    }

    impl WsConnection for FakeConn {
        fn read_message(&self) -> Result<Option<Value>, WsError> {
            Ok(None)
        }
        fn write_text(&self, _text: &str) -> Result<(), WsError> {
            Ok(())
        }
        fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn shutdown_force_closes_connections() {
        let status = Arc::new(ServerStatus::new());
        let conn = Arc::new(FakeConn {
            closed: AtomicBool::new(false),
        });
        status.register_connection("req-1", conn.clone());
        // A real connection loop deregisters itself once the forced close
        // lands; simulate that so the drain wait ends quickly.
        let status2 = status.clone();
        let conn2 = conn.clone();
        let waiter = std::thread::spawn(move || {
            while !conn2.closed.load(Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(5));
            }
            status2.deregister_connection("req-1");
        });
        status.shutdown();
        waiter.join().expect("waiter thread");
        assert!(status.is_stopping());
        assert!(conn.closed.load(Ordering::SeqCst));
    }
}
