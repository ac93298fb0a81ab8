//! Auth gate: pluggable checkers consulted before any gated handler runs.
//!
//! Checkers are swapped atomically at runtime; a request in flight during a
//! swap may observe either checker, and the last writer wins. A route with
//! `auth_level == 0` is never gated.

use crate::config::ServerConfig;
use crate::server::request::{ArgMap, HttpRequest};
use crate::websocket::SessionValue;
use arc_swap::ArcSwapOption;
use std::sync::Arc;
use tracing::debug;

/// Decides whether a request clears the auth level of an HTTP route.
pub trait AuthChecker: Send + Sync {
    fn check(&self, required: u32, req: &HttpRequest, args: &ArgMap) -> bool;
}

/// Decides whether a WebSocket action dispatch clears its auth level. Runs
/// against the live session state, so an action can be gated on what the
/// open handler established.
pub trait ActionAuthChecker: Send + Sync {
    fn check(
        &self,
        required: u32,
        req: &HttpRequest,
        action: &str,
        args: &ArgMap,
        session: Option<&SessionValue>,
    ) -> bool;
}

/// Default HTTP checker: a static token table.
///
/// Reads the configured token header, looks the token up in
/// `ServerConfig::access_tokens` and approves when the mapped level reaches
/// the required one.
pub struct TokenAuthChecker {
    config: Arc<ServerConfig>,
}

impl TokenAuthChecker {
    pub fn new(config: Arc<ServerConfig>) -> Self {
        Self { config }
    }
}

impl AuthChecker for TokenAuthChecker {
    fn check(&self, required: u32, req: &HttpRequest, _args: &ArgMap) -> bool {
        let token = req.header(&self.config.auth_token_header).unwrap_or("");
        match self.config.access_tokens.get(token) {
            Some(level) => *level >= required,
            None => false,
        }
    }
}

/// Holds the current checker strategies. Trait objects are stored boxed, so
/// the swap slot has a sized payload.
pub struct AuthGate {
    config: Arc<ServerConfig>,
    checker: ArcSwapOption<Box<dyn AuthChecker>>,
    action_checker: ArcSwapOption<Box<dyn ActionAuthChecker>>,
}

impl AuthGate {
    pub fn new(config: Arc<ServerConfig>) -> Self {
        Self {
            config,
            checker: ArcSwapOption::empty(),
            action_checker: ArcSwapOption::empty(),
        }
    }

    /// Replace the HTTP checker. Takes effect for requests gated after the
    /// swap; concurrent requests may still see the previous one.
    pub fn set_checker(&self, checker: Box<dyn AuthChecker>) {
        self.checker.store(Some(Arc::new(checker)));
    }

    /// Replace the WebSocket action checker.
    pub fn set_action_checker(&self, checker: Box<dyn ActionAuthChecker>) {
        self.action_checker.store(Some(Arc::new(checker)));
    }

    /// Gate an HTTP request. Installs the default token checker the first
    /// time a gated request arrives with no checker configured.
    pub fn check_http(&self, required: u32, req: &HttpRequest, args: &ArgMap) -> bool {
        if required == 0 {
            return true;
        }
        let checker = match self.checker.load_full() {
            Some(checker) => checker,
            None => {
                let default: Arc<Box<dyn AuthChecker>> =
                    Arc::new(Box::new(TokenAuthChecker::new(self.config.clone())));
                debug!("no auth checker installed, falling back to token table");
                self.checker.store(Some(default.clone()));
                default
            }
        };
        checker.check(required, req, args)
    }

    /// Gate a WebSocket action dispatch. With no action checker installed,
    /// gated actions are allowed.
    pub fn check_action(
        &self,
        required: u32,
        req: &HttpRequest,
        action: &str,
        args: &ArgMap,
        session: Option<&SessionValue>,
    ) -> bool {
        if required == 0 {
            return true;
        }
        match self.action_checker.load_full() {
            Some(checker) => checker.check(required, req, action, args, session),
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::Method;

    fn gate_with_token(level: u32) -> (AuthGate, HttpRequest) {
        let mut config = ServerConfig::default();
        config.access_tokens.insert("tok-1".to_string(), level);
        let gate = AuthGate::new(Arc::new(config));
        let mut req = HttpRequest::new(Method::GET, "/admin");
        req.set_header("access-token", "tok-1");
        (gate, req)
    }

    #[test]
    fn level_zero_is_never_gated() {
        let gate = AuthGate::new(Arc::new(ServerConfig::default()));
        let req = HttpRequest::new(Method::GET, "/");
        assert!(gate.check_http(0, &req, &ArgMap::new()));
    }

    #[test]
    fn token_table_compares_levels() {
        let (gate, req) = gate_with_token(2);
        assert!(gate.check_http(1, &req, &ArgMap::new()));
        assert!(gate.check_http(2, &req, &ArgMap::new()));
        assert!(!gate.check_http(3, &req, &ArgMap::new()));
    }

    #[test]
    fn unknown_token_is_rejected() {
        let (gate, _) = gate_with_token(2);
        let mut req = HttpRequest::new(Method::GET, "/admin");
        req.set_header("access-token", "bogus");
        assert!(!gate.check_http(1, &req, &ArgMap::new()));
    }

    #[test]
    fn swapped_checker_wins() {
        struct AllowAll;
        impl AuthChecker for AllowAll {
            fn check(&self, _: u32, _: &HttpRequest, _: &ArgMap) -> bool {
                true
            }
        }
        let (gate, _) = gate_with_token(0);
        let req = HttpRequest::new(Method::GET, "/admin");
        assert!(!gate.check_http(5, &req, &ArgMap::new()));
        gate.set_checker(Box::new(AllowAll));
        assert!(gate.check_http(5, &req, &ArgMap::new()));
    }

    #[test]
    fn actions_without_checker_are_allowed() {
        let gate = AuthGate::new(Arc::new(ServerConfig::default()));
        let req = HttpRequest::new(Method::GET, "/ws");
        assert!(gate.check_action(3, &req, "ping", &ArgMap::new(), None));
    }
}
