//! Route table: registration and the per-request resolution hot path.
//!
//! Literal paths resolve through hash maps; templated paths (`{name}`
//! placeholders) compile to anchored regexes scanned in reverse registration
//! order, so the most recently registered pattern shadows earlier ones.
//! Resolution order: exact method+path, exact any-method path, exact
//! WebSocket path, templated HTTP routes, templated WebSocket services.

use crate::binder::HttpHandlerSpec;
use crate::websocket::{ActionRegister, WebSocketService};
use http::Method;
use regex::Regex;
use smallvec::SmallVec;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Inline capacity for captured path parameters; deeper templates spill to
/// the heap.
pub const MAX_INLINE_PARAMS: usize = 8;

/// Captured path parameters in template order.
pub type ParamVec = SmallVec<[(String, String); MAX_INLINE_PARAMS]>;

/// A compiled path, literal or templated.
#[derive(Debug, Clone)]
pub enum PathPattern {
    Literal(String),
    Pattern {
        regex: Regex,
        capture_names: Vec<String>,
    },
}

impl PathPattern {
    /// Compile a path template. `{name}` placeholders become lazy wildcard
    /// groups; everything else matches literally.
    pub fn compile(path: &str) -> Self {
        if !path.contains('{') {
            return PathPattern::Literal(path.to_string());
        }
        let mut pattern = String::with_capacity(path.len() + 8);
        pattern.push('^');
        let mut capture_names = Vec::new();
        let mut rest = path;
        while let Some(open) = rest.find('{') {
            pattern.push_str(&regex::escape(&rest[..open]));
            let tail = &rest[open + 1..];
            match tail.find('}') {
                Some(close) => {
                    capture_names.push(tail[..close].to_string());
                    pattern.push_str("(.+?)");
                    rest = &tail[close + 1..];
                }
                None => {
                    // Unbalanced brace, treat the remainder literally.
                    pattern.push_str(&regex::escape(&rest[open..]));
                    rest = "";
                }
            }
        }
        pattern.push_str(&regex::escape(rest));
        pattern.push('$');
        let regex = Regex::new(&pattern).expect("Failed to compile path regex");
        PathPattern::Pattern {
            regex,
            capture_names,
        }
    }

    /// Match `path`, returning the captured parameters on success. Captured
    /// text is percent-decoded, falling back to the raw text when decoding
    /// fails.
    pub fn matches(&self, path: &str) -> Option<ParamVec> {
        match self {
            PathPattern::Literal(lit) => (lit == path).then(ParamVec::new),
            PathPattern::Pattern {
                regex,
                capture_names,
            } => {
                let caps = regex.captures(path)?;
                let mut params = ParamVec::new();
                for (i, name) in capture_names.iter().enumerate() {
                    let raw = caps.get(i + 1).map(|m| m.as_str()).unwrap_or("");
                    let decoded = urlencoding::decode(raw)
                        .map(|c| c.into_owned())
                        .unwrap_or_else(|_| raw.to_string());
                    params.push((name.clone(), decoded));
                }
                Some(params)
            }
        }
    }
}

/// A registered HTTP route. Immutable after registration.
pub struct Route {
    /// `None` matches any method.
    pub method: Option<Method>,
    pub pattern: PathPattern,
    pub handler: HttpHandlerSpec,
    pub auth_level: u32,
    /// Recorded for operators; never consulted by matching.
    pub priority: i32,
}

/// What a path resolved to.
pub enum Resolution {
    Http {
        route: Arc<Route>,
        captures: ParamVec,
    },
    Ws {
        service: Arc<WebSocketService>,
        captures: ParamVec,
    },
    NotFound,
}

/// The route registry. Registration happens single-threaded before serving
/// starts; resolution is read-only afterwards.
#[derive(Default)]
pub struct RouteTable {
    exact: HashMap<(Method, String), Arc<Route>>,
    exact_any: HashMap<String, Arc<Route>>,
    ws_exact: HashMap<String, Arc<WebSocketService>>,
    patterns: Vec<Arc<Route>>,
    ws_patterns: Vec<(PathPattern, Arc<WebSocketService>)>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an HTTP route on `path`, optionally restricted to `method`.
    pub fn register_route(
        &mut self,
        method: Option<Method>,
        path: &str,
        auth_level: u32,
        priority: i32,
        handler: HttpHandlerSpec,
    ) {
        let pattern = PathPattern::compile(path);
        let route = Arc::new(Route {
            method: method.clone(),
            pattern,
            handler,
            auth_level,
            priority,
        });
        match &route.pattern {
            PathPattern::Literal(lit) => match method {
                Some(method) => {
                    self.exact.insert((method, lit.clone()), route);
                }
                None => {
                    self.exact_any.insert(lit.clone(), route);
                }
            },
            PathPattern::Pattern { .. } => self.patterns.push(route),
        }
        debug!(path, "route registered");
    }

    /// Register a WebSocket service on `path` and return the handle for
    /// adding actions to it.
    pub fn register_websocket_service(
        &mut self,
        path: &str,
        service: WebSocketService,
    ) -> ActionRegister {
        let service = Arc::new(service);
        match PathPattern::compile(path) {
            PathPattern::Literal(lit) => {
                self.ws_exact.insert(lit, service.clone());
            }
            pattern => self.ws_patterns.push((pattern, service.clone())),
        }
        debug!(path, "websocket service registered");
        ActionRegister::new(service)
    }

    pub fn route_count(&self) -> usize {
        self.exact.len() + self.exact_any.len() + self.patterns.len()
    }

    /// Log a one-line summary of the loaded table.
    pub fn log_summary(&self) {
        info!(
            routes = self.route_count(),
            websocket_services = self.ws_exact.len() + self.ws_patterns.len(),
            "routing table loaded"
        );
    }

    /// Resolve `method` + `path` to a handler.
    pub fn resolve(&self, method: &Method, path: &str) -> Resolution {
        if let Some(route) = self.exact.get(&(method.clone(), path.to_string())) {
            return Resolution::Http {
                route: route.clone(),
                captures: ParamVec::new(),
            };
        }
        if let Some(route) = self.exact_any.get(path) {
            return Resolution::Http {
                route: route.clone(),
                captures: ParamVec::new(),
            };
        }
        if let Some(service) = self.ws_exact.get(path) {
            return Resolution::Ws {
                service: service.clone(),
                captures: ParamVec::new(),
            };
        }
        // Newest registration wins among templated routes.
        for route in self.patterns.iter().rev() {
            if let Some(m) = &route.method {
                if m != method {
                    continue;
                }
            }
            if let Some(captures) = route.pattern.matches(path) {
                return Resolution::Http {
                    route: route.clone(),
                    captures,
                };
            }
        }
        for (pattern, service) in self.ws_patterns.iter().rev() {
            if let Some(captures) = pattern.matches(path) {
                return Resolution::Ws {
                    service: service.clone(),
                    captures,
                };
            }
        }
        Resolution::NotFound
    }
}
