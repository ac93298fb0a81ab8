//! Dependency injection registry.
//!
//! Global injections are registered once at startup and resolved by type.
//! Scoped injections are installed for a single request (keyed by request id)
//! and shadow the global entry of the same type; they are released
//! unconditionally when the request's [`ScopeGuard`] drops, including on the
//! panic path.

use crate::logging::RequestLogger;
use dashmap::DashMap;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

/// A value that can be handed to handlers through the registry.
pub trait Injectable: Send + Sync {
    /// Self as `Arc<dyn Any>` so callers can downcast to the concrete type.
    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;

    /// Called once per binding with the request's logger. Override to carry
    /// the logger into the injected value.
    fn set_logger(&self, _logger: &RequestLogger) {}
}

/// Type-keyed injection registry with per-request scoped entries.
#[derive(Default)]
pub struct Injector {
    global: HashMap<TypeId, Arc<dyn Injectable>>,
    scoped: DashMap<String, HashMap<TypeId, Arc<dyn Injectable>>>,
}

impl Injector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a process-wide injection. Registration happens before the
    /// server starts serving, so this takes `&mut self`.
    pub fn register<T: Injectable + 'static>(&mut self, value: Arc<T>) {
        self.global.insert(TypeId::of::<T>(), value);
    }

    /// Install an injection visible only to the request identified by
    /// `request_id`, shadowing any global entry of the same type.
    pub fn register_scoped<T: Injectable + 'static>(&self, request_id: &str, value: Arc<T>) {
        self.scoped
            .entry(request_id.to_string())
            .or_default()
            .insert(TypeId::of::<T>(), value);
    }

    /// Resolve by type id: the request's scoped entry first, then the global.
    pub fn get(&self, type_id: TypeId, request_id: &str) -> Option<Arc<dyn Injectable>> {
        if let Some(scoped) = self.scoped.get(request_id) {
            if let Some(found) = scoped.get(&type_id) {
                return Some(found.clone());
            }
        }
        self.global.get(&type_id).cloned()
    }

    /// Typed resolve.
    pub fn resolve<T: Injectable + 'static>(&self, request_id: &str) -> Option<Arc<T>> {
        self.get(TypeId::of::<T>(), request_id)
            .and_then(|obj| obj.as_any_arc().downcast::<T>().ok())
    }

    /// Guard whose drop releases every scoped injection of `request_id`.
    pub fn scope_guard(self: &Arc<Self>, request_id: &str) -> ScopeGuard {
        ScopeGuard {
            injector: self.clone(),
            request_id: request_id.to_string(),
        }
    }

    fn release_scope(&self, request_id: &str) {
        self.scoped.remove(request_id);
    }
}

/// Releases a request's scoped injections on drop.
pub struct ScopeGuard {
    injector: Arc<Injector>,
    request_id: String,
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        self.injector.release_scope(&self.request_id);
    }
}
