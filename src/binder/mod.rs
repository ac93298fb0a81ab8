//! Argument binding: assembles the per-request argument map, classifies
//! handler parameters into roles at registration time and materializes the
//! bound values at dispatch time.

pub mod convert;
pub mod core;
pub mod inject;

pub use core::{
    assemble_args, bind, ArgError, BindContext, BoundParams, BoundValue, HandlerDescriptor,
    HandlerResult, HttpHandlerSpec, ParamRole, SessionValue,
};
pub use inject::{Injectable, Injector, ScopeGuard};
