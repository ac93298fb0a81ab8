//! Route registry and matcher.

pub mod core;

pub use core::{ParamVec, PathPattern, Resolution, Route, RouteTable, MAX_INLINE_PARAMS};
