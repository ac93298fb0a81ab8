//! HTTP dispatcher: the per-request pipeline and its error boundary.

pub mod core;

pub use core::{Collaborator, DispatchError, Dispatcher};
