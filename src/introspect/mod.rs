//! Read-only HTTP views of the running gateway.

pub mod http;
pub use http::{IntrospectState, serve};
