//! HTTP API served by workers.
//!
//! `core.rs` holds the built-in endpoints, registered through the core
//! plugin; `endpoint.rs` the error type and extractors they share.

pub mod core;
pub mod endpoint;

pub use endpoint::{Authenticated, EndpointError, EndpointResult, RemoteAddr};
