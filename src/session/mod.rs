//! Session subsystem.
//!
//! # Data Flow
//! ```text
//! POST /api/core/auth (worker)
//!     → establish-session directive
//!     → registry.rs create (master) → cookie.rs Set-Cookie
//!
//! Every proxied request:
//!     cookie.rs → SessionKey → registry.rs lookup → worker
//!     gate attaches timestamp → worker replica
//! ```

pub mod cookie;
pub mod registry;

pub use registry::{unix_now, Session, SessionKey, SessionRegistry};
