//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! BindConfig + TlsConfig
//!     → listener.rs (resolve, socket options, bind, listen(10))
//!     → tls.rs (rustls server context, handshake per accepted connection)
//!     → Hand off to the gate server loop
//!
//! connection.rs tracks long-lived relays (websocket / polling) for draining.
//! ```
//!
//! # Design Decisions
//! - One listening socket per master process, never mutated after bind
//! - TLS is optional and only honored in tcp mode

pub mod connection;
pub mod listener;
pub mod tls;

pub use listener::{BindError, Listener};
