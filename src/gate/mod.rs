//! Request gateway subsystem.
//!
//! # Data Flow
//! ```text
//! Listener (net)
//!     → server.rs (request id, tracing, timeout)
//!     → route: session cookie → SessionRegistry → worker (spawned lazily)
//!         ├─ /socket.io/  → transport.rs (websocket relay or polling channel)
//!         └─ everything else → proxy.rs over the worker's UNIX socket
//!     → directive.rs: strip and apply worker directives
//!     → client
//! ```

pub mod directive;
pub mod proxy;
pub mod server;
pub mod transport;

pub use directive::Directive;
pub use server::{Gateway, Route, ServeOutcome};
pub use transport::{PollRegistry, Transport};
