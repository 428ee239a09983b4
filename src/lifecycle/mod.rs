//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! SIGTERM/SIGINT (signals.rs)
//!     → supervisor.rs cleanup (once)
//!         → gateway destroy (master)
//!         → process_tree.rs kill descendants
//!     → exit(0)
//!
//! restart-master directive
//!     → gateway loop stops (shutdown.rs)
//!     → supervisor.rs cleanup
//!     → restart.rs re-exec without debug flags
//! ```

pub mod process_tree;
pub mod restart;
pub mod shutdown;
pub mod signals;
pub mod supervisor;

pub use shutdown::Shutdown;
pub use supervisor::{Role, Supervisor, SupervisorState};
