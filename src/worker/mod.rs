//! Per-session worker processes.
//!
//! # Data Flow
//! ```text
//! master:  pool.rs get_or_spawn(key) → process.rs spawn → `panel-gateway worker`
//! worker:  runtime.rs run → router → handlers
//!          handlers → link.rs WorkerLink → directive headers → master
//! ```

pub mod link;
pub mod pool;
pub mod process;
pub mod runtime;

pub use link::WorkerLink;
pub use pool::WorkerPool;
pub use process::{Credentials, Worker, WorkerError, WorkerOptions, WorkerStatus};
pub use runtime::{WorkerArgs, WorkerContext};
