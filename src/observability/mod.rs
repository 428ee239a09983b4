//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! All subsystems produce:
//!     → logging.rs (structured tracing events, one subscriber per process)
//!     → metrics.rs (counters, gauges, histograms)
//!
//! Consumers:
//!     → stdout of master and workers
//!     → Prometheus scrape endpoint (master, opt-in)
//! ```

pub mod logging;
pub mod metrics;
