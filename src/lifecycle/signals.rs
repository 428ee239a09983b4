//! OS signal handling.
//!
//! # Responsibilities
//! - Listen for SIGTERM and SIGINT
//! - Run supervisor cleanup, then exit with status 0
//!
//! # Design Decisions
//! - Uses Tokio's signal handling (async-safe)
//! - Signals arriving while cleanup runs are swallowed: the handler is
//!   still installed, and the supervisor's guard turns repeats into no-ops

use std::sync::Arc;

use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinHandle;

use crate::lifecycle::supervisor::Supervisor;

/// Spawn the task that exits the process on SIGTERM/SIGINT.
pub fn install(supervisor: Arc<Supervisor>) -> std::io::Result<JoinHandle<()>> {
    let mut term = signal(SignalKind::terminate())?;
    let mut int = signal(SignalKind::interrupt())?;

    Ok(tokio::spawn(async move {
        let name = tokio::select! {
            _ = term.recv() => "SIGTERM",
            _ = int.recv() => "SIGINT",
        };
        tracing::debug!(signal = name, "Received termination signal");

        // Keep draining repeats so they cannot kill the process mid-cleanup.
        let drain = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = term.recv() => {}
                    _ = int.recv() => {}
                }
                tracing::debug!("Ignoring signal during cleanup");
            }
        });

        supervisor.cleanup().await;
        drain.abort();
        std::process::exit(0);
    }))
}
