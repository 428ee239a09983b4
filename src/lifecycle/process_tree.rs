//! Process tree termination.
//!
//! # Responsibilities
//! - Enumerate every descendant of a process (sysinfo)
//! - Deliver SIGTERM then SIGKILL to each descendant's process group
//!
//! # Design Decisions
//! - A process that is already gone is not an error
//! - Other per-process failures are collected, never propagated: one
//!   stubborn child must not stop the rest from being signalled
//! - Workers lead their own process group, so signalling the group also
//!   reaches anything they spawned

use nix::errno::Errno;
use nix::sys::signal::{kill, killpg, Signal};
use nix::unistd::Pid;
use sysinfo::{ProcessRefreshKind, ProcessesToUpdate, System};

#[derive(Debug, thiserror::Error)]
#[error("failed to send {signal} to process {pid}: {source}")]
pub struct ProcessTreeError {
    pub pid: u32,
    pub signal: Signal,
    #[source]
    pub source: Errno,
}

/// Outcome of terminating a set of processes.
#[derive(Debug, Default)]
pub struct TerminationReport {
    /// Processes that received the signals.
    pub signalled: Vec<u32>,
    /// Processes that no longer existed.
    pub gone: Vec<u32>,
    pub failed: Vec<ProcessTreeError>,
}

/// All live descendants of `root`, parents before children.
pub fn descendants(root: u32) -> Vec<u32> {
    let mut system = System::new();
    system.refresh_processes_specifics(ProcessesToUpdate::All, true, ProcessRefreshKind::nothing());

    let mut found = Vec::new();
    let mut frontier = vec![sysinfo::Pid::from_u32(root)];
    while let Some(parent) = frontier.pop() {
        for (pid, process) in system.processes() {
            if process.thread_kind().is_none() && process.parent() == Some(parent) {
                found.push(pid.as_u32());
                frontier.push(*pid);
            }
        }
    }
    found
}

fn signal(pid: u32, sig: Signal) -> Result<bool, ProcessTreeError> {
    let raw = Pid::from_raw(pid as i32);
    match killpg(raw, sig) {
        Ok(()) => Ok(true),
        // Not a group leader: signal the process alone.
        Err(Errno::ESRCH) => match kill(raw, sig) {
            Ok(()) => Ok(true),
            Err(Errno::ESRCH) => Ok(false),
            Err(source) => Err(ProcessTreeError {
                pid,
                signal: sig,
                source,
            }),
        },
        Err(source) => Err(ProcessTreeError {
            pid,
            signal: sig,
            source,
        }),
    }
}

/// SIGTERM then SIGKILL to each of `pids`.
pub fn terminate_all(pids: &[u32]) -> TerminationReport {
    let mut report = TerminationReport::default();
    for &pid in pids {
        match signal(pid, Signal::SIGTERM).and_then(|alive| {
            if alive {
                signal(pid, Signal::SIGKILL).map(|_| true)
            } else {
                Ok(false)
            }
        }) {
            Ok(true) => report.signalled.push(pid),
            Ok(false) => report.gone.push(pid),
            Err(e) => {
                tracing::error!(pid, error = %e, "Could not kill child process");
                report.failed.push(e);
            }
        }
    }
    report
}

/// Terminate every descendant of `root`.
pub fn terminate_descendants(root: u32) -> TerminationReport {
    let pids = descendants(root);
    tracing::debug!(count = pids.len(), "Killing child processes");
    terminate_all(&pids)
}
