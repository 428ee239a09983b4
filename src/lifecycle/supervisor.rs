//! Process lifecycle supervisor.
//!
//! # Responsibilities
//! - Run shutdown cleanup exactly once per process
//! - Tear down the gateway (master only)
//! - Kill every descendant process
//!
//! # Design Decisions
//! - An atomic flag guards cleanup; a later call does no work of its own
//!   but waits until the first one has finished, so whichever caller
//!   exits the process never cuts cleanup short
//! - Cleanup never fails: per-child errors are logged and skipped

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use tokio::sync::watch;

use crate::gate::Gateway;
use crate::lifecycle::process_tree;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Master,
    Worker,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SupervisorState {
    Running = 0,
    CleaningUp = 1,
    Stopped = 2,
}

pub struct Supervisor {
    role: Role,
    gateway: Option<Gateway>,
    /// Root of the process tree killed on cleanup; `None` skips the kill.
    tree_root: Option<u32>,
    started: AtomicBool,
    state: AtomicU8,
    finished: watch::Sender<bool>,
}

impl Supervisor {
    pub fn master(gateway: Gateway) -> Self {
        Self::new(Role::Master, Some(gateway))
    }

    pub fn worker() -> Self {
        Self::new(Role::Worker, None)
    }

    fn new(role: Role, gateway: Option<Gateway>) -> Self {
        Self {
            role,
            gateway,
            tree_root: Some(std::process::id()),
            started: AtomicBool::new(false),
            state: AtomicU8::new(SupervisorState::Running as u8),
            finished: watch::Sender::new(false),
        }
    }

    /// Kill the descendants of `root` instead of this process's.
    pub fn with_tree_root(mut self, root: Option<u32>) -> Self {
        self.tree_root = root;
        self
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> SupervisorState {
        match self.state.load(Ordering::SeqCst) {
            0 => SupervisorState::Running,
            1 => SupervisorState::CleaningUp,
            _ => SupervisorState::Stopped,
        }
    }

    /// Run cleanup. Returns `false` if another call already started it,
    /// after waiting for that call to finish.
    pub async fn cleanup(&self) -> bool {
        if self.started.swap(true, Ordering::SeqCst) {
            tracing::debug!("Cleanup already in progress");
            let mut finished = self.finished.subscribe();
            let _ = finished.wait_for(|done| *done).await;
            return false;
        }
        self.state
            .store(SupervisorState::CleaningUp as u8, Ordering::SeqCst);
        tracing::info!("Process {} exiting normally", std::process::id());

        if let (Role::Master, Some(gateway)) = (self.role, &self.gateway) {
            gateway.destroy().await;
        }

        if let Some(root) = self.tree_root {
            match tokio::task::spawn_blocking(move || process_tree::terminate_descendants(root)).await {
                Ok(report) if !report.failed.is_empty() => {
                    tracing::warn!(failed = report.failed.len(), "Some child processes could not be killed");
                }
                Ok(_) => {}
                Err(e) => tracing::error!(error = %e, "Process tree cleanup panicked"),
            }
        }

        self.state
            .store(SupervisorState::Stopped as u8, Ordering::SeqCst);
        self.finished.send_replace(true);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn cleanup_runs_once() {
        let supervisor = Arc::new(Supervisor::worker().with_tree_root(None));
        assert_eq!(supervisor.state(), SupervisorState::Running);

        let (a, b) = tokio::join!(supervisor.cleanup(), supervisor.cleanup());
        assert!(a ^ b);
        assert!(!supervisor.cleanup().await);
        assert_eq!(supervisor.state(), SupervisorState::Stopped);
    }

    #[tokio::test]
    async fn cleanup_kills_tree_of_given_root() {
        let mut parent = std::process::Command::new("sh")
            .args(["-c", "sleep 30 & wait"])
            .spawn()
            .unwrap();
        // Give the shell time to fork its child.
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        let children = process_tree::descendants(parent.id());
        assert_eq!(children.len(), 1);

        let supervisor = Supervisor::worker().with_tree_root(Some(parent.id()));
        assert!(supervisor.cleanup().await);

        // The shell's `wait` returns once its child is killed.
        let status = parent.wait().unwrap();
        assert!(status.code().is_some());
    }

    #[tokio::test]
    async fn second_cleanup_waits_for_first_to_finish() {
        let mut parent = std::process::Command::new("sh")
            .args(["-c", "sleep 30 & wait"])
            .spawn()
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;

        let supervisor = Supervisor::worker().with_tree_root(Some(parent.id()));
        let (first, (second, state)) = tokio::join!(supervisor.cleanup(), async {
            tokio::task::yield_now().await;
            let ran = supervisor.cleanup().await;
            (ran, supervisor.state())
        });

        assert!(first);
        assert!(!second);
        assert_eq!(state, SupervisorState::Stopped);
        parent.wait().unwrap();
    }
}
