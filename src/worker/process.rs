//! Master-side handle to one worker process.
//!
//! # Responsibilities
//! - Spawn `panel-gateway worker` with the right identity and credentials
//! - Wait until the worker accepts connections on its socket
//! - Terminate: SIGTERM to the worker's process group, SIGKILL after the
//!   grace period, reap, remove the socket directory
//!
//! # Design Decisions
//! - Every worker leads its own process group so one signal reaches
//!   anything it spawned
//! - Each worker gets a private socket directory, chowned to the
//!   worker's uid when privileges are dropped
//! - The back-reference to the pool is weak and only used to remove the
//!   worker's own slot

use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::{chown, Gid, Pid, Uid};
use tokio::net::UnixStream;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::auth::Identity;
use crate::context::{AppContext, RunMode};
use crate::observability::metrics;
use crate::session::{SessionKey, SessionRegistry};
use crate::worker::pool::Slots;

/// Environment variable carrying the session key to a worker.
pub const SESSION_KEY_ENV: &str = "PANEL_GATEWAY_SESSION_KEY";

const SOCKET_NAME: &str = "worker.sock";
const READY_POLL_INTERVAL: Duration = Duration::from_millis(25);

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("failed to prepare worker directory {path}: {source}")]
    RuntimeDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to change owner of {path}: {source}")]
    Chown {
        path: PathBuf,
        #[source]
        source: Errno,
    },
    #[error("failed to spawn worker: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("worker exited during startup with {0}")]
    Exited(ExitStatus),
    #[error("worker did not accept connections within {0:?}")]
    StartTimeout(Duration),
    #[error("no such account: {0}")]
    UnknownAccount(String),
    #[error("worker terminated while starting")]
    Terminated,
}

/// Account a worker process runs as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Credentials {
    pub uid: u32,
    pub gid: u32,
}

/// Settings shared by every spawned worker.
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub executable: PathBuf,
    pub config_path: PathBuf,
    pub runtime_dir: PathBuf,
    pub mode: RunMode,
    pub start_timeout: Duration,
    pub grace: Duration,
}

impl WorkerOptions {
    pub fn from_app(app: &AppContext) -> std::io::Result<Self> {
        let worker = &app.config.worker;
        Ok(Self {
            executable: app.worker_executable()?,
            config_path: app.config_path.clone(),
            runtime_dir: worker.runtime_dir.clone(),
            mode: app.mode,
            start_timeout: Duration::from_secs(worker.start_timeout_secs),
            grace: Duration::from_millis(worker.terminate_grace_ms),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WorkerStatus {
    Running = 0,
    Terminating = 1,
    Terminated = 2,
}

pub struct Worker {
    key: SessionKey,
    identity: Option<Identity>,
    pid: u32,
    dir: PathBuf,
    socket: PathBuf,
    grace: Duration,
    state: AtomicU8,
    child: Mutex<Option<Child>>,
    pool: Weak<Slots>,
    sessions: SessionRegistry,
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("session", &self.key.to_string())
            .field("pid", &self.pid)
            .field("state", &self.state())
            .finish()
    }
}

fn prepare_dir(root: &Path, credentials: Option<Credentials>) -> Result<PathBuf, WorkerError> {
    let dir = root.join(format!("worker-{}", uuid::Uuid::new_v4()));
    let io_err = |source| WorkerError::RuntimeDir {
        path: dir.clone(),
        source,
    };
    std::fs::create_dir_all(root).map_err(io_err)?;
    std::fs::DirBuilder::new()
        .mode(0o700)
        .create(&dir)
        .map_err(io_err)?;
    if let Some(c) = credentials {
        chown(&dir, Some(Uid::from_raw(c.uid)), Some(Gid::from_raw(c.gid))).map_err(|source| {
            WorkerError::Chown {
                path: dir.clone(),
                source,
            }
        })?;
    }
    Ok(dir)
}

impl Worker {
    /// Spawn a worker and wait until it is ready.
    pub(crate) async fn spawn(
        options: &WorkerOptions,
        key: SessionKey,
        identity: Option<Identity>,
        credentials: Option<Credentials>,
        pool: Weak<Slots>,
        sessions: SessionRegistry,
    ) -> Result<Arc<Self>, WorkerError> {
        let dir = prepare_dir(&options.runtime_dir, credentials)?;
        let socket = dir.join(SOCKET_NAME);

        let mut command = Command::new(&options.executable);
        command
            .arg("worker")
            .arg("--config")
            .arg(&options.config_path)
            .arg("--socket")
            .arg(&socket)
            .env(SESSION_KEY_ENV, key.as_str())
            .stdin(Stdio::null())
            .process_group(0)
            .kill_on_drop(true);
        if let Some(identity) = &identity {
            command.arg("--user").arg(&identity.user);
            if identity.elevated {
                command.arg("--elevated");
            }
        }
        if options.mode.debug {
            command.arg("-d");
        }
        if options.mode.dev {
            command.arg("--dev");
        }
        if options.mode.autologin {
            command.arg("--autologin");
        }
        if let Some(c) = credentials {
            command.uid(c.uid).gid(c.gid);
        }

        let child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                let _ = std::fs::remove_dir_all(&dir);
                return Err(WorkerError::Spawn(e));
            }
        };
        let worker = Arc::new(Self {
            key,
            identity,
            pid: child.id().unwrap_or_default(),
            dir,
            socket,
            grace: options.grace,
            state: AtomicU8::new(WorkerStatus::Running as u8),
            child: Mutex::new(Some(child)),
            pool,
            sessions,
        });

        if let Err(e) = worker.wait_ready(options.start_timeout).await {
            tracing::error!(pid = worker.pid, error = %e, "Worker failed to start");
            worker.terminate().await;
            return Err(e);
        }

        metrics::record_worker_spawned();
        tracing::info!(
            pid = worker.pid,
            session = %worker.key,
            user = worker.identity.as_ref().map(|i| i.user.as_str()).unwrap_or("<restricted>"),
            "Started worker"
        );
        Ok(worker)
    }

    async fn wait_ready(&self, timeout: Duration) -> Result<(), WorkerError> {
        let deadline = Instant::now() + timeout;
        loop {
            if UnixStream::connect(&self.socket).await.is_ok() {
                return Ok(());
            }
            if let Some(child) = self.child.lock().await.as_mut() {
                if let Ok(Some(status)) = child.try_wait() {
                    return Err(WorkerError::Exited(status));
                }
            }
            if !self.is_running() {
                return Err(WorkerError::Terminated);
            }
            if Instant::now() >= deadline {
                return Err(WorkerError::StartTimeout(timeout));
            }
            tokio::time::sleep(READY_POLL_INTERVAL).await;
        }
    }

    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    pub fn identity(&self) -> Option<&Identity> {
        self.identity.as_ref()
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket
    }

    pub fn state(&self) -> WorkerStatus {
        match self.state.load(Ordering::SeqCst) {
            0 => WorkerStatus::Running,
            1 => WorkerStatus::Terminating,
            _ => WorkerStatus::Terminated,
        }
    }

    pub fn is_running(&self) -> bool {
        self.state() == WorkerStatus::Running
    }

    /// End the worker process and drop its session.
    ///
    /// Later calls return immediately.
    pub async fn terminate(&self) {
        self.shutdown(true).await;
    }

    /// End a worker that stopped answering, keeping its session so the
    /// next request respawns it.
    pub async fn discard(&self) {
        self.shutdown(false).await;
    }

    async fn shutdown(&self, drop_session: bool) {
        if self
            .state
            .compare_exchange(
                WorkerStatus::Running as u8,
                WorkerStatus::Terminating as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_err()
        {
            return;
        }
        self.detach(drop_session);

        let group = Pid::from_raw(self.pid as i32);
        match killpg(group, Signal::SIGTERM) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(e) => tracing::warn!(pid = self.pid, error = %e, "Could not signal worker"),
        }

        if let Some(mut child) = self.child.lock().await.take() {
            if tokio::time::timeout(self.grace, child.wait()).await.is_err() {
                tracing::warn!(pid = self.pid, "Worker ignored SIGTERM, killing");
                let _ = killpg(group, Signal::SIGKILL);
                let _ = child.wait().await;
            }
        }

        if let Err(e) = std::fs::remove_dir_all(&self.dir) {
            tracing::debug!(dir = %self.dir.display(), error = %e, "Could not remove worker directory");
        }
        self.state
            .store(WorkerStatus::Terminated as u8, Ordering::SeqCst);
        metrics::record_worker_terminated();
        tracing::info!(pid = self.pid, session = %self.key, "Worker terminated");
    }

    fn detach(&self, drop_session: bool) {
        if let Some(slots) = self.pool.upgrade() {
            slots.remove_if(&self.key, |_, slot| {
                slot.get().is_some_and(|worker| worker.pid == self.pid)
            });
        }
        if drop_session && !self.key.is_restricted() {
            self.sessions.remove(&self.key);
        }
    }
}
