//! Worker pool: one worker per session key.
//!
//! # Responsibilities
//! - Spawn a session's worker on first use
//! - Guarantee at most one spawn per key under concurrent requests
//! - Map identities to OS credentials when running as root
//! - Terminate single workers or all of them
//!
//! # Design Decisions
//! - Each key owns a `OnceCell`; concurrent first requests await the
//!   same spawn instead of racing
//! - A failed spawn leaves no slot behind, so the next request retries

use std::sync::Arc;

use dashmap::DashMap;
use futures_util::future::join_all;
use nix::unistd::{geteuid, Uid, User};
use tokio::sync::OnceCell;

use crate::auth::{AuthProvider, Identity};
use crate::observability::metrics;
use crate::session::{SessionKey, SessionRegistry};
use crate::worker::process::{Credentials, Worker, WorkerError, WorkerOptions};

type Slot = Arc<OnceCell<Arc<Worker>>>;
pub(crate) type Slots = DashMap<SessionKey, Slot>;

#[derive(Clone)]
pub struct WorkerPool {
    slots: Arc<Slots>,
    options: Arc<WorkerOptions>,
    auth: Arc<dyn AuthProvider>,
    sessions: SessionRegistry,
    restricted_user: String,
}

impl WorkerPool {
    pub fn new(
        options: WorkerOptions,
        auth: Arc<dyn AuthProvider>,
        sessions: SessionRegistry,
        restricted_user: impl Into<String>,
    ) -> Self {
        Self {
            slots: Arc::new(DashMap::new()),
            options: Arc::new(options),
            auth,
            sessions,
            restricted_user: restricted_user.into(),
        }
    }

    /// The running worker for `key`, spawning it if needed.
    pub async fn get_or_spawn(
        &self,
        key: &SessionKey,
        identity: Option<&Identity>,
    ) -> Result<Arc<Worker>, WorkerError> {
        // A second round covers a worker that died between lookup and use.
        for _ in 0..2 {
            let slot = self.slots.entry(key.clone()).or_default().clone();
            match slot.get_or_try_init(|| self.spawn(key, identity)).await {
                Ok(worker) if worker.is_running() => return Ok(Arc::clone(worker)),
                Ok(_) => {
                    self.slots.remove_if(key, |_, s| Arc::ptr_eq(s, &slot));
                }
                Err(e) => {
                    self.slots
                        .remove_if(key, |_, s| Arc::ptr_eq(s, &slot) && s.get().is_none());
                    return Err(e);
                }
            }
        }
        Err(WorkerError::Terminated)
    }

    async fn spawn(
        &self,
        key: &SessionKey,
        identity: Option<&Identity>,
    ) -> Result<Arc<Worker>, WorkerError> {
        let credentials = self.credentials(identity)?;
        let worker = Worker::spawn(
            &self.options,
            key.clone(),
            identity.cloned(),
            credentials,
            Arc::downgrade(&self.slots),
            self.sessions.clone(),
        )
        .await?;
        metrics::set_active_workers(self.slots.len());
        Ok(worker)
    }

    /// Account for a worker acting as `identity`; `None` when not root.
    pub fn credentials(&self, identity: Option<&Identity>) -> Result<Option<Credentials>, WorkerError> {
        if !geteuid().is_root() {
            return Ok(None);
        }
        match identity {
            Some(id) if id.elevated || id.is_root() => {
                return Ok(Some(Credentials { uid: 0, gid: 0 }));
            }
            Some(id) => match self.auth.isolation_uid(&id.user) {
                Some(uid) => return Ok(Some(credentials_for_uid(uid))),
                None => tracing::warn!(
                    user = %id.user,
                    account = %self.restricted_user,
                    "No isolation uid for user, using restricted account"
                ),
            },
            None => {}
        }
        match User::from_name(&self.restricted_user) {
            Ok(Some(user)) => Ok(Some(Credentials {
                uid: user.uid.as_raw(),
                gid: user.gid.as_raw(),
            })),
            _ => Err(WorkerError::UnknownAccount(self.restricted_user.clone())),
        }
    }

    pub fn get(&self, key: &SessionKey) -> Option<Arc<Worker>> {
        self.slots.get(key).and_then(|slot| slot.get().cloned())
    }

    /// Every started worker.
    pub fn workers(&self) -> Vec<Arc<Worker>> {
        self.slots
            .iter()
            .filter_map(|slot| slot.value().get().cloned())
            .collect()
    }

    /// Terminate the worker for `key`, if any. Returns whether one existed.
    pub async fn terminate(&self, key: &SessionKey) -> bool {
        let Some(worker) = self.get(key) else {
            return false;
        };
        worker.terminate().await;
        metrics::set_active_workers(self.slots.len());
        true
    }

    pub async fn terminate_all(&self) {
        let workers = self.workers();
        join_all(workers.iter().map(|worker| worker.terminate())).await;
        self.slots.clear();
        metrics::set_active_workers(0);
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

fn credentials_for_uid(uid: u32) -> Credentials {
    let gid = match User::from_uid(Uid::from_raw(uid)) {
        Ok(Some(user)) => user.gid.as_raw(),
        _ => uid,
    };
    Credentials { uid, gid }
}
