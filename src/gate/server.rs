//! The master's request gateway.
//!
//! # Responsibilities
//! - Serve the single listening socket (plain TCP, TLS or UNIX)
//! - Resolve every request to a session and its worker
//! - Relay HTTP exchanges to the worker and apply its directives
//! - Vacuum idle sessions and polling channels
//! - Tear everything down exactly once on shutdown
//!
//! # Design Decisions
//! - Workers are spawned lazily, on the first request of a session
//! - Anonymous requests share one restricted worker
//! - The serve loop stops through [`Shutdown`]; whether it stopped for a
//!   restart is read from the restart marker afterwards

use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::{Json, Router};
use axum_server::tls_rustls::RustlsConfig;
use serde_json::json;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::auth::{AuthProvider, Identity};
use crate::context::AppContext;
use crate::gate::directive::{
    self, Directive, REMOTE_ADDR_HEADER, SESSION_KEY_HEADER, SESSION_TIMESTAMP_HEADER,
};
use crate::gate::proxy;
use crate::gate::transport::{self, PollRegistry};
use crate::lifecycle::Shutdown;
use crate::net::connection::ConnectionTracker;
use crate::net::Listener;
use crate::observability::metrics;
use crate::session::{cookie, unix_now, SessionKey, SessionRegistry};
use crate::worker::{Worker, WorkerError, WorkerOptions, WorkerPool};

/// Why the serve loop returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServeOutcome {
    Stopped,
    RestartRequested,
}

/// Where a request goes.
#[derive(Debug, Clone)]
pub struct Route {
    pub key: SessionKey,
    /// `None` for the restricted worker.
    pub identity: Option<Identity>,
    /// Last activity of the session, if there is one.
    pub timestamp: Option<f64>,
    /// The session was created for this request and needs a cookie.
    pub new_session: bool,
}

impl Route {
    pub fn restricted() -> Self {
        Self {
            key: SessionKey::restricted(),
            identity: None,
            timestamp: None,
            new_session: false,
        }
    }
}

struct Inner {
    app: Arc<AppContext>,
    sessions: SessionRegistry,
    workers: WorkerPool,
    polls: PollRegistry,
    connections: ConnectionTracker,
    shutdown: Shutdown,
    restart: AtomicBool,
    destroyed: AtomicBool,
    secure: AtomicBool,
    socket_path: Mutex<Option<PathBuf>>,
}

#[derive(Clone)]
pub struct Gateway {
    inner: Arc<Inner>,
}

impl Gateway {
    pub fn new(app: Arc<AppContext>, auth: Arc<dyn AuthProvider>) -> io::Result<Self> {
        let sessions = SessionRegistry::new();
        let workers = WorkerPool::new(
            WorkerOptions::from_app(&app)?,
            auth,
            sessions.clone(),
            app.config.worker.restricted_user.clone(),
        );
        Ok(Self {
            inner: Arc::new(Inner {
                app,
                sessions,
                workers,
                polls: PollRegistry::new(),
                connections: ConnectionTracker::new(),
                shutdown: Shutdown::new(),
                restart: AtomicBool::new(false),
                destroyed: AtomicBool::new(false),
                secure: AtomicBool::new(false),
                socket_path: Mutex::new(None),
            }),
        })
    }

    pub fn app(&self) -> &Arc<AppContext> {
        &self.inner.app
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.inner.sessions
    }

    pub fn workers(&self) -> &WorkerPool {
        &self.inner.workers
    }

    pub fn polls(&self) -> &PollRegistry {
        &self.inner.polls
    }

    pub fn connections(&self) -> &ConnectionTracker {
        &self.inner.connections
    }

    /// Resolve the session a request belongs to.
    pub fn route(&self, headers: &HeaderMap) -> Route {
        let max_time = self.inner.app.session_max_time();
        if let Some(session) = cookie::session_from_headers(headers)
            .and_then(|key| self.inner.sessions.get(&key))
            .filter(|session| !session.is_expired(max_time, unix_now()))
        {
            return Route {
                identity: Some(Identity::new(session.user, session.elevated)),
                key: session.key,
                timestamp: Some(session.timestamp),
                new_session: false,
            };
        }

        if self.inner.app.mode.autologin {
            let user = &self.inner.app.config.auth.autologin_user;
            let session = self.inner.sessions.create(user, false);
            return Route {
                identity: Some(Identity::new(user.clone(), false)),
                key: session.key,
                timestamp: Some(session.timestamp),
                new_session: true,
            };
        }

        Route::restricted()
    }

    /// The worker serving `route`, spawned on first use.
    pub async fn worker_for(&self, route: &Route) -> Result<Arc<Worker>, WorkerError> {
        self.inner
            .workers
            .get_or_spawn(&route.key, route.identity.as_ref())
            .await
    }

    /// Hand a freshly created session's cookie to the client.
    pub fn finish_route(&self, route: &Route, response: &mut Response) {
        if route.new_session {
            response.headers_mut().append(
                header::SET_COOKIE,
                cookie::set_cookie(&route.key, self.is_secure()),
            );
        }
    }

    fn is_secure(&self) -> bool {
        self.inner.secure.load(Ordering::SeqCst)
    }

    /// Stop the serve loop and re-exec once it has returned.
    pub fn request_restart(&self) {
        tracing::info!("Restart requested");
        self.inner.restart.store(true, Ordering::SeqCst);
        self.inner.shutdown.trigger();
    }

    pub fn restart_requested(&self) -> bool {
        self.inner.restart.load(Ordering::SeqCst)
    }

    /// Stop the serve loop.
    pub fn stop(&self) {
        self.inner.shutdown.trigger();
    }

    /// Build the master's router.
    #[allow(deprecated)]
    pub fn router(&self) -> Router {
        let timeout = Duration::from_secs(self.inner.app.config.gateway.request_timeout_secs);
        Router::new()
            .route("/socket.io", any(transport::handle))
            .route("/socket.io/", any(transport::handle))
            .fallback(relay)
            .with_state(self.clone())
            .layer(TimeoutLayer::new(timeout))
            .layer(PropagateRequestIdLayer::x_request_id())
            .layer(TraceLayer::new_for_http())
            .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
    }

    /// Apply worker directives to `response`.
    async fn apply(
        &self,
        route: &Route,
        worker: &Arc<Worker>,
        directives: Vec<Directive>,
        response: Response,
    ) -> Response {
        let terminate = directives.contains(&Directive::Terminate);
        let mut response = if terminate {
            // Read the whole reply before its sender goes away.
            let (parts, body) = response.into_parts();
            match axum::body::to_bytes(body, usize::MAX).await {
                Ok(bytes) => Response::from_parts(parts, Body::from(bytes)),
                Err(e) => {
                    tracing::warn!(pid = worker.pid(), error = %e, "Worker reply cut short");
                    Response::from_parts(parts, Body::empty())
                }
            }
        } else {
            response
        };

        let max_time = self.inner.app.session_max_time();
        let mut established = false;
        for directive in directives {
            match directive {
                Directive::EstablishSession { user, elevated } => {
                    let session = self.inner.sessions.create(&user, elevated);
                    tracing::info!(user = %user, elevated, session = %session.key, "Session established");
                    response.headers_mut().append(
                        header::SET_COOKIE,
                        cookie::set_cookie(&session.key, self.is_secure()),
                    );
                    established = true;
                }
                Directive::Touch => {
                    self.inner.sessions.refresh(&route.key, max_time);
                }
                Directive::Terminate if route.key.is_restricted() => {
                    // Shared by every anonymous client.
                    tracing::debug!(pid = worker.pid(), "Ignoring terminate from the restricted worker");
                }
                Directive::Terminate => {
                    self.inner.sessions.remove(&route.key);
                    let worker = Arc::clone(worker);
                    tokio::spawn(async move { worker.terminate().await });
                }
                Directive::RestartMaster => self.request_restart(),
            }
        }

        if terminate && !established && !route.key.is_restricted() {
            response
                .headers_mut()
                .append(header::SET_COOKIE, cookie::clear_cookie());
        } else if !established {
            self.finish_route(route, &mut response);
        }
        response
    }

    /// Drop idle sessions with their workers, and stale polling channels.
    ///
    /// Returns the number of expired sessions.
    pub async fn vacuum(&self) -> usize {
        let expired = self
            .inner
            .sessions
            .vacuum(self.inner.app.session_max_time());
        for session in &expired {
            tracing::info!(user = %session.user, session = %session.key, "Session expired");
            self.inner.workers.terminate(&session.key).await;
        }
        let idle = Duration::from_secs(self.inner.app.config.transport.poll_idle_secs);
        let closed = self.inner.polls.vacuum(idle);
        if closed > 0 {
            tracing::debug!(channels = closed, "Closed idle polling channels");
        }
        expired.len()
    }

    async fn vacuum_loop(self) {
        let every = Duration::from_secs(self.inner.app.config.gateway.vacuum_interval_secs.max(1));
        let mut ticker = tokio::time::interval(every);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            self.vacuum().await;
        }
    }

    /// Serve `listener` until [`stop`](Self::stop) or a restart request.
    pub async fn serve(&self, listener: Listener) -> io::Result<ServeOutcome> {
        self.inner.secure.store(listener.is_tls(), Ordering::SeqCst);
        if let (Some(path), Ok(mut slot)) = (listener.socket_path(), self.inner.socket_path.lock()) {
            *slot = Some(path.to_path_buf());
        }

        let vacuum = tokio::spawn(self.clone().vacuum_loop());
        let router = self.router();
        let shutdown = self.inner.shutdown.clone();
        let drain = Duration::from_secs(self.inner.app.config.gateway.drain_timeout_secs);

        tracing::info!(address = ?listener.local_addr(), tls = listener.is_tls(), "Gateway serving");
        let result = match listener {
            Listener::Tcp { inner, tls: None } => {
                axum::serve(inner, router.into_make_service_with_connect_info::<SocketAddr>())
                    .with_graceful_shutdown(async move { shutdown.wait().await })
                    .await
            }
            Listener::Tcp {
                inner,
                tls: Some(config),
            } => {
                let handle = axum_server::Handle::new();
                let stopper = handle.clone();
                tokio::spawn(async move {
                    shutdown.wait().await;
                    stopper.graceful_shutdown(Some(drain));
                });
                axum_server::from_tcp_rustls(inner.into_std()?, RustlsConfig::from_config(config))
                    .handle(handle)
                    .serve(router.into_make_service_with_connect_info::<SocketAddr>())
                    .await
            }
            Listener::Unix { inner, .. } => {
                axum::serve(inner, router.into_make_service())
                    .with_graceful_shutdown(async move { shutdown.wait().await })
                    .await
            }
        };
        vacuum.abort();

        let lingering = self.inner.connections.drain(drain).await;
        if lingering > 0 {
            tracing::warn!(connections = lingering, "Relays still open after drain timeout");
        }
        result?;

        tracing::info!("Gateway stopped");
        Ok(if self.restart_requested() {
            ServeOutcome::RestartRequested
        } else {
            ServeOutcome::Stopped
        })
    }

    /// Close channels, stop every worker and remove the socket file.
    ///
    /// Runs once; later calls return immediately.
    pub async fn destroy(&self) {
        if self.inner.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.stop();
        self.inner.polls.close_all();
        self.inner.workers.terminate_all().await;

        let socket = self
            .inner
            .socket_path
            .lock()
            .ok()
            .and_then(|mut path| path.take());
        if let Some(path) = socket {
            if let Err(e) = std::fs::remove_file(&path) {
                tracing::debug!(path = %path.display(), error = %e, "Could not remove socket file");
            }
        }
        tracing::debug!("Gateway destroyed");
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.load(Ordering::SeqCst)
    }
}

/// Client address: peer address on TCP, forwarding headers behind a
/// UNIX-socket front end.
fn remote_addr(request: &Request) -> String {
    if let Some(ConnectInfo(addr)) = request.extensions().get::<ConnectInfo<SocketAddr>>() {
        return addr.ip().to_string();
    }
    let headers = request.headers();
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .or_else(|| headers.get("x-real-ip").and_then(|v| v.to_str().ok()))
        .map(|v| v.trim().to_string())
        .unwrap_or_else(|| "unix".to_string())
}

pub(crate) fn worker_unavailable(e: &WorkerError) -> Response {
    tracing::error!(error = %e, "No worker for request");
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(json!({"message": "Worker unavailable"})),
    )
        .into_response()
}

/// Fallback handler: relay the request to its worker.
async fn relay(State(gateway): State<Gateway>, mut request: Request) -> Response {
    let started = Instant::now();
    let route = gateway.route(request.headers());
    let remote = remote_addr(&request);

    let headers = request.headers_mut();
    directive::strip_internal(headers);
    if let Ok(value) = HeaderValue::from_str(&remote) {
        headers.insert(REMOTE_ADDR_HEADER, value);
    }
    if let Ok(value) = HeaderValue::from_str(route.key.as_str()) {
        headers.insert(SESSION_KEY_HEADER, value);
    }
    if let Some(timestamp) = route.timestamp {
        if let Ok(value) = HeaderValue::from_str(&timestamp.to_string()) {
            headers.insert(SESSION_TIMESTAMP_HEADER, value);
        }
    }

    let worker = match gateway.worker_for(&route).await {
        Ok(worker) => worker,
        Err(e) => {
            metrics::record_request(StatusCode::SERVICE_UNAVAILABLE.as_u16(), started.elapsed());
            return worker_unavailable(&e);
        }
    };

    let forwarded = proxy::forward(worker.socket_path(), request).await;
    let mut response = match forwarded {
        Ok(response) => response,
        Err(e) => {
            tracing::error!(pid = worker.pid(), session = %route.key, error = %e, "Worker did not answer");
            tokio::spawn(async move { worker.discard().await });
            metrics::record_request(StatusCode::BAD_GATEWAY.as_u16(), started.elapsed());
            return (
                StatusCode::BAD_GATEWAY,
                Json(json!({"message": "Worker did not answer"})),
            )
                .into_response();
        }
    };

    let directives = Directive::take_all(response.headers_mut());
    let response = gateway.apply(&route, &worker, directives, response).await;
    metrics::record_request(response.status().as_u16(), started.elapsed());
    response
}
