//! Worker process runtime.
//!
//! # Responsibilities
//! - Build the worker context (identity, session replica, plugins)
//! - Serve the plugin router on the worker's private UNIX socket
//! - Dispatch `/socket` frames to plugin socket endpoints
//! - Clean up and exit on SIGTERM/SIGINT
//!
//! # Data Flow
//! ```text
//! master gate ──HTTP over UNIX socket──→ link.rs attach
//!     → plugin routes / resources / socket
//!     → directives on response ──→ master
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{middleware, Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

use crate::auth::{AuthProvider, Identity, TokenSigner, UsersFileProvider};
use crate::context::AppContext;
use crate::lifecycle::{signals, Supervisor};
use crate::mail::{self, Mailer};
use crate::net::listener::{bind_unix, BindError};
use crate::plugins::{self, resources, PluginRegistry};
use crate::session::{unix_now, Session, SessionKey, SessionRegistry};
use crate::worker::link;

/// Axum state of a worker.
pub type WorkerState = Arc<WorkerContext>;

/// Everything a worker's handlers can reach.
pub struct WorkerContext {
    pub app: Arc<AppContext>,
    /// `None` in the restricted worker.
    pub identity: Option<Identity>,
    pub session_key: SessionKey,
    /// Local replica of this worker's own session.
    pub sessions: SessionRegistry,
    pub auth: Arc<dyn AuthProvider>,
    pub plugins: Arc<PluginRegistry>,
    pub mailer: Arc<dyn Mailer>,
    pub signer: TokenSigner,
}

impl WorkerContext {
    pub fn new(
        app: Arc<AppContext>,
        identity: Option<Identity>,
        session_key: SessionKey,
        auth: Arc<dyn AuthProvider>,
        plugins: Arc<PluginRegistry>,
        mailer: Arc<dyn Mailer>,
    ) -> WorkerState {
        let sessions = SessionRegistry::new();
        if let Some(identity) = &identity {
            sessions.insert(Session {
                key: session_key.clone(),
                user: identity.user.clone(),
                elevated: identity.elevated,
                timestamp: unix_now(),
            });
        }
        let signer = TokenSigner::new(&app.config.auth.secret);
        Arc::new(Self {
            app,
            identity,
            session_key,
            sessions,
            auth,
            plugins,
            mailer,
            signer,
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("failed to load users: {0}")]
    Users(#[source] std::io::Error),
    #[error(transparent)]
    Bind(#[from] BindError),
    #[error("failed to install signal handlers: {0}")]
    Signals(#[source] std::io::Error),
}

/// Arguments the master passes to a worker.
#[derive(Debug, Clone)]
pub struct WorkerArgs {
    pub socket: PathBuf,
    pub session_key: SessionKey,
    pub identity: Option<Identity>,
}

/// One framed message on `/socket`.
#[derive(Debug, Deserialize)]
struct SocketFrame {
    plugin: String,
    #[serde(default)]
    data: Value,
}

/// The worker's HTTP surface.
pub fn router(state: WorkerState) -> Router {
    let body_limit = state.app.config.gateway.max_body_size;
    let mut router = Router::new();
    for plugin in state.plugins.http_plugins() {
        router = router.merge(plugin.routes());
    }
    router
        .route("/socket", get(socket))
        .route("/resources/{plugin}/{*path}", get(resources::resource))
        .route("/", get(resources::index))
        .fallback(not_found)
        .layer(middleware::from_fn_with_state(state.clone(), link::attach))
        .layer(RequestBodyLimitLayer::new(body_limit))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn not_found() -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({"message": "Not found"})),
    )
        .into_response()
}

async fn socket(State(state): State<WorkerState>, upgrade: WebSocketUpgrade) -> Response {
    upgrade.on_upgrade(move |ws| serve_socket(state, ws))
}

async fn serve_socket(state: WorkerState, mut ws: WebSocket) {
    while let Some(Ok(message)) = ws.recv().await {
        let text = match message {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };
        for reply in dispatch(&state, text.as_str()) {
            if ws.send(Message::Text(reply.into())).await.is_err() {
                return;
            }
        }
    }
}

/// Route one frame to its plugin; returns the encoded replies.
pub fn dispatch(ctx: &WorkerContext, frame: &str) -> Vec<String> {
    let frame: SocketFrame = match serde_json::from_str(frame) {
        Ok(frame) => frame,
        Err(e) => {
            tracing::warn!(error = %e, "Malformed socket frame");
            return Vec::new();
        }
    };
    let Some(endpoint) = ctx.plugins.socket(&frame.plugin) else {
        tracing::debug!(plugin = %frame.plugin, "No socket endpoint for plugin");
        return Vec::new();
    };
    endpoint
        .on_message(ctx, frame.data)
        .into_iter()
        .map(|data| json!({"plugin": frame.plugin, "data": data}).to_string())
        .collect()
}

fn hostname() -> String {
    nix::unistd::gethostname()
        .ok()
        .and_then(|name| name.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string())
}

/// Run a worker until it is killed.
pub async fn run(app: Arc<AppContext>, args: WorkerArgs) -> Result<(), RuntimeError> {
    let supervisor = Arc::new(Supervisor::worker());
    signals::install(supervisor).map_err(RuntimeError::Signals)?;

    let auth = UsersFileProvider::from_config(&app.config.auth).map_err(RuntimeError::Users)?;
    let plugins = Arc::new(plugins::load(&app.config.plugins));
    let mailer = mail::from_config(&app.config.email, &hostname());
    let state = WorkerContext::new(
        app,
        args.identity.clone(),
        args.session_key,
        auth,
        plugins,
        mailer,
    );

    let listener = bind_unix(&args.socket)?;
    tracing::info!(
        pid = std::process::id(),
        user = args.identity.as_ref().map(|i| i.user.as_str()).unwrap_or("<restricted>"),
        socket = %args.socket.display(),
        "Worker listening"
    );

    if let Err(e) = axum::serve(listener, router(state)).await {
        tracing::error!(error = %e, "Worker server stopped");
    }
    // The master decides when a worker ends.
    std::future::pending::<()>().await;
    Ok(())
}
