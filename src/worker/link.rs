//! Worker-side handle to the master.
//!
//! Handlers extract a [`WorkerLink`] to ask the master for effects. Each
//! request gets its own link; the [`attach`] middleware turns whatever
//! the handler queued into directive headers on the response.

use std::convert::Infallible;
use std::sync::{Arc, Mutex};

use axum::extract::{FromRequestParts, Request, State};
use axum::http::request::Parts;
use axum::middleware::Next;
use axum::response::Response;

use crate::gate::directive::{Directive, DIRECTIVE_HEADER, SESSION_TIMESTAMP_HEADER};
use crate::session::{SessionKey, SessionRegistry};
use crate::worker::runtime::WorkerState;

#[derive(Clone)]
pub struct WorkerLink {
    key: SessionKey,
    sessions: SessionRegistry,
    max_time: u64,
    queued: Arc<Mutex<Vec<Directive>>>,
}

impl WorkerLink {
    pub fn new(key: SessionKey, sessions: SessionRegistry, max_time: u64) -> Self {
        Self {
            key,
            sessions,
            max_time,
            queued: Arc::default(),
        }
    }

    fn push(&self, directive: Directive) {
        if let Ok(mut queued) = self.queued.lock() {
            if !queued.contains(&directive) {
                queued.push(directive);
            }
        }
    }

    /// End this worker once the response is delivered.
    pub fn terminate(&self) {
        self.push(Directive::Terminate);
    }

    /// Ask the master to re-exec itself.
    pub fn restart_master(&self) {
        self.push(Directive::RestartMaster);
    }

    /// Refresh this session's activity, locally and in the master.
    ///
    /// An expired session is left as is.
    pub fn update_session_list(&self) {
        if self.sessions.refresh(&self.key, self.max_time) {
            self.push(Directive::Touch);
        }
    }

    /// Have the master create a session for `user` and set its cookie.
    pub fn establish_session(&self, user: &str, elevated: bool) {
        self.push(Directive::EstablishSession {
            user: user.to_string(),
            elevated,
        });
    }

    pub fn session_key(&self) -> &SessionKey {
        &self.key
    }

    /// Directives queued so far.
    pub fn queued(&self) -> Vec<Directive> {
        self.queued.lock().map(|q| q.clone()).unwrap_or_default()
    }
}

impl<S: Send + Sync> FromRequestParts<S> for WorkerLink {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(parts
            .extensions
            .get::<WorkerLink>()
            .cloned()
            .unwrap_or_else(|| {
                WorkerLink::new(SessionKey::restricted(), SessionRegistry::new(), 0)
            }))
    }
}

/// Middleware: sync the session replica, install a link, emit directives.
pub async fn attach(State(state): State<WorkerState>, mut request: Request, next: Next) -> Response {
    if let Some(timestamp) = request
        .headers()
        .get(&SESSION_TIMESTAMP_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<f64>().ok())
    {
        state.sessions.touch_at(&state.session_key, timestamp);
    }

    let link = WorkerLink::new(
        state.session_key.clone(),
        state.sessions.clone(),
        state.app.session_max_time(),
    );
    request.extensions_mut().insert(link.clone());

    let mut response = next.run(request).await;
    for directive in link.queued() {
        response
            .headers_mut()
            .append(DIRECTIVE_HEADER, directive.encode());
    }
    response
}
