//! Core API endpoints.
//!
//! # Responsibilities
//! - Identity and web manifest for the client shell
//! - Login (normal and sudo), logout, session keep-alive
//! - Sidebar, navbox search, language list
//! - Master restart, password reset tokens
//!
//! # Design Decisions
//! - Failed authentication is delayed with `tokio::time::sleep`, which
//!   suspends only the failing request
//! - Handlers never mutate master state; they queue directives on the
//!   request's [`WorkerLink`]

use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::{header, HeaderMap};
use axum::routing::{get, post};
use axum::{Json, Router};
use nix::unistd::{getuid, geteuid};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::api::endpoint::{Authenticated, EndpointError, EndpointResult, JsonBody, RemoteAddr};
use crate::auth::ROOT_USER;
use crate::observability::metrics;
use crate::plugins::sidebar;
use crate::worker::runtime::WorkerState;
use crate::worker::WorkerLink;

/// `session-time` answer while every client is logged in automatically.
const AUTOLOGIN_SESSION_TIME: i64 = 86400;

/// Lets a `touch` issued by this request settle before reading.
const SESSION_SETTLE_DELAY: Duration = Duration::from_millis(10);

/// Header carrying the URL prefix the panel is mounted under.
const URL_PREFIX_HEADER: &str = "x-url-prefix";

pub fn routes() -> Router<WorkerState> {
    Router::new()
        .route("/api/core/identity", get(identity))
        .route("/api/core/web-manifest", get(web_manifest))
        .route("/api/core/auth", post(auth))
        .route("/api/core/logout", post(logout))
        .route("/api/core/sidebar", get(sidebar_tree))
        .route("/api/core/navbox/{query}", get(navbox))
        .route("/api/core/restart-master", get(restart_master))
        .route("/api/core/languages", get(languages))
        .route("/api/core/session-time", get(session_time))
        .route("/api/send_password_reset", post(send_password_reset))
        .route("/api/check_pw_serial", post(check_pw_serial))
}

fn hostname() -> String {
    nix::unistd::gethostname()
        .ok()
        .and_then(|name| name.into_string().ok())
        .unwrap_or_default()
}

async fn identity(State(state): State<WorkerState>) -> Json<Value> {
    let user = state.identity.as_ref().map(|i| i.user.as_str());
    let profile = user
        .map(|u| state.auth.get_profile(u))
        .unwrap_or(Value::Null);
    let config = &state.app.config;
    Json(json!({
        "identity": {
            "user": user,
            "uid": getuid().as_raw(),
            "effective": geteuid().as_raw(),
            "elevation_allowed": config.auth.allow_sudo,
            "profile": profile,
        },
        "machine": {
            "name": config.name,
            "hostname": hostname(),
        },
        "color": config.color,
    }))
}

async fn web_manifest(State(state): State<WorkerState>, headers: HeaderMap) -> Json<Value> {
    let prefix = headers
        .get(URL_PREFIX_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let config = &state.app.config;
    let color = config.color.as_deref().unwrap_or("#ffffff");
    Json(json!({
        "name": format!("{} ({})", config.name, hostname()),
        "short_name": config.name,
        "prefer_related_applications": false,
        "start_url": format!("{prefix}/#app"),
        "icons": [{
            "src": format!("{prefix}/resources/core/resources/images/icon.png"),
            "sizes": "1024x1024",
            "type": "image/png",
        }],
        "display": "standalone",
        "background_color": color,
        "theme_color": color,
    }))
}

#[derive(Debug, Deserialize)]
pub struct AuthRequest {
    pub mode: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

async fn fail_delay(state: &WorkerState) {
    tokio::time::sleep(Duration::from_secs(state.app.config.auth.failure_delay_secs)).await;
}

async fn auth(
    State(state): State<WorkerState>,
    link: WorkerLink,
    RemoteAddr(ip): RemoteAddr,
    JsonBody(request): JsonBody<AuthRequest>,
) -> Json<Value> {
    let AuthRequest {
        mode,
        username,
        password,
    } = request;

    match mode.as_str() {
        "normal" => match state.auth.authenticate(&username, &password) {
            Ok(()) => {
                tracing::info!(user = %username, ip = %ip, "User authenticated");
                link.establish_session(&username, false);
                Json(json!({"success": true, "username": username}))
            }
            Err(_) => {
                tracing::warn!(
                    user = %username,
                    ip = %ip,
                    "Failed login from {} at IP : {}",
                    username,
                    ip
                );
                metrics::record_failed_login("normal");
                fail_delay(&state).await;
                Json(json!({"success": false, "error": null}))
            }
        },
        "sudo" => match state.auth.check_sudo_password(&username, &password) {
            Ok(true) => {
                tracing::info!(user = %username, ip = %ip, "Elevated to root");
                link.terminate();
                link.establish_session(ROOT_USER, true);
                Json(json!({"success": true, "username": ROOT_USER}))
            }
            Ok(false) => {
                tracing::warn!(user = %username, ip = %ip, "Failed sudo from {} at IP : {}", username, ip);
                metrics::record_failed_login("sudo");
                fail_delay(&state).await;
                Json(json!({"success": false, "error": "Authorization failed"}))
            }
            Err(e) => {
                tracing::warn!(user = %username, ip = %ip, error = %e, "Sudo refused");
                metrics::record_failed_login("sudo");
                fail_delay(&state).await;
                Json(json!({"success": false, "error": e.to_string()}))
            }
        },
        _ => Json(json!({"success": false, "error": "Invalid mode"})),
    }
}

async fn logout(link: WorkerLink) -> Json<Value> {
    link.terminate();
    Json(Value::Null)
}

async fn sidebar_tree(
    State(state): State<WorkerState>,
    Authenticated(identity): Authenticated,
) -> Json<Value> {
    let tree = sidebar::build(state.plugins.sidebar_items(), |permission| {
        state.auth.has_permission(&identity.user, permission)
    });
    Json(json!({ "sidebar": tree }))
}

async fn navbox(
    State(state): State<WorkerState>,
    Authenticated(identity): Authenticated,
    Path(query): Path<String>,
) -> Json<Vec<sidebar::SidebarItem>> {
    let tree = sidebar::build(state.plugins.sidebar_items(), |permission| {
        state.auth.has_permission(&identity.user, permission)
    });
    Json(sidebar::search(&tree, &query))
}

async fn restart_master(_: Authenticated, link: WorkerLink) -> Json<Value> {
    link.restart_master();
    Json(Value::Null)
}

async fn languages(State(state): State<WorkerState>, _: Authenticated) -> Json<Vec<String>> {
    Json(state.plugins.languages())
}

async fn session_time(
    State(state): State<WorkerState>,
    _: Authenticated,
    link: WorkerLink,
) -> Json<i64> {
    if state.app.mode.autologin {
        return Json(AUTOLOGIN_SESSION_TIME);
    }
    link.update_session_list();
    tokio::time::sleep(SESSION_SETTLE_DELAY).await;
    Json(
        state
            .sessions
            .remaining(link.session_key(), state.app.session_max_time()),
    )
}

#[derive(Debug, Deserialize)]
pub struct PasswordResetRequest {
    pub mail: String,
}

/// Payload of a password reset token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResetPayload {
    pub user: String,
    pub email: String,
}

async fn send_password_reset(
    State(state): State<WorkerState>,
    headers: HeaderMap,
    JsonBody(request): JsonBody<PasswordResetRequest>,
) -> EndpointResult<Value> {
    let origin = headers
        .get(header::ORIGIN)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| EndpointError::bad_request("Missing Origin header"))?;

    // Unknown addresses get the same answer as known ones.
    if let Some(user) = state.auth.check_mail(&request.mail) {
        let token = state.signer.dumps(&ResetPayload {
            user,
            email: request.mail.clone(),
        })?;
        let link = format!("{origin}/view/reset_password/{token}");
        state
            .mailer
            .send_password_reset(&request.mail, &link)
            .map_err(|e| EndpointError::internal(e.to_string()))?;
    } else {
        tracing::info!(mail = %request.mail, "Password reset requested for unknown address");
    }
    Ok(Json(Value::Null))
}

#[derive(Debug, Deserialize)]
pub struct SerialRequest {
    #[serde(default)]
    pub serial: String,
}

async fn check_pw_serial(
    State(state): State<WorkerState>,
    JsonBody(request): JsonBody<SerialRequest>,
) -> EndpointResult<Value> {
    if request.serial.is_empty() {
        return Ok(Json(Value::Bool(false)));
    }
    let payload: ResetPayload = state
        .signer
        .loads(&request.serial, state.app.config.auth.reset_token_max_age_secs)?;
    Ok(Json(serde_json::to_value(payload).map_err(|e| EndpointError::internal(e.to_string()))?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use axum::response::Response;
    use tower::ServiceExt;

    use crate::auth::users::{hash_password, UserEntry, UsersFile};
    use crate::auth::{Identity, UsersFileProvider, UsersStore};
    use crate::config::GatewayConfig;
    use crate::context::{AppContext, RunMode};
    use crate::gate::directive::{Directive, DIRECTIVE_HEADER, REMOTE_ADDR_HEADER};
    use crate::mail::{MailError, Mailer};
    use crate::session::{unix_now, SessionKey};
    use crate::worker::runtime::{self, WorkerContext};

    #[derive(Default)]
    struct CapturingMailer(Mutex<Vec<(String, String)>>);

    impl Mailer for CapturingMailer {
        fn send_password_reset(&self, to: &str, link: &str) -> Result<(), MailError> {
            self.0.lock().unwrap().push((to.into(), link.into()));
            Ok(())
        }
    }

    fn users() -> UsersFile {
        let mut users = UsersFile::default();
        users.users.insert(
            "bob".into(),
            UserEntry {
                password: hash_password("bob-pw"),
                email: Some("bob@example.com".into()),
                sudo: true,
                ..Default::default()
            },
        );
        users
    }

    fn state_with(identity: Option<Identity>, mailer: Arc<dyn Mailer>) -> WorkerState {
        let mut config = GatewayConfig::default();
        config.auth.secret = "test-secret".into();
        config.auth.allow_sudo = true;
        let app = AppContext::new(config, "/tmp/gw.toml", RunMode::default());
        let auth = Arc::new(UsersFileProvider::new(
            UsersStore::from_file(users()),
            &app.config.auth,
        ));
        let key = if identity.is_some() {
            SessionKey::generate()
        } else {
            SessionKey::restricted()
        };
        WorkerContext::new(
            app,
            identity,
            key,
            auth,
            Arc::new(crate::plugins::load(&Default::default())),
            mailer,
        )
    }

    fn state(identity: Option<Identity>) -> WorkerState {
        state_with(identity, Arc::new(CapturingMailer::default()))
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::post(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .header(REMOTE_ADDR_HEADER, "10.0.0.5")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn call(state: &WorkerState, request: Request<Body>) -> Response {
        runtime::router(state.clone()).oneshot(request).await.unwrap()
    }

    async fn json_body(response: Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn directives(response: &Response) -> Vec<Directive> {
        response
            .headers()
            .get_all(DIRECTIVE_HEADER)
            .iter()
            .filter_map(|v| Directive::parse(v.to_str().unwrap()))
            .collect()
    }

    #[derive(Clone, Default)]
    struct LogBuffer(Arc<Mutex<Vec<u8>>>);

    impl std::io::Write for LogBuffer {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn failed_login_is_delayed_and_logged_with_ip() {
        let logs = LogBuffer::default();
        let writer = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let state = state(None);
        let started = tokio::time::Instant::now();
        let response = call(
            &state,
            post_json(
                "/api/core/auth",
                json!({"mode": "normal", "username": "bob", "password": "wrong"}),
            ),
        )
        .await;

        assert!(started.elapsed() >= Duration::from_secs(3));
        assert!(directives(&response).is_empty());
        assert_eq!(
            json_body(response).await,
            json!({"success": false, "error": null})
        );

        let logs = String::from_utf8(logs.0.lock().unwrap().clone()).unwrap();
        let line = logs
            .lines()
            .find(|l| l.contains("WARN") && l.contains("Failed login"))
            .expect("warning logged");
        assert!(line.contains("bob"));
        assert!(line.contains("10.0.0.5"));
    }

    #[tokio::test]
    async fn successful_login_establishes_session() {
        let state = state(None);
        let response = call(
            &state,
            post_json(
                "/api/core/auth",
                json!({"mode": "normal", "username": "bob", "password": "bob-pw"}),
            ),
        )
        .await;
        assert_eq!(
            directives(&response),
            [Directive::EstablishSession {
                user: "bob".into(),
                elevated: false
            }]
        );
        assert_eq!(
            json_body(response).await,
            json!({"success": true, "username": "bob"})
        );
    }

    #[tokio::test]
    async fn sudo_swaps_worker_for_root_session() {
        let state = state(Some(Identity::new("bob", false)));
        let response = call(
            &state,
            post_json(
                "/api/core/auth",
                json!({"mode": "sudo", "username": "bob", "password": "bob-pw"}),
            ),
        )
        .await;
        assert_eq!(
            directives(&response),
            [
                Directive::Terminate,
                Directive::EstablishSession {
                    user: "root".into(),
                    elevated: true
                }
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn failed_sudo_reports_message() {
        let state = state(Some(Identity::new("bob", false)));
        let response = call(
            &state,
            post_json(
                "/api/core/auth",
                json!({"mode": "sudo", "username": "bob", "password": "nope"}),
            ),
        )
        .await;
        assert!(directives(&response).is_empty());
        assert_eq!(
            json_body(response).await,
            json!({"success": false, "error": "Authorization failed"})
        );
    }

    #[tokio::test]
    async fn invalid_mode() {
        let state = state(None);
        let response = call(
            &state,
            post_json("/api/core/auth", json!({"mode": "magic"})),
        )
        .await;
        assert_eq!(
            json_body(response).await,
            json!({"success": false, "error": "Invalid mode"})
        );
    }

    #[tokio::test]
    async fn malformed_body_is_structured_error() {
        let state = state(None);
        let response = call(
            &state,
            post_json("/api/core/auth", json!({"username": "bob"})),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = json_body(response).await;
        assert_eq!(body["exception"], "EndpointError");
        assert!(body["message"].as_str().unwrap().contains("mode"));

        let request = Request::post("/api/send_password_reset")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from("{not json"))
            .unwrap();
        let response = call(&state, request).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await["exception"], "EndpointError");
    }

    #[tokio::test]
    async fn protected_endpoints_require_session() {
        let state = state(None);
        for uri in [
            "/api/core/sidebar",
            "/api/core/languages",
            "/api/core/session-time",
            "/api/core/navbox/x",
            "/api/core/restart-master",
        ] {
            let response = call(&state, Request::get(uri).body(Body::empty()).unwrap()).await;
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED, "{uri}");
            assert_eq!(
                json_body(response).await,
                json!({"message": "Authorization required"})
            );
        }
    }

    #[tokio::test]
    async fn expired_session_has_no_time_left() {
        let state = state(Some(Identity::new("bob", false)));
        let mut session = state.sessions.get(&state.session_key).unwrap();
        session.timestamp = unix_now() - 3601.0;
        state.sessions.insert(session);

        let response = call(
            &state,
            Request::get("/api/core/session-time")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert!(directives(&response).is_empty());
        let remaining = json_body(response).await.as_i64().unwrap();
        assert!(remaining <= 0, "{remaining}");
    }

    #[tokio::test]
    async fn session_time_refreshes_live_session() {
        let state = state(Some(Identity::new("bob", false)));
        let response = call(
            &state,
            Request::get("/api/core/session-time")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(directives(&response), [Directive::Touch]);
        let remaining = json_body(response).await.as_i64().unwrap();
        assert!((3590..=3600).contains(&remaining), "{remaining}");
    }

    #[tokio::test]
    async fn logout_and_restart_emit_directives() {
        let state = state(Some(Identity::new("bob", false)));
        let response = call(
            &state,
            Request::post("/api/core/logout").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(directives(&response), [Directive::Terminate]);

        let response = call(
            &state,
            Request::get("/api/core/restart-master")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(directives(&response), [Directive::RestartMaster]);
    }

    #[tokio::test]
    async fn password_reset_round_trip() {
        let mailer = Arc::new(CapturingMailer::default());
        let state = state_with(None, mailer.clone());

        let mut request = post_json(
            "/api/send_password_reset",
            json!({"mail": "bob@example.com"}),
        );
        request
            .headers_mut()
            .insert(header::ORIGIN, "https://panel.example".parse().unwrap());
        let response = call(&state, request).await;
        assert_eq!(response.status(), StatusCode::OK);

        let (to, link) = mailer.0.lock().unwrap().pop().unwrap();
        assert_eq!(to, "bob@example.com");
        let serial = link
            .strip_prefix("https://panel.example/view/reset_password/")
            .unwrap()
            .to_string();

        let response = call(
            &state,
            post_json("/api/check_pw_serial", json!({ "serial": serial })),
        )
        .await;
        assert_eq!(
            json_body(response).await,
            json!({"user": "bob", "email": "bob@example.com"})
        );

        let response = call(&state, post_json("/api/check_pw_serial", json!({"serial": ""}))).await;
        assert_eq!(json_body(response).await, json!(false));
    }

    #[tokio::test]
    async fn expired_reset_token_is_typed_error() {
        let state = state(None);
        let serial = state
            .signer
            .dumps_at(
                &ResetPayload {
                    user: "bob".into(),
                    email: "bob@example.com".into(),
                },
                unix_now() as u64 - 901,
            )
            .unwrap();
        let response = call(
            &state,
            post_json("/api/check_pw_serial", json!({ "serial": serial })),
        )
        .await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(json_body(response).await["exception"], "SignatureExpired");
    }

    #[tokio::test]
    async fn unknown_mail_sends_nothing() {
        let mailer = Arc::new(CapturingMailer::default());
        let state = state_with(None, mailer.clone());
        let mut request = post_json("/api/send_password_reset", json!({"mail": "eve@x"}));
        request
            .headers_mut()
            .insert(header::ORIGIN, "https://panel.example".parse().unwrap());
        assert_eq!(call(&state, request).await.status(), StatusCode::OK);
        assert!(mailer.0.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn identity_and_manifest() {
        let state = state(Some(Identity::new("bob", false)));
        let response = call(
            &state,
            Request::get("/api/core/identity").body(Body::empty()).unwrap(),
        )
        .await;
        let body = json_body(response).await;
        assert_eq!(body["identity"]["user"], "bob");
        assert_eq!(body["identity"]["elevation_allowed"], true);
        assert_eq!(body["machine"]["name"], "panel");

        let response = call(
            &state,
            Request::get("/api/core/web-manifest")
                .header("x-url-prefix", "/panel")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        let body = json_body(response).await;
        assert_eq!(body["name"], format!("panel ({})", hostname()));
        assert_eq!(body["short_name"], "panel");
        assert_eq!(body["start_url"], "/panel/#app");
        assert_eq!(
            body["icons"][0]["src"],
            "/panel/resources/core/resources/images/icon.png"
        );
    }

    #[tokio::test]
    async fn sidebar_shows_only_populated_categories() {
        let state = state(Some(Identity::new("bob", false)));
        let response = call(
            &state,
            Request::get("/api/core/sidebar").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        // Only core categories are registered and none has entries.
        assert_eq!(body["sidebar"]["children"], json!([]));
    }
}
