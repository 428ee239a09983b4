//! End-to-end tests against the real master and worker processes.

use std::time::{Duration, Instant};

use nix::sys::signal::Signal;
use reqwest::StatusCode;
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

mod common;

use common::{login, TestGateway, PASSWORD};

#[tokio::test]
async fn anonymous_requests_reach_restricted_worker() {
    let gw = TestGateway::start();
    let client = gw.client();

    let response = client.get(gw.url("/api/core/identity")).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().contains_key("x-request-id"));
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["identity"]["user"], Value::Null);
    assert_eq!(body["machine"]["name"], "test-panel");

    let response = client.get(gw.url("/api/core/sidebar")).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body, json!({"message": "Authorization required"}));
}

#[tokio::test]
async fn login_establishes_session() {
    let gw = TestGateway::start();
    let client = gw.client();

    let body = login(&gw, &client, "bob").await;
    assert_eq!(body["success"], true);

    let body: Value = client
        .get(gw.url("/api/core/identity"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["identity"]["user"], "bob");

    let response = client.get(gw.url("/api/core/sidebar")).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let remaining: i64 = client
        .get(gw.url("/api/core/session-time"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(remaining > 3500 && remaining <= 3600, "{remaining}");
}

#[tokio::test]
async fn failed_login_is_generic_and_delayed() {
    let gw = TestGateway::start();
    let client = gw.client();

    let started = Instant::now();
    let body: Value = client
        .post(gw.url("/api/core/auth"))
        .json(&json!({"mode": "normal", "username": "bob", "password": "wrong"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(started.elapsed() >= Duration::from_secs(1));
    assert_eq!(body, json!({"success": false, "error": null}));

    let response = client.get(gw.url("/api/core/sidebar")).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn failed_login_does_not_block_other_clients() {
    let gw = TestGateway::start();
    let slow = gw.client();
    let fast = gw.client();
    // Start the restricted worker before timing anything.
    fast.get(gw.url("/api/core/identity")).send().await.unwrap();

    let failing = slow
        .post(gw.url("/api/core/auth"))
        .json(&json!({"mode": "normal", "username": "bob", "password": "wrong"}))
        .send();
    let identity = async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        let started = Instant::now();
        let status = fast
            .get(gw.url("/api/core/identity"))
            .send()
            .await
            .unwrap()
            .status();
        (status, started.elapsed())
    };

    let (failed, (status, elapsed)) = tokio::join!(failing, identity);
    assert!(failed.is_ok());
    assert_eq!(status, StatusCode::OK);
    assert!(elapsed < Duration::from_millis(900), "{elapsed:?}");
}

#[tokio::test]
async fn logout_ends_session() {
    let gw = TestGateway::start();
    let client = gw.client();
    login(&gw, &client, "bob").await;

    let response = client.post(gw.url("/api/core/logout")).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let cookie = response.headers()[reqwest::header::SET_COOKIE].to_str().unwrap();
    assert!(cookie.contains("Max-Age=0"));

    let response = client.get(gw.url("/api/core/sidebar")).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn anonymous_logout_keeps_restricted_worker() {
    let gw = TestGateway::start();
    let client = gw.client();
    client.get(gw.url("/api/core/identity")).send().await.unwrap();

    let run_dir = gw.dir.path().join("run");
    let before = worker_dirs(&run_dir);
    assert_eq!(before.len(), 1);

    let response = client.post(gw.url("/api/core/logout")).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    tokio::time::sleep(Duration::from_millis(300)).await;

    let response = client.get(gw.url("/api/core/identity")).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(worker_dirs(&run_dir), before);
}

fn worker_dirs(run_dir: &std::path::Path) -> Vec<std::ffi::OsString> {
    let mut names: Vec<_> = std::fs::read_dir(run_dir)
        .unwrap()
        .map(|entry| entry.unwrap().file_name())
        .collect();
    names.sort();
    names
}

#[tokio::test]
async fn sudo_swaps_session_for_root() {
    let gw = TestGateway::start();
    let client = gw.client();
    login(&gw, &client, "bob").await;

    let body: Value = client
        .post(gw.url("/api/core/auth"))
        .json(&json!({"mode": "sudo", "username": "bob", "password": PASSWORD}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body, json!({"success": true, "username": "root"}));

    let body: Value = client
        .get(gw.url("/api/core/identity"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["identity"]["user"], "root");
}

#[tokio::test]
async fn sudo_refused_without_permission() {
    let gw = TestGateway::start();
    let client = gw.client();
    login(&gw, &client, "eve").await;

    let body: Value = client
        .post(gw.url("/api/core/auth"))
        .json(&json!({"mode": "sudo", "username": "eve", "password": PASSWORD}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["success"], false);

    let body: Value = client
        .get(gw.url("/api/core/identity"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["identity"]["user"], "eve");
}

#[tokio::test]
async fn spoofed_internal_headers_are_dropped() {
    let gw = TestGateway::start();
    let client = gw.client();

    let response = client
        .post(gw.url("/api/core/auth"))
        .header("x-gate-directive", "establish-session; user=root; elevated=1")
        .json(&json!({"mode": "normal", "username": "bob", "password": "wrong"}))
        .send()
        .await
        .unwrap();
    assert!(!response.headers().contains_key("x-gate-directive"));

    let body: Value = client
        .get(gw.url("/api/core/identity"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["identity"]["user"], Value::Null);
}

#[tokio::test]
async fn transports_are_negotiated() {
    let gw = TestGateway::start();
    let client = gw.client();

    for query in ["", "?transport=flashsocket"] {
        let response = client
            .get(gw.url(&format!("/socket.io/{query}")))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{query}");
    }

    for transport in ["xhr-polling", "jsonp-polling"] {
        let body: Value = client
            .get(gw.url(&format!("/socket.io/?transport={transport}")))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["transport"], transport);
        assert!(body["sid"].is_string());
    }
}

#[tokio::test]
async fn polling_channel_relays_frames() {
    let gw = TestGateway::start();
    let client = gw.client();
    login(&gw, &client, "bob").await;

    let handshake: Value = client
        .get(gw.url("/socket.io/?transport=xhr-polling"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let sid = handshake["sid"].as_str().unwrap().to_string();
    let channel = gw.url(&format!("/socket.io/?transport=xhr-polling&sid={sid}"));

    let response = client
        .post(&channel)
        .body(r#"{"plugin":"core","data":{"type":"identity"}}"#)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let frames: Value = client.get(&channel).send().await.unwrap().json().await.unwrap();
    assert_eq!(
        frames,
        json!([{"plugin": "core", "data": {"type": "identity", "user": "bob"}}])
    );

    // Another session may not use the channel.
    let stranger = gw.client();
    let response = stranger.get(&channel).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn jsonp_polling_wraps_frames() {
    let gw = TestGateway::start();
    let client = gw.client();

    let handshake: Value = client
        .get(gw.url("/socket.io/?transport=jsonp-polling"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let sid = handshake["sid"].as_str().unwrap();
    let channel = gw.url(&format!("/socket.io/?transport=jsonp-polling&sid={sid}&callback=cb"));

    client
        .post(&channel)
        .form(&[("d", r#"{"plugin":"core","data":{"type":"ping"}}"#)])
        .send()
        .await
        .unwrap();
    let body = client.get(&channel).send().await.unwrap().text().await.unwrap();
    let payload = body
        .strip_prefix("cb(")
        .and_then(|rest| rest.strip_suffix(");"))
        .unwrap();
    let frames: Value = serde_json::from_str(payload).unwrap();
    assert_eq!(frames, json!([{"plugin": "core", "data": {"type": "pong"}}]));
}

#[tokio::test]
async fn sigterm_cleans_up_process_tree() {
    let mut gw = TestGateway::start();
    let client = gw.client();
    login(&gw, &client, "bob").await;
    client.get(gw.url("/api/core/identity")).send().await.unwrap();

    let run_dir = gw.dir.path().join("run");
    let workers = std::fs::read_dir(&run_dir).unwrap().count();
    assert_eq!(workers, 2, "restricted and bob workers");

    let status = gw.stop_with(Signal::SIGTERM).unwrap();
    assert_eq!(status.code(), Some(0));
    assert_eq!(std::fs::read_dir(&run_dir).unwrap().count(), 0);
}

#[tokio::test]
async fn serves_on_unix_socket() {
    let mut gw = TestGateway::start_unix();
    let socket = gw.socket.clone().unwrap();

    let mut stream = tokio::net::UnixStream::connect(&socket).await.unwrap();
    stream
        .write_all(b"GET /api/core/identity HTTP/1.1\r\nHost: panel\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let mut reply = String::new();
    stream.read_to_string(&mut reply).await.unwrap();
    assert!(reply.starts_with("HTTP/1.1 200"), "{reply}");
    assert!(reply.contains("test-panel"));

    assert_eq!(gw.stop_with(Signal::SIGINT).unwrap().code(), Some(0));
    assert!(!socket.exists());
}

#[tokio::test]
async fn bind_failure_exits_with_status_one() {
    let holder = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = holder.local_addr().unwrap().port();

    let dir = tempfile::tempdir().unwrap();
    let config = common::config(
        dir.path(),
        panel_gateway::config::BindConfig::tcp("127.0.0.1", port),
    );
    let path = dir.path().join("config.toml");
    panel_gateway::config::loader::save_config(&path, &config).unwrap();

    let status = tokio::process::Command::new(env!("CARGO_BIN_EXE_panel-gateway"))
        .arg("-c")
        .arg(&path)
        .status()
        .await
        .unwrap();
    assert_eq!(status.code(), Some(1));
}

#[tokio::test]
async fn websocket_frames_reach_worker() {
    use futures_util::{SinkExt, StreamExt};
    use tokio_tungstenite::tungstenite::Message;

    let gw = TestGateway::start();
    let url = format!(
        "ws://{}/socket.io/?transport=websocket",
        gw.addr.unwrap()
    );
    let (mut ws, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();

    ws.send(Message::Text(
        r#"{"plugin":"core","data":{"type":"ping"}}"#.into(),
    ))
    .await
    .unwrap();
    let reply = tokio::time::timeout(Duration::from_secs(5), ws.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    let reply: Value = serde_json::from_str(reply.to_text().unwrap()).unwrap();
    assert_eq!(reply, json!({"plugin": "core", "data": {"type": "pong"}}));
    ws.close(None).await.unwrap();
}

#[tokio::test]
async fn restart_request_reexecs_master() {
    let gw = TestGateway::start_with(|_| {}, &["-d"]);
    let pid = gw.pid();
    let client = gw.client();
    login(&gw, &client, "bob").await;

    let response = client
        .get(gw.url("/api/core/restart-master"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // The old session dies with the old image.
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        assert!(Instant::now() < deadline, "gateway did not come back");
        tokio::time::sleep(Duration::from_millis(100)).await;
        let Ok(response) = client.get(gw.url("/api/core/identity")).send().await else {
            continue;
        };
        let Ok(body) = response.json::<Value>().await else {
            continue;
        };
        if body["identity"]["user"].is_null() {
            break;
        }
    }

    assert!(common::alive(pid));
    let cmdline = std::fs::read(format!("/proc/{pid}/cmdline")).unwrap();
    let args: Vec<&[u8]> = cmdline.split(|b| *b == 0).collect();
    assert!(args.contains(&&b"-c"[..]));
    assert!(!args.contains(&&b"-d"[..]));

    let response = client.get(gw.url("/api/core/sidebar")).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

struct TestCerts {
    _dir: tempfile::TempDir,
    ca: String,
    server: std::path::PathBuf,
}

/// A CA and a `localhost` certificate it signed; the server PEM holds
/// both certificate and key.
fn certificates() -> TestCerts {
    use rcgen::{BasicConstraints, CertificateParams, DnType, IsCa, KeyPair};

    let mut ca_params = CertificateParams::new(Vec::<String>::new()).unwrap();
    ca_params.distinguished_name.push(DnType::CommonName, "Panel Test CA");
    ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    let ca_key = KeyPair::generate().unwrap();
    let ca_cert = ca_params.self_signed(&ca_key).unwrap();

    let params = CertificateParams::new(vec!["localhost".to_string()]).unwrap();
    let key = KeyPair::generate().unwrap();
    let cert = params.signed_by(&key, &ca_cert, &ca_key).unwrap();

    let dir = tempfile::tempdir().unwrap();
    let server = dir.path().join("panel.pem");
    std::fs::write(&server, format!("{}{}", cert.pem(), key.serialize_pem())).unwrap();
    TestCerts {
        _dir: dir,
        ca: ca_cert.pem(),
        server,
    }
}

fn tls_client(gw: &TestGateway, ca: &str) -> reqwest::Client {
    reqwest::Client::builder()
        .add_root_certificate(reqwest::Certificate::from_pem(ca.as_bytes()).unwrap())
        .resolve("localhost", gw.addr.unwrap())
        .timeout(Duration::from_secs(15))
        .build()
        .unwrap()
}

fn https_url(gw: &TestGateway, path: &str) -> String {
    format!("https://localhost:{}{}", gw.addr.unwrap().port(), path)
}

#[tokio::test]
async fn serves_over_tls() {
    let certs = certificates();
    let server = certs.server.clone();
    let gw = TestGateway::start_with(
        move |config| {
            config.ssl.enable = true;
            config.ssl.certificate = Some(server);
        },
        &[],
    );
    let client = tls_client(&gw, &certs.ca);

    let response = client
        .get(https_url(&gw, "/api/core/identity"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["machine"]["name"], "test-panel");

    // Plain HTTP is not spoken on a TLS socket.
    assert!(gw.client().get(gw.url("/api/core/identity")).send().await.is_err());
}

#[tokio::test]
async fn forced_client_auth_rejects_anonymous_clients() {
    let certs = certificates();
    let server = certs.server.clone();
    let gw = TestGateway::start_with(
        move |config| {
            config.ssl.enable = true;
            config.ssl.certificate = Some(server);
            config.ssl.client_auth.enable = true;
            config.ssl.client_auth.force = true;
        },
        &[],
    );
    let client = tls_client(&gw, &certs.ca);

    let result = client
        .get(https_url(&gw, "/api/core/identity"))
        .send()
        .await;
    assert!(result.is_err());
}
