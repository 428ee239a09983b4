//! Shared utilities for the end-to-end gateway tests.
//!
//! Each test starts the real `panel-gateway` binary against a private
//! temporary directory holding its config, users file and worker sockets.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::net::{SocketAddr, TcpListener};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

use nix::sys::signal::{kill, Signal};
use nix::unistd::{geteuid, Pid};
use panel_gateway::auth::hash_password;
use panel_gateway::auth::users::{UserEntry, UsersFile};
use panel_gateway::config::loader::save_config;
use panel_gateway::config::{BindConfig, GatewayConfig};

pub const PASSWORD: &str = "correct horse";

/// A running master process.
pub struct TestGateway {
    pub dir: tempfile::TempDir,
    pub config_path: PathBuf,
    pub addr: Option<SocketAddr>,
    pub socket: Option<PathBuf>,
    child: Option<Child>,
}

fn free_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .and_then(|l| l.local_addr())
        .map(|a| a.port())
        .unwrap()
}

fn users() -> UsersFile {
    let uid = geteuid().as_raw();
    let mut users = BTreeMap::new();
    users.insert(
        "bob".to_string(),
        UserEntry {
            password: hash_password(PASSWORD),
            email: Some("bob@example.com".into()),
            uid: Some(uid),
            sudo: true,
            ..Default::default()
        },
    );
    users.insert(
        "eve".to_string(),
        UserEntry {
            password: hash_password(PASSWORD),
            uid: Some(uid),
            ..Default::default()
        },
    );
    UsersFile { users }
}

/// Config for a gateway rooted in `dir`, listening on `bind`.
pub fn config(dir: &Path, bind: BindConfig) -> GatewayConfig {
    let mut config = GatewayConfig {
        name: "test-panel".into(),
        bind,
        ..Default::default()
    };
    config.bind.tcp_cork = false;
    config.auth.secret = "00112233445566778899aabbccddeeff".into();
    config.auth.users_file = dir.join("users.toml");
    config.auth.allow_sudo = true;
    config.auth.failure_delay_secs = 1;
    config.worker.runtime_dir = dir.join("run");
    // Only consulted when the tests run as root; keeps workers able to
    // read the temporary directory.
    config.worker.restricted_user = "root".into();
    config.gateway.vacuum_interval_secs = 1;
    config.gateway.drain_timeout_secs = 1;
    config.transport.poll_timeout_secs = 2;
    config
}

impl TestGateway {
    /// Start a gateway on a free TCP port.
    pub fn start() -> Self {
        Self::start_with(|_| {}, &[])
    }

    /// Start a TCP gateway after letting `tweak` adjust the config.
    pub fn start_with(tweak: impl FnOnce(&mut GatewayConfig), args: &[&str]) -> Self {
        let port = free_port();
        Self::launch(BindConfig::tcp("127.0.0.1", port), tweak, args)
    }

    /// Start a gateway on a UNIX socket.
    pub fn start_unix() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("gateway.sock");
        Self::launch_in(dir, BindConfig::unix(&socket), |_| {}, &[])
    }

    fn launch(bind: BindConfig, tweak: impl FnOnce(&mut GatewayConfig), args: &[&str]) -> Self {
        Self::launch_in(tempfile::tempdir().unwrap(), bind, tweak, args)
    }

    fn launch_in(
        dir: tempfile::TempDir,
        bind: BindConfig,
        tweak: impl FnOnce(&mut GatewayConfig),
        args: &[&str],
    ) -> Self {
        std::fs::set_permissions(dir.path(), std::fs::Permissions::from_mode(0o755)).unwrap();

        let mut config = config(dir.path(), bind);
        tweak(&mut config);
        let config_path = dir.path().join("config.toml");
        save_config(&config_path, &config).unwrap();
        std::fs::write(&config.auth.users_file, toml::to_string(&users()).unwrap()).unwrap();

        let child = Command::new(env!("CARGO_BIN_EXE_panel-gateway"))
            .arg("-c")
            .arg(&config_path)
            .args(args)
            .stdin(Stdio::null())
            .spawn()
            .unwrap();

        let addr = match (&config.bind.host, config.bind.port) {
            (Some(host), Some(port)) => Some(format!("{host}:{port}").parse().unwrap()),
            _ => None,
        };
        let gateway = Self {
            dir,
            config_path,
            addr,
            socket: config.bind.socket.clone(),
            child: Some(child),
        };
        gateway.wait_ready(Duration::from_secs(10));
        gateway
    }

    fn wait_ready(&self, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        loop {
            let ready = match (&self.addr, &self.socket) {
                (Some(addr), _) => std::net::TcpStream::connect(addr).is_ok(),
                (None, Some(path)) => std::os::unix::net::UnixStream::connect(path).is_ok(),
                _ => false,
            };
            if ready {
                return;
            }
            assert!(Instant::now() < deadline, "gateway did not start listening");
            std::thread::sleep(Duration::from_millis(50));
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr.expect("tcp gateway"), path)
    }

    pub fn pid(&self) -> u32 {
        self.child.as_ref().map(Child::id).unwrap_or_default()
    }

    /// Client keeping cookies, like a browser would.
    pub fn client(&self) -> reqwest::Client {
        reqwest::Client::builder()
            .cookie_store(true)
            .timeout(Duration::from_secs(15))
            .build()
            .unwrap()
    }

    /// Send `signal` to the master and wait for it to exit.
    pub fn stop_with(&mut self, signal: Signal) -> Option<ExitStatus> {
        let mut child = self.child.take()?;
        let _ = kill(Pid::from_raw(child.id() as i32), signal);
        let deadline = Instant::now() + Duration::from_secs(10);
        while Instant::now() < deadline {
            if let Ok(Some(status)) = child.try_wait() {
                return Some(status);
            }
            std::thread::sleep(Duration::from_millis(50));
        }
        let _ = child.kill();
        child.wait().ok()
    }
}

impl Drop for TestGateway {
    fn drop(&mut self) {
        self.stop_with(Signal::SIGTERM);
    }
}

/// Log in as `user` through the gateway.
pub async fn login(gateway: &TestGateway, client: &reqwest::Client, user: &str) -> serde_json::Value {
    client
        .post(gateway.url("/api/core/auth"))
        .json(&serde_json::json!({"mode": "normal", "username": user, "password": PASSWORD}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap()
}

/// Whether process `pid` still exists.
pub fn alive(pid: u32) -> bool {
    kill(Pid::from_raw(pid as i32), None).is_ok()
}
