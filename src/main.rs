//! panel-gateway
//!
//! Process and connection gateway for a web administration panel.
//!
//! # Architecture Overview
//!
//! ```text
//!                     ┌──────────────────────────── master ─────────────────────────────┐
//!                     │                                                                  │
//!   Client ──────────▶│  net::listener ──▶ gate::server ──▶ session registry             │
//!   (tcp / tls /      │                        │                  │                     │
//!    unix socket)     │                        │            worker pool                 │
//!                     │                        │                  │ spawn (lazy)        │
//!                     │     gate::transport ◀──┤                  ▼                     │
//!                     │     gate::proxy ◀──────┘        ┌──────────────────┐            │
//!                     │                                 │ worker (per      │            │
//!                     │   lifecycle: signals,           │ session, own     │            │
//!                     │   supervisor, restart           │ uid, own socket) │            │
//!                     └─────────────────────────────────┴──────────────────┴────────────┘
//! ```
//!
//! Subcommands:
//! - (none): run the master
//! - `worker`: run one worker; spawned by the master only
//! - `hash-password`: print a users-file hash for a password read from stdin

use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use tracing::Instrument;

use panel_gateway::auth::{hash_password, Identity, UsersFileProvider};
use panel_gateway::config::loader::{ensure_secret, load_config};
use panel_gateway::context::{AppContext, RunMode};
use panel_gateway::gate::{Gateway, ServeOutcome};
use panel_gateway::lifecycle::{restart, signals, Supervisor};
use panel_gateway::net::Listener;
use panel_gateway::observability::{logging, metrics};
use panel_gateway::session::SessionKey;
use panel_gateway::worker::runtime::{self, WorkerArgs};

const DEFAULT_CONFIG: &str = "/etc/panel-gateway/config.toml";

#[derive(Parser)]
#[command(name = "panel-gateway")]
#[command(about = "Process and connection gateway for a web administration panel", long_about = None)]
struct Cli {
    #[command(flatten)]
    run: RunArgs,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Args, Clone)]
struct RunArgs {
    /// Configuration file
    #[arg(short, long, global = true, default_value = DEFAULT_CONFIG)]
    config: PathBuf,

    /// Debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    /// Development mode
    #[arg(long, global = true)]
    dev: bool,

    /// Log every client in as the autologin user
    #[arg(long, global = true)]
    autologin: bool,
}

impl RunArgs {
    fn mode(&self) -> RunMode {
        RunMode {
            debug: self.debug,
            dev: self.dev,
            autologin: self.autologin,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Run a session worker (spawned by the master)
    #[command(hide = true)]
    Worker(WorkerCommand),
    /// Hash a password read from stdin for the users file
    HashPassword,
}

#[derive(Args)]
struct WorkerCommand {
    /// UNIX socket to serve on
    #[arg(long)]
    socket: PathBuf,

    /// Session key this worker serves
    #[arg(long, env = "PANEL_GATEWAY_SESSION_KEY", hide_env_values = true)]
    session_key: String,

    /// User the worker acts for; none for the restricted worker
    #[arg(long)]
    user: Option<String>,

    /// The session was obtained through elevation
    #[arg(long)]
    elevated: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        None => serve(cli.run).await,
        Some(Commands::Worker(worker)) => run_worker(cli.run, worker).await,
        Some(Commands::HashPassword) => {
            let mut password = String::new();
            std::io::stdin().lock().read_line(&mut password)?;
            println!("{}", hash_password(password.trim_end_matches(['\r', '\n'])));
            Ok(())
        }
    }
}

async fn serve(args: RunArgs) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = match load_config(&args.config) {
        Ok(config) => config,
        Err(e) => {
            logging::init("info", args.debug);
            tracing::error!(path = %args.config.display(), error = %e, "Failed to load configuration");
            std::process::exit(1);
        }
    };
    logging::init(&config.observability.log_level, args.debug);
    tracing::info!(pid = std::process::id(), "panel-gateway v{} starting", env!("CARGO_PKG_VERSION"));

    if let Err(e) = ensure_secret(&args.config, &mut config) {
        tracing::warn!(error = %e, "Could not persist generated secret");
    }

    let listener = match Listener::bind(&config.bind, &config.ssl) {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(error = %e, "Failed to bind listener");
            std::process::exit(1);
        }
    };

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let app = AppContext::new(config, args.config.clone(), args.mode());
    let auth = UsersFileProvider::from_config(&app.config.auth)?;
    let gateway = Gateway::new(app, auth)?;
    let supervisor = Arc::new(Supervisor::master(gateway.clone()));
    signals::install(Arc::clone(&supervisor))?;

    let outcome = gateway.serve(listener).await?;
    supervisor.cleanup().await;

    if outcome == ServeOutcome::RestartRequested {
        let e = restart::exec_self();
        tracing::error!(error = %e, "Restart failed");
        std::process::exit(1);
    }

    tracing::info!("Shutdown complete");
    Ok(())
}

async fn run_worker(args: RunArgs, command: WorkerCommand) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(&args.config)?;
    logging::init(&config.observability.log_level, args.debug);

    let session_key = SessionKey::from(command.session_key.as_str());
    let span = tracing::info_span!(
        "worker",
        pid = std::process::id(),
        session = %session_key,
    );
    let identity = command.user.map(|user| Identity::new(user, command.elevated));
    let app = AppContext::new(config, args.config.clone(), args.mode());

    runtime::run(
        app,
        WorkerArgs {
            socket: command.socket,
            session_key,
            identity,
        },
    )
    .instrument(span)
    .await?;
    Ok(())
}
