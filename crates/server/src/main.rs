//! OrbitDock Server
//!
//! Control plane for long-running AI coding agent sessions. Clients observe
//! and drive sessions in real time over a WebSocket protocol with
//! revision-based replay; every state transition is persisted through a
//! batched asynchronous writer.

mod auth;
mod cmd_init;
mod cmd_install_hooks;
mod cmd_install_service;
mod cmd_status;
mod event_log;
mod git;
mod hooks;
mod logging;
mod migration_runner;
mod paths;
mod persistence;
mod registry;
#[cfg(test)]
mod scenarios;
mod session;
mod session_actor;
mod session_command;
mod session_naming;
mod transition;
mod util;
mod websocket;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use orbitdock_connector_core::NullConnector;

use crate::logging::init_logging;
use crate::persistence::{create_persistence_channel, PersistCommand, PersistenceWriter};
use crate::registry::SessionRegistry;

/// Server version, baked in at compile time.
pub(crate) const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Ended sessions are evicted from the registry after this long.
const EVICTION_GRACE: Duration = Duration::from_secs(30 * 60);
/// How often the eviction sweep runs.
const EVICTION_INTERVAL: Duration = Duration::from_secs(5 * 60);
/// Pending hook sessions that never materialize expire after this long.
const PENDING_HOOK_TTL: Duration = Duration::from_secs(60);

#[derive(Parser, Debug)]
#[command(
    name = "orbitdock-server",
    about = "OrbitDock server — control plane for AI coding agent sessions",
    version = VERSION,
)]
struct Cli {
    /// Data directory (default: ~/.orbitdock)
    #[arg(long, global = true, env = "ORBITDOCK_DATA_DIR")]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the server (default when no subcommand given)
    Start {
        /// Bind address (e.g. 0.0.0.0:4000 for remote access)
        #[arg(long, default_value = "127.0.0.1:4000", env = "ORBITDOCK_BIND_ADDR")]
        bind: SocketAddr,

        /// Auth token (requests must include `Authorization: Bearer <token>`)
        #[arg(long, env = "ORBITDOCK_AUTH_TOKEN")]
        auth_token: Option<String>,
    },

    /// Bootstrap a fresh machine (create dirs, run migrations, install hook script)
    Init {
        /// Server URL the hook script will POST to
        #[arg(long, default_value = "http://127.0.0.1:4000")]
        server_url: String,
    },

    /// Install Claude Code hooks into ~/.claude/settings.json
    InstallHooks {
        /// Path to settings.json (default: ~/.claude/settings.json)
        #[arg(long)]
        settings_path: Option<PathBuf>,
    },

    /// Generate and install a launchd/systemd service file
    InstallService {
        /// Bind address for the service
        #[arg(long, default_value = "127.0.0.1:4000")]
        bind: SocketAddr,

        /// Enable the service immediately after installing
        #[arg(long)]
        enable: bool,
    },

    /// Check if the server is running
    Status,

    /// Generate a random auth token and write it to data_dir/auth-token
    GenerateToken,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Resolve the data dir before anything touches the filesystem.
    let data_dir = paths::init_data_dir(cli.data_dir.as_deref());

    match cli.command {
        Some(Command::Init { server_url }) => cmd_init::run(&data_dir, &server_url),
        Some(Command::InstallHooks { settings_path }) => {
            cmd_install_hooks::run(settings_path.as_deref())
        }
        Some(Command::InstallService { bind, enable }) => {
            cmd_install_service::run(&data_dir, bind, enable)
        }
        Some(Command::Status) => cmd_status::run(&data_dir),
        Some(Command::GenerateToken) => cmd_status::generate_token(&data_dir),
        Some(Command::Start { bind, auth_token }) => serve(bind, auth_token),
        None => serve("127.0.0.1:4000".parse()?, None),
    }
}

fn serve(bind_addr: SocketAddr, auth_token: Option<String>) -> anyhow::Result<()> {
    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async_main(bind_addr, auth_token))
}

async fn async_main(bind_addr: SocketAddr, auth_token: Option<String>) -> anyhow::Result<()> {
    paths::ensure_dirs()?;

    let logging = init_logging()?;
    let run_id = logging.run_id.clone();
    let _log_guard = logging.guard;
    let root_span =
        tracing::info_span!("orbitdock_server", service = "orbitdock-server", run_id = %run_id);
    let _root_span_guard = root_span.enter();

    info!(
        component = "server",
        event = "server.starting",
        run_id = %run_id,
        version = VERSION,
        pid = std::process::id(),
        data_dir = %paths::data_dir().display(),
        "Starting OrbitDock Server..."
    );

    // Migrations are fatal: never run against an unknown schema.
    let db_path = paths::db_path();
    {
        let mut conn = rusqlite::Connection::open(&db_path)?;
        migration_runner::run_migrations(&mut conn)?;
    }

    // The writer must be up before anything produces persist commands.
    let (persist_tx, persist_rx) = create_persistence_channel();
    tokio::spawn(PersistenceWriter::new(persist_rx, db_path.clone()).run());

    let state = Arc::new(SessionRegistry::new(persist_tx.clone()));

    // Restore active sessions before the gateway accepts connections.
    // Everything comes back observed-only; live connectors are attached on
    // resume or by the hook bridge.
    match persistence::load_sessions_for_startup(db_path).await {
        Ok(restored) if !restored.is_empty() => {
            info!(
                component = "restore",
                event = "restore.start",
                session_count = restored.len(),
                "Restoring sessions from storage"
            );
            for rs in restored {
                let session = websocket::restored_to_state(&rs);
                let msg_count = session.messages.len();
                let (connector, _event_tx) = NullConnector::spawn(CancellationToken::new());
                let handle = state.spawn_session(session, connector).await;
                info!(
                    component = "restore",
                    event = "restore.session.registered",
                    session_id = %handle.id,
                    messages = msg_count,
                    "Registered session"
                );
            }
        }
        Ok(_) => {
            info!(
                component = "restore",
                event = "restore.empty",
                "No sessions to restore"
            );
        }
        Err(e) => {
            warn!(
                component = "restore",
                event = "restore.failed",
                error = %e,
                "Failed to load sessions for restoration"
            );
        }
    }

    // Grace-period eviction of ended sessions.
    let sweep_state = state.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(EVICTION_INTERVAL);
        interval.tick().await;
        loop {
            interval.tick().await;
            sweep_state.sweep_ended(EVICTION_GRACE);
        }
    });

    // Expiry for pending hook sessions that never materialize.
    let expiry_state = state.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(30));
        loop {
            interval.tick().await;
            expiry_state.expire_pending_hooks(PENDING_HOOK_TTL);
        }
    });

    let shutdown_state = state.clone();
    let shutdown_persist = persist_tx.clone();

    // The auth-token file arms authentication even without --auth-token.
    let auth_token = auth_token.or_else(auth::load_token_file);

    let mut app = Router::new()
        .route("/ws", get(websocket::ws_handler))
        .route("/api/hook", post(hooks::hook_handler))
        .route("/health", get(health_handler));

    if let Some(ref token) = auth_token {
        app = app.layer(axum::middleware::from_fn_with_state(
            token.clone(),
            auth::auth_middleware,
        ));
    }

    let app = app
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(bind_addr).await?;

    info!(
        component = "server",
        event = "server.listening",
        bind_address = %bind_addr,
        auth = auth_token.is_some(),
        "Listening for connections"
    );

    // PID file only after a successful bind.
    write_pid_file();

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown_state, shutdown_persist))
        .await?;

    Ok(())
}

fn write_pid_file() {
    let pid_path = paths::pid_file_path();
    if let Err(e) = std::fs::write(&pid_path, std::process::id().to_string()) {
        warn!(
            component = "server",
            event = "server.pid_file.write_error",
            path = %pid_path.display(),
            error = %e,
            "Failed to write PID file"
        );
    }
}

fn remove_pid_file() {
    let _ = std::fs::remove_file(paths::pid_file_path());
}

/// Wait for ctrl-c, then drain every actor and flush persistence.
async fn shutdown_signal(state: Arc<SessionRegistry>, _persist_tx: mpsc::Sender<PersistCommand>) {
    let _ = tokio::signal::ctrl_c().await;
    info!(
        component = "server",
        event = "server.shutdown",
        "Shutdown signal received, draining session actors"
    );

    state.shutdown().await;

    // Give the persistence writer a window to flush the final checkpoints.
    tokio::time::sleep(Duration::from_millis(200)).await;

    remove_pid_file();
}

async fn health_handler() -> impl IntoResponse {
    serde_json::json!({
        "status": "ok",
        "version": VERSION,
    })
    .to_string()
}
