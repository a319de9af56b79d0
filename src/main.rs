//! termrelay - interactive shell sessions over WebSocket.
//!
//! Starts the HTTP/WebSocket server and runs until SIGINT or SIGTERM, then
//! closes connections and terminates every session within a bounded grace
//! period.

use clap::Parser as ClapParser;
use std::net::SocketAddr;
use std::path::PathBuf;
use thiserror::Error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use termrelay::{api, config::ConfigError, config::ServerConfig, shutdown};

/// termrelay - interactive shell sessions over WebSocket
///
/// Clients connect to `/ws`, start a session, and exchange JSON messages with
/// a real shell process running on this host.
#[derive(ClapParser, Debug)]
#[command(name = "termrelay", version, about, long_about = None)]
struct Cli {
    /// TOML configuration file
    #[arg(long, env = "TERMRELAY_CONFIG")]
    config: Option<PathBuf>,

    /// Address to bind the HTTP/WebSocket server [default: 127.0.0.1:3001]
    #[arg(long, env = "TERMRELAY_BIND")]
    bind: Option<SocketAddr>,

    /// Shell to spawn for new sessions (overrides $SHELL)
    #[arg(long, env = "TERMRELAY_SHELL")]
    shell: Option<String>,

    /// Initial working directory of new sessions
    #[arg(long, env = "TERMRELAY_CWD")]
    cwd: Option<PathBuf>,

    /// Maximum number of concurrent sessions
    #[arg(long, env = "TERMRELAY_MAX_SESSIONS")]
    max_sessions: Option<usize>,

    /// Idle period, in seconds, after which a session is terminated
    #[arg(long, env = "TERMRELAY_SESSION_TIMEOUT_SECS")]
    session_timeout_secs: Option<u64>,

    /// Maximum number of history entries kept per session
    #[arg(long, env = "TERMRELAY_MAX_HISTORY")]
    max_history: Option<usize>,

    /// Origin allowed by CORS (repeatable)
    #[arg(long = "allowed-origin", env = "TERMRELAY_ALLOWED_ORIGINS", value_delimiter = ',')]
    allowed_origins: Vec<String>,

    /// Requests per minute per client on rate-limited routes (0 disables)
    #[arg(long, env = "TERMRELAY_RATE_LIMIT_PER_MINUTE")]
    rate_limit_per_minute: Option<u32>,
}

impl Cli {
    /// Layer command-line and environment settings over `config`.
    fn apply(self, mut config: ServerConfig) -> ServerConfig {
        if let Some(bind) = self.bind {
            config.bind = bind;
        }
        if let Some(shell) = self.shell {
            config.terminal.shell = shell;
        }
        if let Some(cwd) = self.cwd {
            config.terminal.cwd = cwd;
        }
        if let Some(n) = self.max_sessions {
            config.terminal.max_sessions = n;
        }
        if let Some(secs) = self.session_timeout_secs {
            config.terminal.session_timeout_secs = secs;
        }
        if let Some(n) = self.max_history {
            config.terminal.max_history = n;
        }
        if !self.allowed_origins.is_empty() {
            config.allowed_origins = self.allowed_origins;
        }
        if let Some(n) = self.rate_limit_per_minute {
            config.rate_limit_per_minute = n;
        }
        config
    }
}

#[derive(Error, Debug)]
pub enum TermrelayError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("task join error: {0}")]
    TaskJoin(#[from] tokio::task::JoinError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[tokio::main]
async fn main() -> Result<(), TermrelayError> {
    let cli = Cli::parse();
    init_tracing();

    let base = match &cli.config {
        Some(path) => ServerConfig::load(path)?,
        None => ServerConfig::default(),
    };
    let config = cli.apply(base);

    let problems = config.validate();
    if !problems.is_empty() {
        for problem in &problems {
            eprintln!("termrelay: {problem}");
        }
        std::process::exit(1);
    }

    run_server(config).await
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "termrelay=info,tower_http=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn run_server(config: ServerConfig) -> Result<(), TermrelayError> {
    tracing::info!(
        shell = %config.terminal.shell,
        cwd = %config.terminal.cwd.display(),
        max_sessions = config.terminal.max_sessions,
        "termrelay starting"
    );

    let bind = config.bind;
    let grace = config.shutdown_grace();
    let state = api::AppState::new(config);
    let registry = state.registry.clone();
    let coordinator = state.shutdown.clone();
    let app = api::router(state);

    let listener = tokio::net::TcpListener::bind(bind).await?;
    tracing::info!(addr = %listener.local_addr()?, "HTTP/WS server listening");

    let (server_shutdown_tx, server_shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let http_handle = tokio::spawn(api::serve(listener, app, async move {
        server_shutdown_rx.await.ok();
    }));

    let signal = shutdown::wait_for_signal().await;
    tracing::info!(signal, "shutdown requested");

    // Stop accepting connections, signal WebSocket handlers to send close
    // frames, then terminate sessions.
    let _ = server_shutdown_tx.send(());
    let drained = coordinator.drain(&registry, grace).await;
    tokio::time::sleep(api::CLOSE_FLUSH_DELAY).await;

    if !drained {
        tracing::error!("session cleanup did not finish in time, forcing exit");
        std::process::exit(1);
    }

    match tokio::time::timeout(grace, http_handle).await {
        Ok(result) => result??,
        Err(_) => {
            tracing::error!("HTTP server did not stop in time, forcing exit");
            std::process::exit(1);
        }
    }

    tracing::info!("termrelay exiting");
    Ok(())
}
