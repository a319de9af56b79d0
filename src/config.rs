use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Defaults applied to every terminal session, overridable per session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Shell executable.
    pub shell: String,
    /// Initial working directory of spawned shells.
    pub cwd: PathBuf,
    /// Extra environment variables layered over the inherited environment.
    pub env: HashMap<String, String>,
    /// Idle period after which a session terminates itself.
    pub session_timeout_secs: u64,
    /// Maximum number of retained history entries.
    pub max_history: usize,
    /// Maximum number of concurrently registered sessions (server-wide).
    pub max_sessions: usize,
    /// Wait between the graceful and the forced termination signal.
    pub kill_grace_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            shell: default_shell(),
            cwd: default_cwd(),
            env: HashMap::new(),
            session_timeout_secs: 30 * 60,
            max_history: 100,
            max_sessions: 10,
            kill_grace_secs: 5,
        }
    }
}

impl SessionConfig {
    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_secs)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_secs(self.kill_grace_secs)
    }

    /// Merge client-supplied overrides over these defaults.
    pub fn merged(&self, overrides: Option<&SessionOverrides>) -> EffectiveSessionConfig {
        let mut effective = EffectiveSessionConfig {
            shell: self.shell.clone(),
            cwd: self.cwd.clone(),
            env: self.env.clone(),
            idle_timeout: self.session_timeout(),
            max_history: self.max_history,
            kill_grace: self.kill_grace(),
        };
        let Some(o) = overrides else {
            return effective;
        };
        if let Some(shell) = o.shell.as_ref().filter(|s| !s.trim().is_empty()) {
            effective.shell = shell.clone();
        }
        if let Some(cwd) = &o.cwd {
            effective.cwd = PathBuf::from(cwd);
        }
        if let Some(env) = &o.env {
            effective.env.extend(env.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        if let Some(ms) = o.session_timeout.filter(|ms| *ms > 0) {
            effective.idle_timeout = Duration::from_millis(ms);
        }
        if let Some(max) = o.max_history_size.filter(|n| *n > 0) {
            effective.max_history = max;
        }
        effective
    }
}

/// Per-session configuration as received in `start_session`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionOverrides {
    pub shell: Option<String>,
    pub cwd: Option<String>,
    pub env: Option<HashMap<String, String>>,
    /// Milliseconds.
    pub session_timeout: Option<u64>,
    pub max_history_size: Option<usize>,
}

/// Fully resolved configuration a single session runs with.
#[derive(Debug, Clone, PartialEq)]
pub struct EffectiveSessionConfig {
    pub shell: String,
    pub cwd: PathBuf,
    pub env: HashMap<String, String>,
    pub idle_timeout: Duration,
    pub max_history: usize,
    pub kill_grace: Duration,
}

impl Default for EffectiveSessionConfig {
    fn default() -> Self {
        SessionConfig::default().merged(None)
    }
}

/// Top-level server configuration, loaded from TOML.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: SocketAddr,
    /// Origins allowed by CORS. CORS is disabled when empty.
    pub allowed_origins: Vec<String>,
    /// Requests per minute per client IP on rate-limited routes. 0 disables.
    pub rate_limit_per_minute: u32,
    /// Upper bound on session cleanup during shutdown.
    pub shutdown_grace_secs: u64,
    pub terminal: SessionConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 3001)),
            allowed_origins: vec![],
            rate_limit_per_minute: 30,
            shutdown_grace_secs: 10,
            terminal: SessionConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Load config from a TOML file path.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        toml::from_str(&contents).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    /// Return every problem found; empty means the config is usable.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        let t = &self.terminal;
        if t.shell.trim().is_empty() {
            errors.push("terminal.shell must not be empty".to_string());
        }
        if !t.cwd.is_dir() {
            errors.push(format!("terminal.cwd does not exist: {}", t.cwd.display()));
        }
        if t.max_sessions == 0 {
            errors.push("terminal.max_sessions must be greater than 0".to_string());
        }
        if t.session_timeout_secs == 0 {
            errors.push("terminal.session_timeout_secs must be greater than 0".to_string());
        }
        if t.max_history == 0 {
            errors.push("terminal.max_history must be greater than 0".to_string());
        }
        errors
    }
}

/// Errors that can occur when loading config.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {}: {}", .0.display(), .1)]
    ReadFailed(PathBuf, #[source] std::io::Error),

    #[error("failed to parse config {}: {}", .0.display(), .1)]
    ParseFailed(PathBuf, #[source] toml::de::Error),
}

/// `$SHELL` (or `/bin/sh`) on Unix, PowerShell on Windows.
pub fn default_shell() -> String {
    if cfg!(windows) {
        "powershell.exe".to_string()
    } else {
        std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string())
    }
}

fn default_cwd() -> PathBuf {
    dirs::home_dir()
        .or_else(|| std::env::current_dir().ok())
        .unwrap_or_else(|| PathBuf::from("."))
}
