use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::EffectiveSessionConfig;
use crate::process::{OutputEvent, ProcessError, ProcessHandle, ShellProcess};
use crate::protocol::iso_timestamp;
use crate::validator::{CommandValidator, ValidationError};

/// Delay before the synthetic "ready" banner is emitted after spawn.
pub const READY_BANNER_DELAY: Duration = Duration::from_secs(1);

/// Capacity of the per-session output channel. Readers wait when it is full,
/// which stalls the shell on its own pipe rather than buffering without bound.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Starting,
    Active,
    Closing,
    Closed,
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("No hay sesión activa")]
    NotActive,

    #[error("La sesión ya fue iniciada")]
    AlreadyStarted,

    #[error("Directorio no encontrado")]
    DirectoryNotFound,

    #[error("No se pudo iniciar la sesión de terminal")]
    Spawn(#[source] ProcessError),

    #[error("Error ejecutando comando: {0}")]
    Write(#[source] ProcessError),
}

/// One executed command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub command: String,
    pub timestamp: String,
    pub cwd: String,
}

/// FIFO ring of the most recent commands.
#[derive(Debug, Clone)]
pub struct History {
    entries: VecDeque<HistoryEntry>,
    cap: usize,
}

impl History {
    pub fn new(cap: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(cap.min(1024)),
            cap,
        }
    }

    /// Append, evicting the oldest entries beyond the cap.
    pub fn push(&mut self, entry: HistoryEntry) {
        self.entries.push_back(entry);
        while self.entries.len() > self.cap {
            self.entries.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn to_vec(&self) -> Vec<HistoryEntry> {
        self.entries.iter().cloned().collect()
    }
}

/// Diagnostic view of a session.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub id: String,
    pub is_active: bool,
    pub state: SessionState,
    pub pid: Option<u32>,
    pub created_at: String,
    pub last_activity: String,
    pub current_dir: String,
}

struct Metadata {
    working_directory: PathBuf,
    last_activity: DateTime<Utc>,
    history: History,
}

struct SessionInner {
    id: String,
    config: EffectiveSessionConfig,
    validator: CommandValidator,
    created_at: DateTime<Utc>,
    state: Mutex<SessionState>,
    meta: Mutex<Metadata>,
    process: OnceLock<ShellProcess>,
    events: mpsc::Sender<OutputEvent>,
    idle_deadline: watch::Sender<Instant>,
    /// Cancelled when the session reaches `Closed`.
    closed: CancellationToken,
    /// Child of `closed`; cancelled early by `kill()`.
    idle_cancel: CancellationToken,
}

/// A client-facing session bound to exactly one shell process.
///
/// Cloning yields another handle to the same session.
#[derive(Clone)]
pub struct TerminalSession {
    inner: Arc<SessionInner>,
}

impl std::fmt::Debug for TerminalSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TerminalSession")
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl TerminalSession {
    /// Create a session in the `Starting` state that publishes into `events`.
    pub fn new(id: String, config: EffectiveSessionConfig, events: mpsc::Sender<OutputEvent>) -> Self {
        let closed = CancellationToken::new();
        let idle_cancel = closed.child_token();
        let now = Utc::now();
        let meta = Metadata {
            working_directory: config.cwd.clone(),
            last_activity: now,
            history: History::new(config.max_history),
        };
        Self {
            inner: Arc::new(SessionInner {
                id,
                validator: CommandValidator::new(),
                created_at: now,
                state: Mutex::new(SessionState::Starting),
                meta: Mutex::new(meta),
                process: OnceLock::new(),
                events,
                idle_deadline: watch::channel(Instant::now() + config.idle_timeout).0,
                closed,
                idle_cancel,
                config,
            }),
        }
    }

    /// Create a session together with the receiving end of its event stream.
    pub fn with_channel(
        id: String,
        config: EffectiveSessionConfig,
    ) -> (Self, mpsc::Receiver<OutputEvent>) {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        (Self::new(id, config, tx), rx)
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn config(&self) -> &EffectiveSessionConfig {
        &self.inner.config
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state.lock()
    }

    pub fn is_active(&self) -> bool {
        self.state() == SessionState::Active
    }

    pub fn pid(&self) -> Option<u32> {
        self.inner.process.get().and_then(|p| p.handle().pid())
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.inner.created_at
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        self.inner.meta.lock().last_activity
    }

    pub fn working_directory(&self) -> PathBuf {
        self.inner.meta.lock().working_directory.clone()
    }

    pub fn history(&self) -> Vec<HistoryEntry> {
        self.inner.meta.lock().history.to_vec()
    }

    /// True if both handles refer to the same session.
    pub fn same_as(&self, other: &TerminalSession) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Resolves once the session is `Closed`.
    pub async fn closed(&self) {
        self.inner.closed.cancelled().await;
    }

    pub fn summary(&self) -> SessionSummary {
        let meta = self.inner.meta.lock();
        SessionSummary {
            id: self.inner.id.clone(),
            is_active: self.is_active(),
            state: self.state(),
            pid: self.pid(),
            created_at: iso_timestamp(self.inner.created_at),
            last_activity: iso_timestamp(meta.last_activity),
            current_dir: meta.working_directory.display().to_string(),
        }
    }

    /// Spawn the shell and begin relaying its output.
    ///
    /// On failure the session is left `Closed` and the error returned.
    pub fn start(&self) -> Result<(), SessionError> {
        if self.state() != SessionState::Starting {
            return Err(SessionError::AlreadyStarted);
        }

        let cwd = self.working_directory();
        let process = match ShellProcess::spawn(&self.inner.config, &cwd, self.inner.events.clone()) {
            Ok(p) => p,
            Err(e) => {
                tracing::error!(session = %self.inner.id, error = %e, "failed to start terminal");
                *self.inner.state.lock() = SessionState::Closed;
                self.inner.closed.cancel();
                return Err(SessionError::Spawn(e));
            }
        };
        self.attach(process, &cwd)
    }

    /// Bind a freshly spawned shell and arm the session's timers.
    ///
    /// If `kill()` won the race while the shell was spawning, the shell is
    /// terminated here and `NotActive` returned.
    fn attach(&self, process: ShellProcess, cwd: &Path) -> Result<(), SessionError> {
        let handle = process.handle().clone();
        {
            let mut state = self.inner.state.lock();
            if *state != SessionState::Starting {
                drop(state);
                tracing::warn!(
                    session = %self.inner.id,
                    pid = ?handle.pid(),
                    "session killed while starting, terminating shell"
                );
                handle.terminate();
                force_kill_after(handle, self.inner.config.kill_grace, self.inner.id.clone());
                return Err(SessionError::NotActive);
            }
            // set before leaving Starting so kill() always finds the process
            let _ = self.inner.process.set(process);
            *state = SessionState::Active;
        }
        tracing::info!(
            session = %self.inner.id,
            pid = ?handle.pid(),
            shell = %self.inner.config.shell,
            cwd = %cwd.display(),
            "terminal session started"
        );

        self.rearm_idle_timer();
        tokio::spawn(run_idle_timer(
            Arc::downgrade(&self.inner),
            self.inner.idle_deadline.subscribe(),
            self.inner.idle_cancel.clone(),
        ));
        tokio::spawn(watch_exit(Arc::downgrade(&self.inner), handle));

        let events = self.inner.events.clone();
        let closed = self.inner.closed.clone();
        let banner = format!("Terminal iniciada en: {}\n", cwd.display());
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(READY_BANNER_DELAY) => {
                    let _ = events.try_send(OutputEvent::stdout(banner));
                }
                _ = closed.cancelled() => {}
            }
        });

        Ok(())
    }

    /// Validate `raw` and write it to the shell.
    ///
    /// Failures are returned, not published; the caller owes the client a reply.
    pub async fn execute_command(&self, raw: &str) -> Result<(), SessionError> {
        let process = match (self.state(), self.inner.process.get()) {
            (SessionState::Active, Some(p)) => p,
            _ => {
                tracing::warn!(session = %self.inner.id, "cannot execute command: session is not active");
                return Err(SessionError::NotActive);
            }
        };

        if let Err(reason) = self.inner.validator.validate(raw) {
            tracing::debug!(session = %self.inner.id, %reason, "command rejected");
            return Err(reason.into());
        }

        self.rearm_idle_timer();
        {
            let mut meta = self.inner.meta.lock();
            let now = Utc::now();
            meta.last_activity = now;
            let cwd = meta.working_directory.display().to_string();
            meta.history.push(HistoryEntry {
                command: raw.to_string(),
                timestamp: iso_timestamp(now),
                cwd,
            });
        }

        match process.write_line(raw).await {
            Ok(()) => {
                tracing::debug!(session = %self.inner.id, command = %raw, "command executed");
                Ok(())
            }
            Err(e) => {
                tracing::error!(session = %self.inner.id, error = %e, "error executing command");
                Err(SessionError::Write(e))
            }
        }
    }

    /// Change the stored working directory.
    ///
    /// This is session metadata only: it sets the directory recorded in
    /// history and used for future spawns, and never issues `cd` to the shell.
    /// Relative paths resolve against the current stored directory.
    pub fn change_directory(&self, path: &str) -> Result<PathBuf, SessionError> {
        let mut meta = self.inner.meta.lock();
        let candidate = resolve_directory(&meta.working_directory, path);
        if !candidate.is_dir() {
            return Err(SessionError::DirectoryNotFound);
        }
        meta.working_directory = candidate.clone();
        Ok(candidate)
    }

    /// Two-phase termination: graceful signal now, forced after the grace period.
    ///
    /// Idempotent; calling it on a closing or closed session does nothing.
    pub fn kill(&self) {
        self.inner.idle_cancel.cancel();

        let previous = {
            let mut state = self.inner.state.lock();
            let previous = *state;
            match previous {
                SessionState::Starting => *state = SessionState::Closed,
                SessionState::Active => *state = SessionState::Closing,
                SessionState::Closing | SessionState::Closed => {}
            }
            previous
        };

        match previous {
            SessionState::Starting => {
                self.inner.closed.cancel();
            }
            SessionState::Active => {
                let Some(handle) = self.inner.process.get().map(|p| p.handle().clone()) else {
                    self.inner.closed.cancel();
                    return;
                };
                tracing::info!(session = %self.inner.id, pid = ?handle.pid(), "terminating session");
                handle.terminate();
                force_kill_after(handle, self.inner.config.kill_grace, self.inner.id.clone());
            }
            SessionState::Closing | SessionState::Closed => {}
        }
    }

    fn rearm_idle_timer(&self) {
        self.inner
            .idle_deadline
            .send_replace(Instant::now() + self.inner.config.idle_timeout);
    }
}

/// Escalate to a forced kill if the shell outlives `grace`.
fn force_kill_after(handle: ProcessHandle, grace: Duration, id: String) {
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::time::sleep(grace) => {
                if handle.is_alive() {
                    tracing::warn!(session = %id, "shell ignored termination, forcing kill");
                    handle.force_kill();
                }
            }
            _ = handle.exited() => {}
        }
    });
}

fn resolve_directory(current: &Path, requested: &str) -> PathBuf {
    let requested = Path::new(requested);
    if requested.is_absolute() {
        requested.to_path_buf()
    } else {
        current.join(requested)
    }
}

/// Single idle timer per session. Rearming replaces the deadline in the
/// watch channel; the loop always sleeps toward the latest one.
async fn run_idle_timer(
    session: Weak<SessionInner>,
    mut deadline: watch::Receiver<Instant>,
    cancel: CancellationToken,
) {
    loop {
        let current = *deadline.borrow_and_update();
        tokio::select! {
            _ = cancel.cancelled() => return,
            changed = deadline.changed() => {
                if changed.is_err() {
                    return;
                }
            }
            _ = tokio::time::sleep_until(current) => {
                if *deadline.borrow() > current {
                    continue;
                }
                if let Some(inner) = session.upgrade() {
                    let session = TerminalSession { inner };
                    tracing::warn!(session = %session.id(), "session auto-cleaned due to inactivity");
                    session.kill();
                }
                return;
            }
        }
    }
}

/// Move the session to `Closed` once its shell is gone.
async fn watch_exit(session: Weak<SessionInner>, process: ProcessHandle) {
    process.exited().await;
    if let Some(inner) = session.upgrade() {
        *inner.state.lock() = SessionState::Closed;
        inner.closed.cancel();
        tracing::debug!(session = %inner.id, "session closed");
    }
}
