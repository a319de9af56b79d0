//! Shell process adapter.
//!
//! Spawns a shell with piped stdio and turns its output into a stream of
//! [`OutputEvent`]s. The child handle is owned by a single monitor task; all
//! signalling goes through that task, so a signal is only ever delivered to a
//! child that has not been reaped yet.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::EffectiveSessionConfig;

/// How long the exit monitor waits for the output readers to drain after the
/// child exits. Grandchildren holding the pipes open would otherwise delay
/// the `close` event indefinitely.
const READER_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

const READ_BUF_SIZE: usize = 4096;

/// Cap on each captured stream of a one-shot execution.
pub const MAX_ONE_SHOT_OUTPUT: usize = 1024 * 1024;

#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("failed to spawn {shell}: {source}")]
    Spawn {
        shell: String,
        #[source]
        source: std::io::Error,
    },

    #[error("process stdin is closed")]
    StdinClosed,

    #[error("failed to write to process: {0}")]
    Write(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputKind {
    Stdout,
    Stderr,
    Close,
    Error,
}

/// One unit of session output, stamped when it was produced.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputEvent {
    pub kind: OutputKind,
    pub data: String,
    pub timestamp: DateTime<Utc>,
}

impl OutputEvent {
    pub fn new(kind: OutputKind, data: impl Into<String>) -> Self {
        Self {
            kind,
            data: data.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn stdout(data: impl Into<String>) -> Self {
        Self::new(OutputKind::Stdout, data)
    }

    pub fn error(data: impl Into<String>) -> Self {
        Self::new(OutputKind::Error, data)
    }

    /// The `close` event for an exit status; `None` means killed by a signal.
    pub fn exited(code: Option<i32>) -> Self {
        let code = code.map_or_else(|| "null".to_string(), |c| c.to_string());
        Self::new(OutputKind::Close, format!("Proceso terminado con código: {code}"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Signal {
    /// SIGTERM to the process group.
    Terminate,
    /// SIGKILL to the process group.
    Force,
}

/// Startup arguments for the shell families that need them.
pub fn shell_args(shell: &str) -> &'static [&'static str] {
    let stem = Path::new(shell)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(shell)
        .to_ascii_lowercase();
    match stem.as_str() {
        "powershell" | "pwsh" => &["-NoExit", "-ExecutionPolicy", "Bypass"],
        "cmd" => &["/k"],
        _ => &[],
    }
}

/// Cheap, cloneable control surface of a running shell.
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    pid: Option<u32>,
    control: mpsc::UnboundedSender<Signal>,
    exited: CancellationToken,
}

impl ProcessHandle {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn is_alive(&self) -> bool {
        !self.exited.is_cancelled()
    }

    /// Request graceful termination. No-op once the child has exited.
    pub fn terminate(&self) {
        let _ = self.control.send(Signal::Terminate);
    }

    /// Request forced termination. No-op once the child has exited.
    pub fn force_kill(&self) {
        if self.is_alive() {
            let _ = self.control.send(Signal::Force);
        }
    }

    /// Resolves once the child has exited and its `close` event was emitted.
    pub async fn exited(&self) {
        self.exited.cancelled().await;
    }
}

/// A spawned shell: its input stream plus the control handle.
#[derive(Debug)]
pub struct ShellProcess {
    handle: ProcessHandle,
    stdin: tokio::sync::Mutex<Option<ChildStdin>>,
}

impl ShellProcess {
    /// Spawn the configured shell in `cwd` and start relaying its output.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(
        config: &EffectiveSessionConfig,
        cwd: &Path,
        events: mpsc::Sender<OutputEvent>,
    ) -> Result<Self, ProcessError> {
        let mut cmd = Command::new(&config.shell);
        cmd.args(shell_args(&config.shell))
            .current_dir(cwd)
            .envs(&config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Own process group, so signals reach everything the shell started.
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|source| ProcessError::Spawn {
            shell: config.shell.clone(),
            source,
        })?;

        let pid = child.id();
        let stdin = child.stdin.take();
        let stdout = child.stdout.take().map(|out| {
            tokio::spawn(relay_output(out, OutputKind::Stdout, events.clone()))
        });
        let stderr = child.stderr.take().map(|err| {
            tokio::spawn(relay_output(err, OutputKind::Stderr, events.clone()))
        });

        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let exited = CancellationToken::new();
        tokio::spawn(monitor_child(
            child,
            pid,
            control_rx,
            [stdout, stderr],
            events,
            exited.clone(),
        ));

        tracing::debug!(?pid, shell = %config.shell, cwd = %cwd.display(), "shell spawned");

        Ok(Self {
            handle: ProcessHandle {
                pid,
                control: control_tx,
                exited,
            },
            stdin: tokio::sync::Mutex::new(stdin),
        })
    }

    pub fn handle(&self) -> &ProcessHandle {
        &self.handle
    }

    /// Write `line` followed by a newline to the shell's stdin.
    pub async fn write_line(&self, line: &str) -> Result<(), ProcessError> {
        if !self.handle.is_alive() {
            return Err(ProcessError::StdinClosed);
        }
        let mut guard = self.stdin.lock().await;
        let stdin = guard.as_mut().ok_or(ProcessError::StdinClosed)?;
        let mut data = Vec::with_capacity(line.len() + 1);
        data.extend_from_slice(line.as_bytes());
        data.push(b'\n');
        let result = async {
            stdin.write_all(&data).await?;
            stdin.flush().await
        }
        .await;
        if result.is_err() {
            // A broken pipe stays broken.
            *guard = None;
        }
        result.map_err(ProcessError::Write)
    }
}

async fn monitor_child(
    mut child: Child,
    pid: Option<u32>,
    mut control: mpsc::UnboundedReceiver<Signal>,
    readers: [Option<tokio::task::JoinHandle<()>>; 2],
    events: mpsc::Sender<OutputEvent>,
    exited: CancellationToken,
) {
    let status = loop {
        tokio::select! {
            status = child.wait() => break status,
            Some(signal) = control.recv() => deliver_signal(&mut child, pid, signal),
        }
    };

    let [mut stdout, mut stderr] = readers;
    let drain = async {
        for reader in [stdout.as_mut(), stderr.as_mut()].into_iter().flatten() {
            let _ = reader.await;
        }
    };
    if tokio::time::timeout(READER_DRAIN_TIMEOUT, drain).await.is_err() {
        tracing::debug!(?pid, "output still open after exit, dropping readers");
        for reader in [stdout, stderr].into_iter().flatten() {
            reader.abort();
        }
    }

    let event = match status {
        Ok(status) => {
            tracing::info!(?pid, code = ?status.code(), "shell exited");
            OutputEvent::exited(status.code())
        }
        Err(e) => {
            tracing::error!(?pid, ?e, "error waiting for shell");
            OutputEvent::error(format!("Error: {e}"))
        }
    };
    let _ = events.send(event).await;
    exited.cancel();
}

fn deliver_signal(child: &mut Child, pid: Option<u32>, signal: Signal) {
    #[cfg(unix)]
    if let Some(pid) = pid.filter(|p| *p != 0 && *p <= i32::MAX as u32) {
        let signo = match signal {
            Signal::Terminate => libc::SIGTERM,
            Signal::Force => libc::SIGKILL,
        };
        // SAFETY: plain syscall; the group leader is unreaped, so the id is ours.
        let rc = unsafe { libc::kill(-(pid as i32), signo) };
        if rc != 0 {
            tracing::debug!(pid, ?signal, "group signal failed, signalling child directly");
        } else {
            return;
        }
    }
    #[cfg(not(unix))]
    let _ = pid;
    if signal == Signal::Terminate {
        // start_kill has no graceful variant
        tracing::debug!(?pid, "no terminate signal available, killing shell outright");
    }
    if let Err(e) = child.start_kill() {
        tracing::warn!(?e, ?signal, "failed to kill shell");
    }
}

async fn relay_output<R>(mut reader: R, kind: OutputKind, events: mpsc::Sender<OutputEvent>)
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; READ_BUF_SIZE];
    let mut decoder = Utf8Decoder::default();
    let mut attached = true;
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                let text = decoder.decode(&buf[..n]);
                // Keep draining after the subscriber is gone so the shell never
                // blocks on a full pipe.
                if attached
                    && !text.is_empty()
                    && events.send(OutputEvent::new(kind, text)).await.is_err()
                {
                    attached = false;
                }
            }
            Err(e) => {
                tracing::debug!(?e, ?kind, "output stream error");
                break;
            }
        }
    }
    let tail = decoder.finish();
    if attached && !tail.is_empty() {
        let _ = events.send(OutputEvent::new(kind, tail)).await;
    }
}

/// Incremental UTF-8 decoder that carries split multi-byte sequences across
/// chunk boundaries. Invalid bytes decode to U+FFFD.
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    pub fn decode(&mut self, chunk: &[u8]) -> String {
        self.pending.extend_from_slice(chunk);
        let mut out = String::new();
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(s) => {
                    out.push_str(s);
                    self.pending.clear();
                    return out;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&self.pending[..valid]));
                    match e.error_len() {
                        // incomplete sequence at the end: wait for more bytes
                        None => {
                            self.pending.drain(..valid);
                            return out;
                        }
                        Some(len) => {
                            out.push('\u{FFFD}');
                            self.pending.drain(..valid + len);
                        }
                    }
                }
            }
        }
    }

    /// Flush whatever is left, replacing an unterminated sequence.
    pub fn finish(&mut self) -> String {
        let out = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        out
    }
}

/// Result of [`run_once`].
#[derive(Debug, Clone, PartialEq)]
pub struct OneShotOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    pub error: Option<String>,
}

/// Run `command` through the platform shell and collect its output.
///
/// The child is killed when `timeout` elapses.
pub async fn run_once(command: &str, cwd: &Path, timeout: Duration) -> OneShotOutput {
    let mut cmd = if cfg!(windows) {
        let mut c = Command::new("cmd");
        c.arg("/C");
        c
    } else {
        let mut c = Command::new("/bin/sh");
        c.arg("-c");
        c
    };
    cmd.arg(command)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .kill_on_drop(true);

    let output = match tokio::time::timeout(timeout, cmd.output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => {
            return OneShotOutput {
                success: false,
                stdout: String::new(),
                stderr: String::new(),
                error: Some(e.to_string()),
            }
        }
        Err(_) => {
            return OneShotOutput {
                success: false,
                stdout: String::new(),
                stderr: String::new(),
                error: Some(format!("command timed out after {}s", timeout.as_secs())),
            }
        }
    };

    let (stdout, stdout_truncated) = capped_lossy(&output.stdout);
    let (stderr, stderr_truncated) = capped_lossy(&output.stderr);
    let error = if stdout_truncated {
        Some("stdout maxBuffer length exceeded".to_string())
    } else if stderr_truncated {
        Some("stderr maxBuffer length exceeded".to_string())
    } else if !output.status.success() {
        Some(format!("command failed: {}", output.status))
    } else {
        None
    };

    OneShotOutput {
        success: error.is_none(),
        stdout,
        stderr,
        error,
    }
}

fn capped_lossy(bytes: &[u8]) -> (String, bool) {
    if bytes.len() <= MAX_ONE_SHOT_OUTPUT {
        (String::from_utf8_lossy(bytes).into_owned(), false)
    } else {
        (
            String::from_utf8_lossy(&bytes[..MAX_ONE_SHOT_OUTPUT]).into_owned(),
            true,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shell_args_by_family() {
        assert_eq!(shell_args("powershell.exe"), &["-NoExit", "-ExecutionPolicy", "Bypass"]);
        assert_eq!(shell_args("pwsh"), &["-NoExit", "-ExecutionPolicy", "Bypass"]);
        assert_eq!(shell_args("cmd.exe"), &["/k"]);
        assert!(shell_args("/bin/bash").is_empty());
        assert!(shell_args("/usr/bin/cmdtool").is_empty());
    }

    #[test]
    fn decoder_carries_split_sequences() {
        let mut d = Utf8Decoder::default();
        let bytes = "ñandú".as_bytes();
        // split inside the two-byte 'ñ'
        assert_eq!(d.decode(&bytes[..1]), "");
        assert_eq!(d.decode(&bytes[1..4]), "ña");
        assert_eq!(d.decode(&bytes[4..]), "ndú");
        assert_eq!(d.finish(), "");
    }

    #[test]
    fn decoder_replaces_invalid_bytes() {
        let mut d = Utf8Decoder::default();
        assert_eq!(d.decode(b"a\xffb"), "a\u{FFFD}b");
        assert_eq!(d.decode(&[0xE2, 0x82]), "");
        assert_eq!(d.finish(), "\u{FFFD}");
    }

    #[test]
    fn close_event_text() {
        assert_eq!(OutputEvent::exited(Some(0)).data, "Proceso terminado con código: 0");
        assert_eq!(OutputEvent::exited(None).data, "Proceso terminado con código: null");
    }

    #[cfg(unix)]
    fn sh_config() -> EffectiveSessionConfig {
        EffectiveSessionConfig {
            shell: "/bin/sh".to_string(),
            ..EffectiveSessionConfig::default()
        }
    }

    #[cfg(unix)]
    async fn next_of_kind(
        rx: &mut mpsc::Receiver<OutputEvent>,
        kind: OutputKind,
    ) -> OutputEvent {
        loop {
            let ev = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("timed out waiting for event")
                .expect("event channel closed");
            if ev.kind == kind {
                return ev;
            }
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn relays_stdout_and_stderr_separately() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, mut rx) = mpsc::channel(64);
        let proc = ShellProcess::spawn(&sh_config(), dir.path(), tx).unwrap();

        proc.write_line("echo out-line").await.unwrap();
        let ev = next_of_kind(&mut rx, OutputKind::Stdout).await;
        assert!(ev.data.contains("out-line"));

        proc.write_line("echo err-line 1>&2").await.unwrap();
        let ev = next_of_kind(&mut rx, OutputKind::Stderr).await;
        assert!(ev.data.contains("err-line"));

        proc.write_line("exit 3").await.unwrap();
        let ev = next_of_kind(&mut rx, OutputKind::Close).await;
        assert_eq!(ev.data, "Proceso terminado con código: 3");
        proc.handle().exited().await;
        assert!(!proc.handle().is_alive());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn write_after_exit_fails() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, mut rx) = mpsc::channel(64);
        let proc = ShellProcess::spawn(&sh_config(), dir.path(), tx).unwrap();
        proc.write_line("exit 0").await.unwrap();
        next_of_kind(&mut rx, OutputKind::Close).await;
        proc.handle().exited().await;

        assert!(matches!(
            proc.write_line("echo late").await,
            Err(ProcessError::StdinClosed)
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn terminate_ends_the_shell() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, mut rx) = mpsc::channel(64);
        let proc = ShellProcess::spawn(&sh_config(), dir.path(), tx).unwrap();
        assert!(proc.handle().pid().is_some());

        proc.handle().terminate();
        let ev = next_of_kind(&mut rx, OutputKind::Close).await;
        assert_eq!(ev.data, "Proceso terminado con código: null");

        // signalling an exited child is a no-op
        proc.handle().terminate();
        proc.handle().force_kill();
    }

    #[tokio::test]
    async fn spawn_failure_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, _rx) = mpsc::channel(4);
        let config = EffectiveSessionConfig {
            shell: "/no/such/shell-binary".to_string(),
            ..EffectiveSessionConfig::default()
        };
        let err = ShellProcess::spawn(&config, dir.path(), tx).unwrap_err();
        assert!(matches!(err, ProcessError::Spawn { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn run_once_collects_output() {
        let dir = tempfile::tempdir().unwrap();
        let out = run_once("echo hi; echo oops 1>&2", dir.path(), Duration::from_secs(5)).await;
        assert!(out.success);
        assert_eq!(out.stdout, "hi\n");
        assert_eq!(out.stderr, "oops\n");
        assert_eq!(out.error, None);

        let out = run_once("exit 2", dir.path(), Duration::from_secs(5)).await;
        assert!(!out.success);
        assert!(out.error.is_some());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn run_once_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let out = run_once("sleep 5", dir.path(), Duration::from_millis(100)).await;
        assert!(!out.success);
        assert!(out.error.unwrap().contains("timed out"));
    }
}
