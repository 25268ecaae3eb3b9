//! Provider child-process spawning and exit tracking.
//!
//! A spawned provider is owned by a waiter task that resolves an
//! [`ExitSignal`] when the process ends, whether it exited on its own or was
//! shut down through [`ChildProcess::shutdown`].

use std::fmt;
use std::process::ExitStatus;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;

use crate::config::ProviderConfig;

use super::errors::ProtocolError;

// ─── Constants ───────────────────────────────────────────────────────────────

/// Maximum stderr retained for diagnostics.
const STDERR_TAIL_LIMIT: usize = 2000;

/// Extra time allowed for the waiter to report after a forced kill.
const KILL_REPORT_MARGIN: Duration = Duration::from_secs(2);

// ─── Exit Signalling ─────────────────────────────────────────────────────────

/// How a provider process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    /// Exit code, or `None` when the process was terminated by a signal.
    pub code: Option<i32>,
}

impl ProcessExit {
    /// Exit with the given code.
    pub fn with_code(code: i32) -> Self {
        Self { code: Some(code) }
    }

    /// Termination by signal.
    pub fn signaled() -> Self {
        Self { code: None }
    }

    /// Whether the process exited with code 0.
    pub fn is_clean(&self) -> bool {
        self.code == Some(0)
    }
}

impl From<ExitStatus> for ProcessExit {
    fn from(status: ExitStatus) -> Self {
        Self {
            code: status.code(),
        }
    }
}

impl fmt::Display for ProcessExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "exit code {code}"),
            None => write!(f, "signal"),
        }
    }
}

/// Resolves once the provider process has exited.
#[derive(Debug, Clone)]
pub struct ExitSignal {
    rx: watch::Receiver<Option<ProcessExit>>,
}

/// Sending half of an [`ExitSignal`].
#[derive(Debug)]
pub struct ExitNotifier {
    tx: watch::Sender<Option<ProcessExit>>,
}

impl ExitSignal {
    /// Create a linked notifier/signal pair.
    pub fn channel() -> (ExitNotifier, ExitSignal) {
        let (tx, rx) = watch::channel(None);
        (ExitNotifier { tx }, ExitSignal { rx })
    }

    /// The exit, if it has already happened.
    pub fn current(&self) -> Option<ProcessExit> {
        *self.rx.borrow()
    }

    /// Wait for the exit.
    ///
    /// A notifier dropped without reporting counts as termination by signal.
    pub async fn wait(mut self) -> ProcessExit {
        loop {
            if let Some(exit) = *self.rx.borrow_and_update() {
                return exit;
            }
            if self.rx.changed().await.is_err() {
                return self.current().unwrap_or_else(ProcessExit::signaled);
            }
        }
    }
}

impl ExitNotifier {
    /// Report the exit to every signal.
    pub fn notify(&self, exit: ProcessExit) {
        self.tx.send_replace(Some(exit));
    }
}

// ─── Stderr Capture ──────────────────────────────────────────────────────────

/// Rolling tail of a provider's stderr, kept for failure diagnostics.
#[derive(Debug, Clone, Default)]
pub struct StderrTail {
    buf: Arc<Mutex<String>>,
}

impl StderrTail {
    fn push_line(&self, line: &str) {
        let mut buf = self.buf.lock().unwrap_or_else(PoisonError::into_inner);
        if !buf.is_empty() {
            buf.push('\n');
        }
        buf.push_str(line);
        if buf.len() > STDERR_TAIL_LIMIT {
            let mut cut = buf.len() - STDERR_TAIL_LIMIT;
            while !buf.is_char_boundary(cut) {
                cut += 1;
            }
            buf.drain(..cut);
        }
    }

    /// Current tail contents.
    pub fn contents(&self) -> String {
        self.buf
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Format the tail as an error-message suffix (empty string if no stderr).
    pub fn as_suffix(&self) -> String {
        let tail = self.contents();
        if tail.trim().is_empty() {
            String::new()
        } else {
            format!(" | stderr: {}", tail.trim())
        }
    }
}

/// Forward stderr lines to the log and keep the tail.
fn drain_stderr(provider_id: String, stderr: ChildStderr, tail: StderrTail) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    tracing::debug!(provider = %provider_id, stderr = %line, "provider stderr");
                    tail.push_line(&line);
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::debug!(provider = %provider_id, error = %e, "stderr read failed");
                    break;
                }
            }
        }
    })
}

// ─── ChildProcess ────────────────────────────────────────────────────────────

/// A spawned provider process, minus the stdio pipes handed to the transport.
pub struct ChildProcess {
    provider_id: String,
    pid: Option<u32>,
    shutdown_tx: Mutex<Option<oneshot::Sender<Duration>>>,
    exit: ExitSignal,
    stderr: StderrTail,
    stderr_task: Option<JoinHandle<()>>,
}

/// Pipes of a freshly spawned provider.
pub struct ProviderPipes {
    pub stdin: ChildStdin,
    pub stdout: ChildStdout,
}

impl ChildProcess {
    /// OS process id, if the process was still running when spawned.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Signal that resolves when the process exits.
    pub fn exit_signal(&self) -> ExitSignal {
        self.exit.clone()
    }

    /// Captured stderr tail.
    pub fn stderr(&self) -> &StderrTail {
        &self.stderr
    }

    /// Ask the process to exit, killing it if it has not done so within `grace`.
    ///
    /// Closing stdin first is the caller's job; this only waits and escalates.
    /// Calling it on an already-exited process returns the recorded exit.
    pub async fn shutdown(&self, grace: Duration) -> Result<ProcessExit, ProtocolError> {
        let sender = self
            .shutdown_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(tx) = sender {
            // The waiter is gone once the process has exited on its own.
            if tx.send(grace).is_err() {
                tracing::trace!(provider = %self.provider_id, "process already exited");
            }
        }

        tokio::time::timeout(grace + KILL_REPORT_MARGIN, self.exit.clone().wait())
            .await
            .map_err(|_| ProtocolError::TransportError {
                provider: self.provider_id.clone(),
                reason: format!("process did not exit within {}ms", (grace + KILL_REPORT_MARGIN).as_millis()),
            })
    }
}

impl Drop for ChildProcess {
    fn drop(&mut self) {
        if let Some(task) = self.stderr_task.take() {
            task.abort();
        }
    }
}

/// Spawn a provider process with piped stdio.
///
/// Returns the process handle and the stdin/stdout pipes for the transport.
pub fn spawn_provider(config: &ProviderConfig) -> Result<(ChildProcess, ProviderPipes), ProtocolError> {
    let mut cmd = Command::new(&config.command);
    cmd.args(&config.args);

    // Set environment variables
    for (key, value) in &config.env {
        cmd.env(key, value);
    }

    if let Some(dir) = config.cwd.as_deref() {
        cmd.current_dir(dir);
    }

    // Windows: prevent console window from appearing for child processes
    #[cfg(target_os = "windows")]
    {
        use std::os::windows::process::CommandExt;
        const CREATE_NO_WINDOW: u32 = 0x08000000;
        cmd.creation_flags(CREATE_NO_WINDOW);
    }

    cmd.stdin(std::process::Stdio::piped());
    cmd.stdout(std::process::Stdio::piped());
    cmd.stderr(std::process::Stdio::piped());
    cmd.kill_on_drop(true);

    let mut child = cmd.spawn().map_err(|e| ProtocolError::SpawnFailed {
        provider: config.id.clone(),
        reason: format!("{e}"),
    })?;

    let stdin = child.stdin.take().ok_or(ProtocolError::SpawnFailed {
        provider: config.id.clone(),
        reason: "failed to capture stdin".into(),
    })?;

    let stdout = child.stdout.take().ok_or(ProtocolError::SpawnFailed {
        provider: config.id.clone(),
        reason: "failed to capture stdout".into(),
    })?;

    let stderr = StderrTail::default();
    let stderr_task = child
        .stderr
        .take()
        .map(|pipe| drain_stderr(config.id.clone(), pipe, stderr.clone()));

    let pid = child.id();
    let (notifier, exit) = ExitSignal::channel();
    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    tokio::spawn(wait_for_exit(config.id.clone(), child, shutdown_rx, notifier));

    tracing::debug!(provider = %config.id, pid = ?pid, command = %config.command, "spawned provider process");

    Ok((
        ChildProcess {
            provider_id: config.id.clone(),
            pid,
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
            exit,
            stderr,
            stderr_task,
        },
        ProviderPipes { stdin, stdout },
    ))
}

enum Wake {
    Exited(std::io::Result<ExitStatus>),
    Shutdown(Duration),
}

/// Own the child until it exits, then report how.
async fn wait_for_exit(
    provider_id: String,
    mut child: Child,
    shutdown_rx: oneshot::Receiver<Duration>,
    notifier: ExitNotifier,
) {
    let wake = tokio::select! {
        status = child.wait() => Wake::Exited(status),
        // A dropped handle means nobody owns the provider anymore: kill now.
        grace = shutdown_rx => Wake::Shutdown(grace.unwrap_or(Duration::ZERO)),
    };

    let status = match wake {
        Wake::Exited(status) => status,
        Wake::Shutdown(grace) => match tokio::time::timeout(grace, child.wait()).await {
            Ok(status) => status,
            Err(_) => {
                tracing::debug!(provider = %provider_id, "grace period elapsed, killing provider");
                if let Err(e) = child.kill().await {
                    tracing::warn!(provider = %provider_id, error = %e, "failed to kill provider");
                }
                child.wait().await
            }
        },
    };

    let exit = match status {
        Ok(status) => ProcessExit::from(status),
        Err(e) => {
            tracing::warn!(provider = %provider_id, error = %e, "failed to reap provider process");
            ProcessExit::signaled()
        }
    };

    tracing::debug!(provider = %provider_id, exit = %exit, "provider process exited");
    notifier.notify(exit);
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_process_exit_classification() {
        assert!(ProcessExit::with_code(0).is_clean());
        assert!(!ProcessExit::with_code(1).is_clean());
        assert!(!ProcessExit::signaled().is_clean());
        assert_eq!(ProcessExit::with_code(3).to_string(), "exit code 3");
        assert_eq!(ProcessExit::signaled().to_string(), "signal");
    }

    #[tokio::test]
    async fn test_exit_signal_resolves_for_late_waiters() {
        let (notifier, signal) = ExitSignal::channel();
        assert!(signal.current().is_none());
        notifier.notify(ProcessExit::with_code(1));
        // Waiting after the fact still yields the recorded exit.
        assert_eq!(signal.clone().wait().await, ProcessExit::with_code(1));
        assert_eq!(signal.current(), Some(ProcessExit::with_code(1)));
    }

    #[tokio::test]
    async fn test_dropped_notifier_counts_as_signal() {
        let (notifier, signal) = ExitSignal::channel();
        drop(notifier);
        assert_eq!(signal.wait().await, ProcessExit::signaled());
    }

    #[test]
    fn test_stderr_tail_is_bounded() {
        let tail = StderrTail::default();
        for i in 0..500 {
            tail.push_line(&format!("line number {i}"));
        }
        let contents = tail.contents();
        assert!(contents.len() <= STDERR_TAIL_LIMIT);
        assert!(contents.ends_with("line number 499"));
        assert!(tail.as_suffix().starts_with(" | stderr: "));
    }

    #[test]
    fn test_empty_stderr_suffix() {
        assert_eq!(StderrTail::default().as_suffix(), "");
    }

    #[tokio::test]
    async fn test_spawn_missing_binary_fails() {
        let config = ProviderConfig::new("ghost", "/definitely/not/a/real/binary-xyz");
        let err = spawn_provider(&config).err().unwrap();
        assert!(matches!(err, ProtocolError::SpawnFailed { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exit_code_is_reported() {
        let mut config = ProviderConfig::new("sh", "sh");
        config.args = vec!["-c".into(), "exit 3".into()];
        let (process, _pipes) = spawn_provider(&config).unwrap();
        let exit = process.exit_signal().wait().await;
        assert_eq!(exit, ProcessExit::with_code(3));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_shutdown_kills_after_grace() {
        let mut config = ProviderConfig::new("sleeper", "sh");
        config.args = vec!["-c".into(), "sleep 30".into()];
        let (process, _pipes) = spawn_provider(&config).unwrap();
        let exit = process.shutdown(Duration::from_millis(50)).await.unwrap();
        assert!(!exit.is_clean());
    }
}
