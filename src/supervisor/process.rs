//! Transcoder process handle
//!
//! Spawning a process starts two tracked tasks: one owns the child and
//! publishes its exit status, the other drains stderr into the log. An
//! undrained stderr pipe eventually fills and stalls ffmpeg, so the drain
//! runs for the whole life of the process.

use std::fmt;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, Command};
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::error::{Error, Result};
use crate::registry::StreamKey;

/// How a transcoder process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    /// Exit status, if the wait itself succeeded
    pub status: Option<ExitStatus>,
    /// Whether we killed it
    pub killed: bool,
}

impl ProcessExit {
    /// Whether the process ended cleanly on its own
    pub fn success(&self) -> bool {
        !self.killed && self.status.is_some_and(|s| s.success())
    }
}

impl fmt::Display for ProcessExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.status, self.killed) {
            (_, true) => write!(f, "killed"),
            (Some(status), false) => write!(f, "{}", status),
            (None, false) => write!(f, "unknown status"),
        }
    }
}

/// Handle to one running transcoder
pub struct ProcessHandle {
    key: StreamKey,
    pid: Option<u32>,
    stdin: Mutex<Option<ChildStdin>>,
    exit: watch::Receiver<Option<ProcessExit>>,
    kill: CancellationToken,
}

impl ProcessHandle {
    /// Spawn a command and start monitoring it
    ///
    /// Stdio is overridden: stdin is kept for graceful shutdown, stdout is
    /// discarded, stderr is drained into the log until EOF or until `token`
    /// is cancelled.
    pub fn spawn(
        mut command: Command,
        key: StreamKey,
        tasks: &TaskTracker,
        token: CancellationToken,
    ) -> Result<Self> {
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|e| Error::Spawn {
            key: key.clone(),
            source: std::sync::Arc::new(e),
        })?;

        let pid = child.id();
        let stdin = child.stdin.take();

        if let Some(stderr) = child.stderr.take() {
            tasks.spawn(drain_diagnostics(key.clone(), stderr, token));
        }

        let (exit_tx, exit) = watch::channel(None);
        let kill = CancellationToken::new();
        tasks.spawn(watch_exit(key.clone(), child, kill.clone(), exit_tx));

        tracing::info!(stream = %key, pid = ?pid, "Transcoder spawned");

        Ok(Self {
            key,
            pid,
            stdin: Mutex::new(stdin),
            exit,
            kill,
        })
    }

    /// Stream this process serves
    pub fn key(&self) -> &StreamKey {
        &self.key
    }

    /// OS process id, if known
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Exit information, if the process has exited
    pub fn exit_status(&self) -> Option<ProcessExit> {
        *self.exit.borrow()
    }

    /// Whether the process has exited
    pub fn has_exited(&self) -> bool {
        self.exit.borrow().is_some()
    }

    /// Wait for the process to exit
    pub async fn wait(&self) -> ProcessExit {
        let unknown = ProcessExit {
            status: None,
            killed: false,
        };

        let mut exit = self.exit.clone();
        let waited = exit.wait_for(Option::is_some).await.map(|status| *status);
        match waited {
            Ok(status) => status.unwrap_or(unknown),
            // The watcher only drops its sender after publishing
            Err(_) => (*exit.borrow()).unwrap_or(unknown),
        }
    }

    /// Stop the process
    ///
    /// Asks ffmpeg to quit through stdin, waits up to `grace`, then kills it.
    /// Calling this on a process that already exited is a no-op.
    pub async fn terminate(&self, grace: Duration) -> Result<ProcessExit> {
        if let Some(exit) = self.exit_status() {
            return Ok(exit);
        }

        self.request_quit().await;

        if let Ok(exit) = tokio::time::timeout(grace, self.wait()).await {
            tracing::info!(stream = %self.key, pid = ?self.pid, status = %exit, "Transcoder stopped");
            return Ok(exit);
        }

        tracing::warn!(
            stream = %self.key,
            pid = ?self.pid,
            grace_ms = grace.as_millis() as u64,
            "Transcoder ignored quit request, killing"
        );
        self.kill.cancel();

        match tokio::time::timeout(grace.max(Duration::from_secs(1)), self.wait()).await {
            Ok(exit) => Ok(exit),
            Err(_) => Err(Error::Unresponsive(self.key.clone())),
        }
    }

    /// Send ffmpeg's interactive quit command and close stdin
    async fn request_quit(&self) {
        let Some(mut stdin) = self.stdin.lock().await.take() else {
            return;
        };

        if let Err(e) = stdin.write_all(b"q\n").await {
            tracing::debug!(stream = %self.key, error = %e, "Failed to write quit command");
            return;
        }
        if let Err(e) = stdin.flush().await {
            tracing::debug!(stream = %self.key, error = %e, "Failed to flush quit command");
        }
    }
}

impl fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("key", &self.key)
            .field("pid", &self.pid)
            .field("exit", &*self.exit.borrow())
            .finish()
    }
}

/// Own the child until it exits, killing it on request
async fn watch_exit(
    key: StreamKey,
    mut child: Child,
    kill: CancellationToken,
    exit_tx: watch::Sender<Option<ProcessExit>>,
) {
    let mut killed = false;

    let status = tokio::select! {
        status = child.wait() => status,
        _ = kill.cancelled() => {
            killed = true;
            if let Err(e) = child.start_kill() {
                tracing::error!(stream = %key, error = %e, "Failed to kill transcoder");
            }
            child.wait().await
        }
    };

    let status = match status {
        Ok(status) => Some(status),
        Err(e) => {
            tracing::error!(stream = %key, error = %e, "Failed to wait for transcoder");
            None
        }
    };

    tracing::debug!(stream = %key, status = ?status, killed = killed, "Transcoder exited");
    exit_tx.send_replace(Some(ProcessExit { status, killed }));
}

/// Forward stderr lines to the log
async fn drain_diagnostics(key: StreamKey, stderr: ChildStderr, token: CancellationToken) {
    let mut lines = BufReader::new(stderr).lines();

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    tracing::debug!(target: "livehub::ffmpeg", stream = %key, "{}", line);
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::debug!(stream = %key, error = %e, "Diagnostics stream closed");
                    break;
                }
            }
        }
    }
}
