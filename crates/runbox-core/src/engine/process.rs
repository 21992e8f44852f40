//! Local child-process plumbing shared by the host and wsl engines.

use std::io;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{CommandError, Result, exit_result};
use crate::io::{
    CHUNK_CHANNEL_CAPACITY, ChunkReader, StdioSlots, lock, spawn_chunk_pump, spawn_copy,
    spawn_output_copy,
};
use crate::terminal::Terminal;

/// How long a canceled process gets between SIGTERM and SIGKILL.
const TERMINATE_GRACE: Duration = Duration::from_secs(2);

/// Map a process exit status to a shell-style exit code. Signal deaths
/// become `128 + signal`.
pub(crate) fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    1
}

#[cfg(unix)]
fn signal(pid: u32, group: bool, signal: libc::c_int) -> bool {
    let target = if group { -(pid as i32) } else { pid as i32 };
    // SAFETY: pid is a child we spawned and have not yet reaped; with `group`
    // it also leads its own process group.
    unsafe { libc::kill(target, signal) == 0 }
}

/// SIGTERM, a short grace period, then SIGKILL. With `group` the signals go
/// to the child's whole process group, so grandchildren die with it.
async fn terminate(child: &mut Child, group: bool) {
    #[cfg(unix)]
    let pid = child.id();
    #[cfg(unix)]
    if let Some(pid) = pid {
        if !signal(pid, group, libc::SIGTERM) {
            warn!(pid, group, "SIGTERM failed, proceeding to SIGKILL");
        }
    }
    #[cfg(not(unix))]
    let _ = group;

    match tokio::time::timeout(TERMINATE_GRACE, child.wait()).await {
        Ok(Ok(_)) => debug!("process exited after SIGTERM"),
        _ => {
            debug!("process did not exit after SIGTERM, sending SIGKILL");
            let _ = child.kill().await;
        }
    }
    #[cfg(unix)]
    if let (Some(pid), true) = (pid, group) {
        // Stragglers that ignored SIGTERM.
        signal(pid, true, libc::SIGKILL);
    }
}

/// Whether the child can get its own process group. A child reading an
/// inherited controlling terminal must stay in the foreground group.
#[cfg(unix)]
fn can_isolate(stdin_bound: bool) -> bool {
    use std::io::IsTerminal;
    stdin_bound || !std::io::stdin().is_terminal()
}

// ---------------------------------------------------------------------------
// ProcessRunner
// ---------------------------------------------------------------------------

/// Owns one spawned child plus the tasks copying its stdio.
#[derive(Debug, Default)]
pub(crate) struct ProcessRunner {
    child: tokio::sync::Mutex<Option<Child>>,
    output_pumps: Mutex<Vec<JoinHandle<()>>>,
    stdin_pump: Mutex<Option<JoinHandle<()>>>,
    canceled: CancellationToken,
    /// The child leads its own process group.
    grouped: AtomicBool,
}

impl ProcessRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn `command`, wiring the bound stdio targets. Empty slots inherit
    /// the parent's streams.
    pub async fn spawn(&self, mut command: Command, stdio: &StdioSlots) -> Result<()> {
        let stdin = stdio.take_stdin();
        let stdout = stdio.take_stdout();
        let stderr = stdio.take_stderr();

        let piped_or_inherit = |bound: bool| {
            if bound {
                Stdio::piped()
            } else {
                Stdio::inherit()
            }
        };
        command
            .stdin(piped_or_inherit(stdin.is_some()))
            .stdout(piped_or_inherit(stdout.is_some()))
            .stderr(piped_or_inherit(stderr.is_some()))
            .kill_on_drop(true);
        #[cfg(unix)]
        if can_isolate(stdin.is_some()) {
            command.process_group(0);
            self.grouped.store(true, Ordering::SeqCst);
        }

        let mut child = command.spawn()?;
        debug!(pid = ?child.id(), grouped = self.grouped.load(Ordering::SeqCst), "spawned child process");

        if let (Some(reader), Some(pipe)) = (stdin, child.stdin.take()) {
            *lock(&self.stdin_pump) = Some(spawn_copy(reader, pipe));
        }
        let mut pumps = Vec::new();
        if let (Some(writer), Some(pipe)) = (stdout, child.stdout.take()) {
            pumps.push(spawn_output_copy(pipe, writer));
        }
        if let (Some(writer), Some(pipe)) = (stderr, child.stderr.take()) {
            pumps.push(spawn_output_copy(pipe, writer));
        }
        *lock(&self.output_pumps) = pumps;
        *self.child.lock().await = Some(child);
        Ok(())
    }

    /// Wait for the child and return its exit code once its output has been
    /// fully copied. Returns [`CommandError::Canceled`] after [`Self::cancel`].
    pub async fn wait(&self) -> Result<i32> {
        let mut guard = self.child.lock().await;
        let child = guard
            .as_mut()
            .ok_or_else(|| CommandError::State("process has not been started".into()))?;

        let exited = tokio::select! {
            biased;
            _ = self.canceled.cancelled() => None,
            status = child.wait() => Some(status),
        };
        let Some(status) = exited else {
            terminate(child, self.grouped.load(Ordering::SeqCst)).await;
            return Err(CommandError::Canceled);
        };
        let status = status?;

        let pumps = std::mem::take(&mut *lock(&self.output_pumps));
        for pump in pumps {
            let _ = pump.await;
        }
        if let Some(pump) = lock(&self.stdin_pump).take() {
            pump.abort();
        }
        Ok(exit_code(status))
    }

    /// Terminate the child. A concurrent [`Self::wait`] does the killing
    /// itself; otherwise it happens here. Safe to repeat.
    pub async fn cancel(&self) {
        self.canceled.cancel();
        let Ok(mut guard) = self.child.try_lock() else {
            return;
        };
        if let Some(child) = guard.as_mut() {
            if matches!(child.try_wait(), Ok(None)) {
                terminate(child, self.grouped.load(Ordering::SeqCst)).await;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// PipeTerminal
// ---------------------------------------------------------------------------

/// A terminal over plain pipes, for backends without a pseudo-terminal.
/// Resize is a no-op.
pub(crate) struct PipeTerminal {
    child: tokio::sync::Mutex<Child>,
    stdin: tokio::sync::Mutex<Option<ChildStdin>>,
    output: ChunkReader,
    exit_code: OnceLock<i32>,
    closed: CancellationToken,
    read_only: bool,
}

impl PipeTerminal {
    pub fn spawn(mut command: Command, read_only: bool) -> Result<Self> {
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let mut child = command.spawn()?;

        let (tx, rx) = mpsc::channel(CHUNK_CHANNEL_CAPACITY);
        if let Some(stdout) = child.stdout.take() {
            spawn_chunk_pump(stdout, tx.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_chunk_pump(stderr, tx);
        }
        let stdin = child.stdin.take();

        Ok(Self {
            child: tokio::sync::Mutex::new(child),
            stdin: tokio::sync::Mutex::new(stdin),
            output: ChunkReader::new(rx),
            exit_code: OnceLock::new(),
            closed: CancellationToken::new(),
            read_only,
        })
    }
}

#[async_trait]
impl Terminal for PipeTerminal {
    async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.output.read(buf).await
    }

    async fn write(&self, data: &[u8]) -> io::Result<usize> {
        if self.read_only {
            return Ok(0);
        }
        let mut stdin = self.stdin.lock().await;
        let pipe = stdin
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "terminal input closed"))?;
        pipe.write_all(data).await?;
        pipe.flush().await?;
        Ok(data.len())
    }

    async fn resize(&self, _rows: u16, _cols: u16) -> Result<()> {
        Ok(())
    }

    async fn wait(&self) -> Result<()> {
        let mut child = self.child.lock().await;
        let exited = tokio::select! {
            biased;
            _ = self.closed.cancelled() => None,
            status = child.wait() => Some(status),
        };
        let code = match exited {
            Some(status) => exit_code(status?),
            None => {
                terminate(&mut child, false).await;
                return Err(CommandError::Canceled);
            }
        };
        let _ = self.exit_code.set(code);
        exit_result(code)
    }

    fn exit_code(&self) -> Option<i32> {
        self.exit_code.get().copied()
    }

    async fn close(&self) -> Result<()> {
        self.stdin.lock().await.take();
        self.closed.cancel();
        if let Ok(mut child) = self.child.try_lock() {
            if matches!(child.try_wait(), Ok(None)) {
                terminate(&mut child, false).await;
            }
        }
        Ok(())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::io::SharedBuffer;

    fn sh(script: &str) -> Command {
        let mut command = Command::new("/bin/sh");
        command.arg("-c").arg(script);
        command
    }

    #[tokio::test]
    async fn runner_captures_output_and_code() {
        let runner = ProcessRunner::new();
        let stdio = StdioSlots::default();
        let out = SharedBuffer::new();
        stdio.set_stdout(Box::new(out.clone()));
        stdio.set_stderr(Box::new(SharedBuffer::new()));

        runner.spawn(sh("echo out; exit 7"), &stdio).await.unwrap();
        assert_eq!(runner.wait().await.unwrap(), 7);
        assert_eq!(out.to_string_lossy(), "out\n");
    }

    #[tokio::test]
    async fn runner_feeds_stdin() {
        let runner = ProcessRunner::new();
        let stdio = StdioSlots::default();
        let out = SharedBuffer::new();
        stdio.set_stdin(Box::new(&b"from stdin"[..]));
        stdio.set_stdout(Box::new(out.clone()));

        runner.spawn(sh("cat"), &stdio).await.unwrap();
        assert_eq!(runner.wait().await.unwrap(), 0);
        assert_eq!(out.to_string_lossy(), "from stdin");
    }

    #[tokio::test]
    async fn runner_cancel_before_wait() {
        let runner = ProcessRunner::new();
        let stdio = StdioSlots::default();
        stdio.set_stdout(Box::new(SharedBuffer::new()));
        runner.spawn(sh("sleep 30"), &stdio).await.unwrap();

        runner.cancel().await;
        runner.cancel().await;
        assert!(matches!(runner.wait().await, Err(CommandError::Canceled)));
    }

    #[tokio::test]
    async fn wait_before_spawn_is_a_state_error() {
        let runner = ProcessRunner::new();
        assert!(matches!(runner.wait().await, Err(CommandError::State(_))));
    }

    #[tokio::test]
    async fn pipe_terminal_echoes_input() {
        let terminal = PipeTerminal::spawn(sh("read line; echo got $line"), false).unwrap();
        assert_eq!(terminal.write(b"ping\n").await.unwrap(), 5);

        let mut out = Vec::new();
        let mut buf = [0u8; 64];
        while !out.ends_with(b"\n") {
            let n = terminal.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        assert_eq!(out, b"got ping\n");
        terminal.wait().await.unwrap();
        assert_eq!(terminal.exit_code(), Some(0));
    }

    #[tokio::test]
    async fn read_only_pipe_terminal_discards_input() {
        let terminal = PipeTerminal::spawn(sh("exit 3"), true).unwrap();
        assert_eq!(terminal.write(b"ignored").await.unwrap(), 0);
        let err = terminal.wait().await.unwrap_err();
        assert_eq!(err.exit_code(), Some(3));
        assert_eq!(terminal.exit_code(), Some(3));
        terminal.close().await.unwrap();
    }
}
