//! Stdio plumbing shared by engines and terminals.

use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub type BoxReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Capacity of the chunk channels feeding terminal readers.
pub(crate) const CHUNK_CHANNEL_CAPACITY: usize = 64;

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// StdioSlots
// ---------------------------------------------------------------------------

/// Redirection targets bound before start and consumed by it.
///
/// An empty slot means "the process's own stream". The host engine passes
/// that straight to the child; other engines substitute tokio's stdout and
/// stderr handles and forward no input.
#[derive(Default)]
pub struct StdioSlots {
    stdin: Mutex<Option<BoxReader>>,
    stdout: Mutex<Option<BoxWriter>>,
    stderr: Mutex<Option<BoxWriter>>,
}

impl StdioSlots {
    pub fn set_stdin(&self, reader: BoxReader) {
        *lock(&self.stdin) = Some(reader);
    }

    pub fn set_stdout(&self, writer: BoxWriter) {
        *lock(&self.stdout) = Some(writer);
    }

    pub fn set_stderr(&self, writer: BoxWriter) {
        *lock(&self.stderr) = Some(writer);
    }

    pub fn take_stdin(&self) -> Option<BoxReader> {
        lock(&self.stdin).take()
    }

    pub fn take_stdout(&self) -> Option<BoxWriter> {
        lock(&self.stdout).take()
    }

    pub fn take_stderr(&self) -> Option<BoxWriter> {
        lock(&self.stderr).take()
    }

    /// The bound stdout, or the process stdout.
    pub fn stdout_or_default(&self) -> BoxWriter {
        self.take_stdout()
            .unwrap_or_else(|| Box::new(tokio::io::stdout()))
    }

    /// The bound stderr, or the process stderr.
    pub fn stderr_or_default(&self) -> BoxWriter {
        self.take_stderr()
            .unwrap_or_else(|| Box::new(tokio::io::stderr()))
    }
}

impl std::fmt::Debug for StdioSlots {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StdioSlots")
            .field("stdin", &lock(&self.stdin).is_some())
            .field("stdout", &lock(&self.stdout).is_some())
            .field("stderr", &lock(&self.stderr).is_some())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// SharedBuffer
// ---------------------------------------------------------------------------

/// An in-memory writer whose clones all append to the same bytes.
#[derive(Debug, Clone, Default)]
pub struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl SharedBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> Vec<u8> {
        lock(&self.0).clone()
    }

    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(&lock(&self.0)).into_owned()
    }
}

impl AsyncWrite for SharedBuffer {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        lock(&self.0).extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

// ---------------------------------------------------------------------------
// ChunkReader
// ---------------------------------------------------------------------------

/// Byte-oriented reads over a channel of output chunks.
///
/// Terminal backends push whatever their native stream yields; readers get
/// at most `buf.len()` bytes per call and the remainder is kept for the next.
#[derive(Debug)]
pub struct ChunkReader {
    state: tokio::sync::Mutex<ChunkState>,
}

#[derive(Debug)]
struct ChunkState {
    rx: mpsc::Receiver<Vec<u8>>,
    pending: Vec<u8>,
}

impl ChunkReader {
    pub fn new(rx: mpsc::Receiver<Vec<u8>>) -> Self {
        Self {
            state: tokio::sync::Mutex::new(ChunkState {
                rx,
                pending: Vec::new(),
            }),
        }
    }

    /// Read the next bytes. Returns `Ok(0)` once every sender is gone.
    pub async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut state = self.state.lock().await;
        while state.pending.is_empty() {
            match state.rx.recv().await {
                Some(chunk) => state.pending = chunk,
                None => return Ok(0),
            }
        }
        let n = buf.len().min(state.pending.len());
        buf[..n].copy_from_slice(&state.pending[..n]);
        state.pending.drain(..n);
        Ok(n)
    }
}

/// Spawn a task that forwards everything `reader` yields into `tx`.
pub(crate) fn spawn_chunk_pump<R>(mut reader: R, tx: mpsc::Sender<Vec<u8>>) -> JoinHandle<()>
where
    R: AsyncRead + Send + Unpin + 'static,
{
    tokio::spawn(async move {
        let mut buf = vec![0u8; 8192];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if tx.send(buf[..n].to_vec()).await.is_err() {
                        break;
                    }
                }
            }
        }
    })
}

/// Spawn a task copying `reader` into `writer` until EOF, then flushing and
/// shutting the writer down so the receiving side sees end of input.
pub(crate) fn spawn_copy<R, W>(mut reader: R, mut writer: W) -> JoinHandle<()>
where
    R: AsyncRead + Send + Unpin + 'static,
    W: AsyncWrite + Send + Unpin + 'static,
{
    tokio::spawn(async move {
        if let Err(e) = tokio::io::copy(&mut reader, &mut writer).await {
            tracing::debug!(error = %e, "stream copy ended");
        }
        let _ = writer.flush().await;
        let _ = writer.shutdown().await;
    })
}

/// Spawn a task copying `reader` into `writer` and flushing at EOF, without
/// shutting the writer down (used for caller-owned output targets).
pub(crate) fn spawn_output_copy<R>(mut reader: R, mut writer: BoxWriter) -> JoinHandle<()>
where
    R: AsyncRead + Send + Unpin + 'static,
{
    tokio::spawn(async move {
        if let Err(e) = tokio::io::copy(&mut reader, &mut writer).await {
            tracing::debug!(error = %e, "output copy ended");
        }
        let _ = writer.flush().await;
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn shared_buffer_clones_share_contents() {
        let buffer = SharedBuffer::new();
        let mut a = buffer.clone();
        let mut b = buffer.clone();
        a.write_all(b"hello ").await.unwrap();
        b.write_all(b"world").await.unwrap();
        assert_eq!(buffer.to_string_lossy(), "hello world");
    }

    #[tokio::test]
    async fn chunk_reader_splits_large_chunks() {
        let (tx, rx) = mpsc::channel(4);
        let reader = ChunkReader::new(rx);
        tx.send(b"abcdef".to_vec()).await.unwrap();
        drop(tx);

        let mut buf = [0u8; 4];
        assert_eq!(reader.read(&mut buf).await.unwrap(), 4);
        assert_eq!(&buf, b"abcd");
        assert_eq!(reader.read(&mut buf).await.unwrap(), 2);
        assert_eq!(&buf[..2], b"ef");
        assert_eq!(reader.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn chunk_pump_forwards_reader() {
        let (tx, rx) = mpsc::channel(4);
        let reader = ChunkReader::new(rx);
        spawn_chunk_pump(&b"pumped"[..], tx);

        let mut out = Vec::new();
        let mut buf = [0u8; 16];
        loop {
            let n = reader.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        assert_eq!(out, b"pumped");
    }

    #[test]
    fn empty_slots_fall_back() {
        let slots = StdioSlots::default();
        assert!(slots.take_stdin().is_none());
        slots.set_stdout(Box::new(SharedBuffer::new()));
        assert!(slots.take_stdout().is_some());
        assert!(slots.take_stdout().is_none(), "slots are consumed once");
    }
}
