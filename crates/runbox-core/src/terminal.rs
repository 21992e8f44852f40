//! Interactive session contract.

use std::io;

use async_trait::async_trait;

use crate::error::Result;

/// A resizable duplex session bound to one running command.
///
/// Obtained from [`Engine::terminal`](crate::engine::Engine::terminal)
/// instead of `start`/`wait`. Backends without resize support treat
/// [`Terminal::resize`] as a no-op.
#[async_trait]
pub trait Terminal: Send + Sync {
    /// Read output bytes. `Ok(0)` means the session's output has ended.
    async fn read(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Send input bytes. Read-only sessions discard input and return `Ok(0)`.
    async fn write(&self, data: &[u8]) -> io::Result<usize>;

    async fn resize(&self, rows: u16, cols: u16) -> Result<()>;

    /// Block until the command exits. Non-zero exits are
    /// [`CommandError::Exit`](crate::error::CommandError::Exit).
    async fn wait(&self) -> Result<()>;

    /// The exit code once [`Terminal::wait`] has observed it.
    fn exit_code(&self) -> Option<i32>;

    /// Tear the session down. Safe to call more than once.
    async fn close(&self) -> Result<()>;
}

const _: () = {
    fn _assert_object_safe(_: &dyn Terminal) {}
};
