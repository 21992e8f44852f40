//! Execution engines -- one pluggable backend per substrate.
//!
//! Every backend implements [`Engine`], and [`EngineRegistry`] maps engine
//! names to async factories so the controller can pick one at runtime.

pub mod caas;
mod container;
pub mod dind;
pub mod docker;
pub mod host;
pub mod k8s;
mod process;
pub mod podman;
pub mod registry;
pub mod ssh;
pub mod wsl;

use std::fmt;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::{CommandError, Result};
use crate::io::{BoxReader, BoxWriter, StdioSlots, lock};
use crate::terminal::Terminal;

pub use container::ContainerEngine;
pub use registry::{EngineFactory, EngineRegistry};

/// One execution attempt bound to one [`Config`](crate::config::Config).
///
/// Methods take `&self` so [`Engine::cancel`] can run while another task is
/// blocked in [`Engine::wait`]. An instance is never reused across runs.
///
/// # Object Safety
///
/// This trait is object-safe so engines can be produced by the registry as
/// `Box<dyn Engine>`.
#[async_trait]
pub trait Engine: Send + Sync {
    /// Registry name of this backend (e.g. "docker").
    fn name(&self) -> &str;

    fn state(&self) -> EngineState;

    /// Where stdio redirection targets are held until start consumes them.
    fn stdio(&self) -> &StdioSlots;

    /// Begin execution without waiting for it to finish.
    async fn start(&self) -> Result<()>;

    /// Block until the command terminates. Non-zero exits are
    /// [`CommandError::Exit`].
    async fn wait(&self) -> Result<()>;

    /// Forcefully terminate. Idempotent and safe after completion.
    async fn cancel(&self) -> Result<()>;

    /// Alternate entry point for interactive use, instead of start/wait.
    async fn terminal(&self) -> Result<Box<dyn Terminal>>;

    fn set_stdin(&self, stdin: BoxReader) {
        self.stdio().set_stdin(stdin);
    }

    fn set_stdout(&self, stdout: BoxWriter) {
        self.stdio().set_stdout(stdout);
    }

    fn set_stderr(&self, stderr: BoxWriter) {
        self.stdio().set_stderr(stderr);
    }
}

const _: () = {
    fn _assert_object_safe(_: &dyn Engine) {}
};

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Created,
    Starting,
    Running,
    Completed,
    Canceled,
    Failed,
}

impl EngineState {
    pub fn is_final(self) -> bool {
        matches!(self, Self::Completed | Self::Canceled | Self::Failed)
    }

    /// `Created -> Running` is the terminal path, which merges starting and
    /// running into one step.
    pub fn is_valid_transition(from: Self, to: Self) -> bool {
        use EngineState::*;
        matches!(
            (from, to),
            (Created, Starting)
                | (Created, Running)
                | (Created, Canceled)
                | (Created, Failed)
                | (Starting, Running)
                | (Starting, Failed)
                | (Starting, Canceled)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Canceled)
        )
    }
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Canceled => "canceled",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Thread-safe holder of an engine's [`EngineState`].
#[derive(Debug)]
pub struct Lifecycle(Mutex<EngineState>);

impl Default for Lifecycle {
    fn default() -> Self {
        Self(Mutex::new(EngineState::Created))
    }
}

impl Lifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> EngineState {
        *lock(&self.0)
    }

    pub fn transition(&self, to: EngineState) -> Result<()> {
        let mut state = lock(&self.0);
        if !EngineState::is_valid_transition(*state, to) {
            return Err(CommandError::State(format!("cannot go from {state} to {to}")));
        }
        *state = to;
        Ok(())
    }

    /// Like [`Self::transition`], but a no-op once a final state (usually a
    /// concurrent cancel) has landed.
    pub fn advance(&self, to: EngineState) -> Result<()> {
        let mut state = lock(&self.0);
        if state.is_final() {
            return Ok(());
        }
        if !EngineState::is_valid_transition(*state, to) {
            return Err(CommandError::State(format!("cannot go from {state} to {to}")));
        }
        *state = to;
        Ok(())
    }

    /// Record the outcome of a wait. A cancellation that already landed is
    /// kept; exits of any code count as completion.
    pub fn finish<T>(&self, outcome: &Result<T>) {
        let mut state = lock(&self.0);
        if state.is_final() {
            return;
        }
        *state = match outcome {
            Ok(_) | Err(CommandError::Exit { .. }) => EngineState::Completed,
            Err(CommandError::Canceled) => EngineState::Canceled,
            Err(_) => EngineState::Failed,
        };
    }

    /// Move to `Canceled` unless already final. Returns whether it moved.
    pub fn cancel(&self) -> bool {
        let mut state = lock(&self.0);
        if state.is_final() {
            return false;
        }
        *state = EngineState::Canceled;
        true
    }

    pub fn fail(&self) {
        let mut state = lock(&self.0);
        if !state.is_final() {
            *state = EngineState::Failed;
        }
    }
}

/// Run `f` and mark the lifecycle failed if it errors.
pub(crate) async fn guard_start<F, T>(lifecycle: &Lifecycle, f: F) -> Result<T>
where
    F: std::future::Future<Output = Result<T>>,
{
    let result = f.await;
    if result.is_err() {
        lifecycle.fail();
    }
    result
}

/// Run `step`, releasing a resource it depends on when it fails. A failed
/// release is logged and the step's error is returned.
pub(crate) async fn release_on_error<F, R, T>(engine: &str, step: F, release: R) -> Result<T>
where
    F: std::future::Future<Output = Result<T>>,
    R: std::future::Future<Output = Result<()>>,
{
    match step.await {
        Ok(value) => Ok(value),
        Err(e) => {
            if let Err(cleanup) = release.await {
                tracing::warn!(engine, error = %cleanup, "cleanup after failed start failed");
            }
            Err(e)
        }
    }
}

#[cfg(test)]
pub(crate) mod stub;
