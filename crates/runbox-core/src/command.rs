//! The command controller: one [`Config`], one [`Engine`].
//!
//! [`Command`] resolves defaults and the sandbox overlay, builds the engine
//! through a registry (or an agent connection when `agent` is set), and adds
//! run-level timeout and external cancellation on top of the engine's own
//! start/wait/cancel.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::agent::client::{AgentClient, AgentClientOptions};
use crate::config::Config;
use crate::engine::{Engine, EngineRegistry, EngineState};
use crate::error::{CommandError, Result};
use crate::io::{BoxReader, BoxWriter, SharedBuffer};
use crate::terminal::Terminal;

pub struct Command {
    config: Config,
    engine: Arc<dyn Engine>,
    cancel: CancellationToken,
    watcher: Option<JoinHandle<()>>,
}

impl Command {
    /// Build a command against the built-in engines.
    pub async fn new(config: Config) -> Result<Self> {
        Self::with_registry(config, EngineRegistry::global()).await
    }

    /// Build a command, resolving the engine from `registry`.
    pub async fn with_registry(mut config: Config, registry: &EngineRegistry) -> Result<Self> {
        config.apply_sandbox()?;
        config.apply_defaults();

        let cancel = config.cancel.clone().unwrap_or_else(CancellationToken::new);
        config.cancel = Some(cancel.clone());

        // A remote command composes its environment on the server side.
        let engine: Arc<dyn Engine> = match config.agent.clone().filter(|a| !a.is_empty()) {
            Some(server) => {
                let options = AgentClientOptions::new(server).with_cancel(cancel.clone());
                let client = AgentClient::connect_with(options).await?;
                client.create(&config).await?;
                config.compose_environment();
                Arc::new(client)
            }
            None => {
                config.compose_environment();
                Arc::from(registry.create(config.clone()).await?)
            }
        };
        debug!(id = %config.id, engine = engine.name(), "command created");

        let watcher = {
            let engine = Arc::clone(&engine);
            let cancel = cancel.clone();
            let id = config.id.clone();
            tokio::spawn(async move {
                cancel.cancelled().await;
                info!(%id, "command canceled by caller");
                if let Err(e) = engine.cancel().await {
                    warn!(%id, error = %e, "engine cancel failed");
                }
            })
        };

        Ok(Self {
            config,
            engine,
            cancel,
            watcher: Some(watcher),
        })
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    /// The fully resolved config the engine was built from.
    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn engine_name(&self) -> &str {
        self.engine.name()
    }

    pub fn state(&self) -> EngineState {
        self.engine.state()
    }

    pub fn set_stdin(&self, stdin: BoxReader) {
        self.engine.set_stdin(stdin);
    }

    pub fn set_stdout(&self, stdout: BoxWriter) {
        self.engine.set_stdout(stdout);
    }

    pub fn set_stderr(&self, stderr: BoxWriter) {
        self.engine.set_stderr(stderr);
    }

    pub async fn start(&self) -> Result<()> {
        if self.config.command.is_empty() {
            return Err(CommandError::InvalidConfig("command is required".into()));
        }
        if self.cancel.is_cancelled() {
            return Err(CommandError::Canceled);
        }
        info!(id = %self.config.id, engine = self.engine.name(), "starting command");
        self.engine.start().await
    }

    /// Wait for the engine, bounded by the configured timeout and the
    /// caller's cancellation. A timeout cancels the engine.
    pub async fn wait(&self) -> Result<()> {
        let timeout = self.config.timeout.filter(|t| !t.is_zero());
        tokio::select! {
            result = self.engine.wait() => result,
            _ = sleep_or_forever(timeout) => {
                let limit = timeout.unwrap_or_default();
                warn!(id = %self.config.id, ?limit, "command timed out");
                if let Err(e) = self.engine.cancel().await {
                    warn!(id = %self.config.id, error = %e, "engine cancel after timeout failed");
                }
                Err(CommandError::Timeout(limit))
            }
            _ = self.cancel.cancelled() => Err(CommandError::Canceled),
        }
    }

    /// `start` then `wait`.
    pub async fn run(&self) -> Result<()> {
        self.start().await?;
        self.wait().await
    }

    /// Run to completion and return stdout and stderr interleaved.
    pub async fn output(&self) -> Result<Vec<u8>> {
        let buffer = SharedBuffer::new();
        self.set_stdout(Box::new(buffer.clone()));
        self.set_stderr(Box::new(buffer.clone()));
        self.run().await?;
        Ok(buffer.contents())
    }

    pub async fn terminal(&self) -> Result<Box<dyn Terminal>> {
        self.engine.terminal().await
    }

    /// Forcefully stop the command. Safe to repeat.
    pub async fn cancel(&self) -> Result<()> {
        self.engine.cancel().await
    }
}

async fn sleep_or_forever(timeout: Option<Duration>) {
    match timeout {
        Some(limit) => tokio::time::sleep(limit).await,
        None => std::future::pending().await,
    }
}

impl Drop for Command {
    fn drop(&mut self) {
        if let Some(watcher) = self.watcher.take() {
            watcher.abort();
        }
    }
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Command")
            .field("id", &self.config.id)
            .field("engine", &self.engine.name())
            .field("state", &self.engine.state())
            .finish()
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn defaults_are_resolved_on_construction() {
        let command = Command::new(Config::new("true")).await.unwrap();
        assert_eq!(command.engine_name(), "host");
        assert_eq!(command.config().shell, "/bin/sh");
        assert!(command.id().starts_with("runbox_command_"));
        assert_eq!(command.config().environment["RUNBOX_COMMAND"], "true");
    }

    #[tokio::test]
    async fn empty_command_is_rejected_at_start() {
        let command = Command::new(Config::new("")).await.unwrap();
        let err = command.start().await.unwrap_err();
        assert!(matches!(err, CommandError::InvalidConfig(ref m) if m == "command is required"));
    }

    #[tokio::test]
    async fn output_captures_both_streams() {
        let command = Command::new(Config::new("echo out; echo err >&2"))
            .await
            .unwrap();
        let output = String::from_utf8(command.output().await.unwrap()).unwrap();
        assert!(output.contains("out\n"));
        assert!(output.contains("err\n"));
    }

    #[tokio::test]
    async fn descriptive_environment_reaches_the_command() {
        let config = Config::new("printf %s \"$RUNBOX_ENGINE\"");
        let command = Command::new(config).await.unwrap();
        assert_eq!(command.output().await.unwrap(), b"host");
    }

    #[tokio::test]
    async fn debug_names_engine() {
        let command = Command::new(Config::new("true")).await.unwrap();
        let debug = format!("{command:?}");
        assert!(debug.contains("host"));
        assert!(debug.contains("Created"), "{debug}");
    }
}
