//! Command-as-a-service engine: the whole run is delegated to a remote agent
//! server. Locally this only marshals credentials and the environment.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::{debug, info};

use super::{Engine, EngineState, Lifecycle};
use crate::agent::client::{AgentClient, AgentClientOptions};
use crate::config::{Config, DEFAULT_ENGINE};
use crate::error::{CommandError, Result};
use crate::io::{StdioSlots, lock};
use crate::terminal::Terminal;

pub const NAME: &str = "caas";

/// The config sent to the command service. The allow-listed parent
/// variables are resolved here, since the remote side cannot see them.
pub fn remote_config(config: &Config) -> Config {
    let mut environment = config.allowed_system_environment();
    environment.extend(config.environment.clone());
    Config {
        engine: DEFAULT_ENGINE.to_string(),
        environment,
        allowed_system_env_keys: Vec::new(),
        server: None,
        client_id: None,
        client_secret: None,
        ..config.forwarded()
    }
}

pub fn client_options(config: &Config) -> Result<AgentClientOptions> {
    let server = config
        .server
        .as_deref()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| CommandError::InvalidConfig("caas server is required".into()))?;
    let mut options = AgentClientOptions::new(server);
    if let Some(id) = config.client_id.as_deref().filter(|s| !s.is_empty()) {
        let secret = config.client_secret.clone().unwrap_or_default();
        options = options.with_credentials(id, secret);
    }
    if let Some(token) = &config.cancel {
        options = options.with_cancel(token.clone());
    }
    Ok(options)
}

pub struct CaasEngine {
    config: Config,
    options: AgentClientOptions,
    stdio: StdioSlots,
    lifecycle: Lifecycle,
    client: Mutex<Option<Arc<AgentClient>>>,
}

impl CaasEngine {
    pub fn new(config: Config) -> Result<Self> {
        let options = client_options(&config)?;
        Ok(Self {
            config,
            options,
            stdio: StdioSlots::default(),
            lifecycle: Lifecycle::new(),
            client: Mutex::new(None),
        })
    }

    async fn run_remote(&self) -> Result<()> {
        let client = Arc::new(AgentClient::connect_with(self.options.clone()).await?);
        if let Some(stdin) = self.stdio.take_stdin() {
            client.set_stdin(stdin);
        }
        client.set_stdout(self.stdio.stdout_or_default());
        client.set_stderr(self.stdio.stderr_or_default());
        *lock(&self.client) = Some(Arc::clone(&client));

        if self.lifecycle.get() == EngineState::Canceled {
            return Err(CommandError::Canceled);
        }
        let result = client.run(&remote_config(&self.config)).await;
        client.close();
        result
    }
}

#[async_trait]
impl Engine for CaasEngine {
    fn name(&self) -> &str {
        NAME
    }

    fn state(&self) -> EngineState {
        self.lifecycle.get()
    }

    fn stdio(&self) -> &StdioSlots {
        &self.stdio
    }

    async fn start(&self) -> Result<()> {
        self.lifecycle.transition(EngineState::Starting)?;
        info!(engine = NAME, id = %self.config.id, server = %self.options.server, "command started");
        self.lifecycle.advance(EngineState::Running)
    }

    async fn wait(&self) -> Result<()> {
        let result = self.run_remote().await;
        self.lifecycle.finish(&result);
        result
    }

    async fn cancel(&self) -> Result<()> {
        self.lifecycle.cancel();
        let client = lock(&self.client).clone();
        match client {
            Some(client) => client.cancel().await,
            None => {
                debug!(engine = NAME, "cancel before the service connection opened");
                Ok(())
            }
        }
    }

    async fn terminal(&self) -> Result<Box<dyn Terminal>> {
        Err(CommandError::Unsupported(
            "caas engine does not support terminals".into(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_util::sync::CancellationToken;

    fn config() -> Config {
        Config {
            server: Some("ws://caas.internal:8080".into()),
            client_id: Some("ci".into()),
            client_secret: Some("hunter2".into()),
            ..Config::new("make test").with_engine(NAME)
        }
    }

    #[test]
    fn server_is_required() {
        let config = Config::new("true").with_engine(NAME);
        let err = CaasEngine::new(config).err().unwrap();
        assert!(matches!(err, CommandError::InvalidConfig(ref m) if m.contains("server")));
    }

    #[test]
    fn credentials_and_cancel_reach_the_client() {
        let token = CancellationToken::new();
        let options = client_options(&config().with_cancel(token)).unwrap();
        assert_eq!(options.server, "ws://caas.internal:8080");
        assert_eq!(
            options.credentials,
            Some(("ci".to_string(), "hunter2".to_string()))
        );
        assert!(options.cancel.is_some());
    }

    #[test]
    fn remote_config_runs_on_host_without_secrets() {
        let config = config().with_env("A", "1");
        let remote = remote_config(&config);
        assert_eq!(remote.engine, "host");
        assert_eq!(remote.command, "make test");
        assert_eq!(remote.environment.get("A").map(String::as_str), Some("1"));
        assert!(remote.server.is_none());
        assert!(remote.client_secret.is_none());
        assert!(remote.agent.is_none());
    }

    #[test]
    fn remote_config_resolves_allow_list() {
        let config = Config {
            allowed_system_env_keys: vec!["PATH".into()],
            ..config().with_env("PATH", "/opt/bin")
        };
        let remote = remote_config(&config);
        assert_eq!(
            remote.environment.get("PATH").map(String::as_str),
            Some("/opt/bin"),
            "caller values win over the parent's"
        );
        assert!(remote.allowed_system_env_keys.is_empty());
    }

    #[tokio::test]
    async fn terminal_is_unsupported() {
        let engine = CaasEngine::new(config()).unwrap();
        assert!(matches!(
            engine.terminal().await.err().unwrap(),
            CommandError::Unsupported(_)
        ));
    }

    #[tokio::test]
    async fn start_only_validates_and_cancel_is_idempotent() {
        let engine = CaasEngine::new(config()).unwrap();
        engine.start().await.unwrap();
        assert_eq!(engine.state(), EngineState::Running);
        engine.cancel().await.unwrap();
        engine.cancel().await.unwrap();
        assert_eq!(engine.state(), EngineState::Canceled);
    }
}
