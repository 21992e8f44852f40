//! WSL engine: runs the command inside a Windows Subsystem for Linux distro
//! through `wsl.exe`.

use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::info;

use super::process::{PipeTerminal, ProcessRunner};
use super::{Engine, EngineState, Lifecycle, guard_start};
use crate::config::Config;
use crate::error::{CommandError, Result, exit_result};
use crate::io::StdioSlots;
use crate::terminal::Terminal;

pub const NAME: &str = "wsl";

const PROGRAM: &str = "wsl";

/// Arguments for `wsl.exe`: `[-d <distro>] -e <shell> -c <command>`.
pub fn wsl_args(config: &Config) -> Vec<String> {
    let mut args = Vec::new();
    if let Some(distro) = config.wsl_distro.as_deref().filter(|d| !d.is_empty()) {
        args.push("-d".to_string());
        args.push(distro.to_string());
    }
    let script = if config.command.is_empty() {
        "sleep 0"
    } else {
        config.command.as_str()
    };
    args.extend(["-e".to_string(), config.shell.clone(), "-c".to_string(), script.to_string()]);
    args
}

/// `TERM`, then the allow-listed parent variables, then the caller's.
pub fn wsl_environment(config: &Config) -> BTreeMap<String, String> {
    let mut env = BTreeMap::from([("TERM".to_string(), "xterm".to_string())]);
    env.extend(config.allowed_system_environment());
    env.extend(config.environment.clone());
    env
}

pub struct WslEngine {
    config: Config,
    stdio: StdioSlots,
    lifecycle: Lifecycle,
    runner: ProcessRunner,
}

impl WslEngine {
    pub fn new(config: Config) -> Result<Self> {
        if !cfg!(windows) {
            return Err(CommandError::Unsupported(
                "wsl engine is only available on Windows".into(),
            ));
        }
        Ok(Self {
            config,
            stdio: StdioSlots::default(),
            lifecycle: Lifecycle::new(),
            runner: ProcessRunner::new(),
        })
    }

    fn command(&self) -> Command {
        let mut command = Command::new(PROGRAM);
        command
            .args(wsl_args(&self.config))
            .env_clear()
            .envs(wsl_environment(&self.config));
        if let Some(dir) = self.config.workdir.as_deref().filter(|d| !d.is_empty()) {
            command.current_dir(dir);
        }
        command
    }
}

#[async_trait]
impl Engine for WslEngine {
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
        guard_start(&self.lifecycle, self.runner.spawn(self.command(), &self.stdio)).await?;
        info!(engine = NAME, id = %self.config.id, "command started");
        self.lifecycle.advance(EngineState::Running)
    }

    async fn wait(&self) -> Result<()> {
        let result = self.runner.wait().await.and_then(exit_result);
        self.lifecycle.finish(&result);
        result
    }

    async fn cancel(&self) -> Result<()> {
        self.lifecycle.cancel();
        self.runner.cancel().await;
        Ok(())
    }

    async fn terminal(&self) -> Result<Box<dyn Terminal>> {
        self.lifecycle.transition(EngineState::Running)?;
        let terminal = PipeTerminal::spawn(self.command(), self.config.read_only)
            .inspect_err(|_| self.lifecycle.fail())?;
        Ok(Box::new(terminal))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(command: &str) -> Config {
        let mut config = Config::new(command);
        config.apply_defaults();
        config
    }

    #[test]
    fn args_without_distro() {
        assert_eq!(wsl_args(&config("ls -la")), vec!["-e", "/bin/sh", "-c", "ls -la"]);
    }

    #[test]
    fn args_with_distro_and_empty_command() {
        let config = Config {
            wsl_distro: Some("Ubuntu-22.04".into()),
            shell: "/bin/bash".into(),
            ..config("")
        };
        assert_eq!(
            wsl_args(&config),
            vec!["-d", "Ubuntu-22.04", "-e", "/bin/bash", "-c", "sleep 0"]
        );
    }

    #[test]
    fn environment_starts_fresh() {
        let config = config("env").with_env("TERM", "dumb").with_env("A", "1");
        let env = wsl_environment(&config);
        assert_eq!(env.get("TERM").map(String::as_str), Some("dumb"));
        assert_eq!(env.get("A").map(String::as_str), Some("1"));
        assert_eq!(env.len(), 2);
    }

    #[cfg(not(windows))]
    #[test]
    fn only_constructible_on_windows() {
        let err = WslEngine::new(config("true")).err().unwrap();
        assert!(matches!(err, CommandError::Unsupported(_)));
    }
}
