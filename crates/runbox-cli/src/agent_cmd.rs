//! `runbox agent server` and `runbox agent client`.

use anyhow::{Context, Result};
use clap::Subcommand;
use tokio_util::sync::CancellationToken;

use runbox_core::agent::{AgentClient, AgentClientOptions, AgentServer, AgentServerOptions};
use runbox_core::{Config, Engine};

use crate::config::RunboxConfig;
use crate::exec_cmd::cancel_on_ctrl_c;

#[derive(Subcommand)]
pub enum AgentCommands {
    /// Accept agent connections and run their commands locally
    Server {
        /// Port to listen on
        #[arg(short = 'p', long)]
        port: Option<u16>,
        /// Address to bind
        #[arg(long)]
        bind: Option<String>,
        /// WebSocket route
        #[arg(long, default_value = "/")]
        path: String,
    },
    /// Run one command through an agent server
    Client {
        /// Shell command to run remotely
        #[arg(short = 'c', long)]
        command: String,
        /// Agent server address
        #[arg(short = 's', long)]
        server: Option<String>,
        /// Engine the server should use
        #[arg(short = 'e', long)]
        engine: Option<String>,
        /// Forward this process's stdin to the remote command
        #[arg(short = 'I', long)]
        interactive: bool,
    },
}

pub async fn run_agent_command(command: AgentCommands, resolved: &RunboxConfig) -> Result<()> {
    match command {
        AgentCommands::Server { path, .. } => run_server(resolved, path).await,
        AgentCommands::Client {
            command,
            engine,
            interactive,
            ..
        } => run_client(resolved, command, engine, interactive).await,
    }
}

async fn run_server(resolved: &RunboxConfig, path: String) -> Result<()> {
    let options = AgentServerOptions {
        port: resolved.port,
        bind: resolved.bind.clone(),
        path,
    };
    println!(
        "runbox agent listening on ws://{}:{}{}",
        options.bind, options.port, options.path
    );
    AgentServer::new(options)
        .serve()
        .await
        .context("agent server failed")?;
    Ok(())
}

async fn run_client(
    resolved: &RunboxConfig,
    command: String,
    engine: Option<String>,
    interactive: bool,
) -> Result<()> {
    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());

    let options = AgentClientOptions::new(resolved.agent_server.clone()).with_cancel(cancel);
    let client = AgentClient::connect_with(options)
        .await
        .with_context(|| format!("failed to connect to agent at {}", resolved.agent_server))?;

    let config = Config {
        engine: engine.unwrap_or_else(|| resolved.engine.clone()),
        image: resolved.image.clone(),
        shell: resolved.shell.clone().unwrap_or_default(),
        workdir: resolved.workdir.clone(),
        ..Config::new(command)
    };
    if interactive {
        client.set_stdin(Box::new(tokio::io::stdin()));
    }
    let result = client.run(&config).await;
    client.close();
    result?;
    Ok(())
}
