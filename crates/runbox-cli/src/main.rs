mod agent_cmd;
mod config;
mod exec_cmd;
#[cfg(test)]
mod test_util;

use clap::{CommandFactory, Parser, Subcommand};

use runbox_core::{CommandError, EngineRegistry};

use agent_cmd::AgentCommands;
use config::{Overrides, RunboxConfig};
use exec_cmd::ExecArgs;

#[derive(Parser)]
#[command(
    name = "runbox",
    version,
    about = "Run shell commands on pluggable execution engines"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a command on an engine
    Exec(ExecArgs),
    /// Agent server and client
    Agent {
        #[command(subcommand)]
        command: AgentCommands,
    },
    /// List registered engines
    Engines,
    /// Write a runbox config file
    Init {
        /// Overwrite existing config file
        #[arg(long)]
        force: bool,
    },
    /// Print a shell completion script
    Completions {
        shell: clap_complete::Shell,
    },
}

/// Execute the `runbox init` command: write config file.
fn cmd_init(force: bool) -> anyhow::Result<()> {
    let path = config::config_path();

    if path.exists() && !force {
        anyhow::bail!(
            "config file already exists at {}\nUse --force to overwrite.",
            path.display()
        );
    }

    let cfg = config::ConfigFile::starter();
    config::save_config_to(&cfg, &path)?;

    println!("Config written to {}", path.display());
    if let Some(engine) = &cfg.defaults.engine {
        println!("  defaults.engine = {engine}");
    }
    if let Some(server) = &cfg.agent.server {
        println!("  agent.server = {server}");
    }
    Ok(())
}

fn cmd_engines() {
    for name in EngineRegistry::global().list() {
        println!("{name}");
    }
}

fn overrides_for(command: &Commands) -> Overrides {
    match command {
        Commands::Exec(args) => Overrides {
            engine: args.engine.clone(),
            image: args.image.clone(),
            shell: args.shell.clone(),
            workdir: args.workdir.clone(),
            agent_server: args.agent.clone(),
            ..Overrides::default()
        },
        Commands::Agent {
            command: AgentCommands::Server { port, bind, .. },
        } => Overrides {
            port: *port,
            bind: bind.clone(),
            ..Overrides::default()
        },
        Commands::Agent {
            command: AgentCommands::Client { server, .. },
        } => Overrides {
            agent_server: server.clone(),
            ..Overrides::default()
        },
        _ => Overrides::default(),
    }
}

/// The command's own exit code, when the failure is a non-zero exit.
fn command_exit_code(err: &anyhow::Error) -> Option<i32> {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<CommandError>())
        .and_then(CommandError::exit_code)
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Init { force } => cmd_init(force),
        Commands::Engines => {
            cmd_engines();
            Ok(())
        }
        Commands::Completions { shell } => {
            let mut command = Cli::command();
            clap_complete::generate(shell, &mut command, "runbox", &mut std::io::stdout());
            Ok(())
        }
        command => {
            let resolved = RunboxConfig::resolve(overrides_for(&command))?;
            match command {
                Commands::Exec(args) => exec_cmd::run_exec(args, &resolved).await,
                Commands::Agent { command } => {
                    agent_cmd::run_agent_command(command, &resolved).await
                }
                _ => Ok(()),
            }
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        match command_exit_code(&e) {
            Some(code) => std::process::exit(code),
            None => {
                eprintln!("{e:#}");
                std::process::exit(1);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn exit_code_comes_from_the_command() {
        let err = anyhow::Error::new(CommandError::exit(42));
        assert_eq!(command_exit_code(&err), Some(42));

        let err = anyhow::Error::new(CommandError::exit(3)).context("running build");
        assert_eq!(command_exit_code(&err), Some(3));
    }

    #[test]
    fn other_failures_have_no_exit_code() {
        let err = anyhow::Error::new(CommandError::Canceled);
        assert_eq!(command_exit_code(&err), None);
        assert_eq!(command_exit_code(&anyhow::anyhow!("boom")), None);
    }

    #[test]
    fn exec_flags_feed_overrides() {
        let cli = Cli::parse_from(["runbox", "exec", "-c", "ls", "-e", "podman", "-i", "busybox"]);
        let overrides = overrides_for(&cli.command);
        assert_eq!(overrides.engine.as_deref(), Some("podman"));
        assert_eq!(overrides.image.as_deref(), Some("busybox"));
        assert!(overrides.port.is_none());
    }

    #[test]
    fn agent_server_flags_feed_overrides() {
        let cli = Cli::parse_from(["runbox", "agent", "server", "-p", "9001", "--bind", "127.0.0.1"]);
        let overrides = overrides_for(&cli.command);
        assert_eq!(overrides.port, Some(9001));
        assert_eq!(overrides.bind.as_deref(), Some("127.0.0.1"));
    }
}
