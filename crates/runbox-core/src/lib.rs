//! Run shell commands on pluggable execution engines: the local host,
//! Docker-compatible daemons, Kubernetes Jobs, SSH hosts, WSL, or a remote
//! agent.
//!
//! ```no_run
//! # async fn demo() -> runbox_core::Result<()> {
//! use runbox_core::{Command, Config};
//!
//! let command = Command::new(Config::new("echo hello world")).await?;
//! let output = command.output().await?;
//! assert_eq!(output, b"hello world\n");
//! # Ok(())
//! # }
//! ```

pub mod agent;
pub mod command;
pub mod config;
pub mod engine;
pub mod error;
pub mod io;
pub mod terminal;

pub use command::Command;
pub use config::Config;
pub use engine::{Engine, EngineRegistry, EngineState};
pub use error::{CommandError, Result};
pub use io::SharedBuffer;
pub use terminal::Terminal;
