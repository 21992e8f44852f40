//! Error type shared by every engine, the command controller, and the agent.

use std::time::Duration;

use thiserror::Error;

pub type Result<T, E = CommandError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum CommandError {
    // -- configuration ------------------------------------------------------
    #[error("engine not found: {0}")]
    EngineNotFound(String),

    #[error("engine already registered: {0}")]
    EngineExists(String),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("sandbox mode requires the docker engine, but got: {0}")]
    SandboxRejected(String),

    #[error("{0}")]
    Unsupported(String),

    // -- command outcome ----------------------------------------------------
    /// The command ran and exited with a non-zero status.
    #[error("{message}")]
    Exit { code: i32, message: String },

    #[error("command timed out after {0:?}")]
    Timeout(Duration),

    #[error("command canceled")]
    Canceled,

    #[error("invalid engine state: {0}")]
    State(String),

    // -- agent transport ----------------------------------------------------
    #[error("timed out waiting for {stage} acknowledgement")]
    AckTimeout { stage: String },

    #[error("agent connection closed")]
    ConnectionClosed,

    #[error("agent protocol error: {0}")]
    Protocol(String),

    #[error("websocket: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    // -- backends -----------------------------------------------------------
    #[error("docker: {0}")]
    Docker(#[from] bollard::errors::Error),

    #[error("k8s: {0}")]
    Kube(#[from] kube::Error),

    #[error("ssh: {0}")]
    Ssh(#[from] russh::Error),

    #[error("{engine}: {message}")]
    Backend {
        engine: &'static str,
        message: String,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

impl CommandError {
    /// Build the error reported for a non-zero exit status.
    pub fn exit(code: i32) -> Self {
        Self::Exit {
            code,
            message: format!("exit status {code}"),
        }
    }

    pub(crate) fn backend(engine: &'static str, message: impl std::fmt::Display) -> Self {
        Self::Backend {
            engine,
            message: message.to_string(),
        }
    }

    /// The exit code carried by an [`CommandError::Exit`], if any.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Self::Exit { code, .. } => Some(*code),
            _ => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }

    pub fn is_canceled(&self) -> bool {
        matches!(self, Self::Canceled)
    }
}

/// Turn an exit code into the outcome of a wait: zero is success.
pub fn exit_result(code: i32) -> Result<()> {
    if code == 0 {
        Ok(())
    } else {
        Err(CommandError::exit(code))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_result_zero_is_ok() {
        assert!(exit_result(0).is_ok());
    }

    #[test]
    fn exit_result_carries_code() {
        let err = exit_result(42).unwrap_err();
        assert_eq!(err.exit_code(), Some(42));
        assert_eq!(err.to_string(), "exit status 42");
    }

    #[test]
    fn timeout_is_not_an_exit() {
        let err = CommandError::Timeout(Duration::from_secs(1));
        assert!(err.is_timeout());
        assert_eq!(err.exit_code(), None);
    }

    #[test]
    fn ack_timeout_names_stage() {
        let err = CommandError::AckTimeout {
            stage: "wait".to_string(),
        };
        assert_eq!(err.to_string(), "timed out waiting for wait acknowledgement");
    }
}
