//! Agent wire events.
//!
//! Every event travels as one JSON text frame `{"Type": ..., "Payload": ...}`.
//! Byte payloads (`stdin`, `stdout`, `stderr`) are base64 strings. `exitcode`
//! carries the decimal code and `done` the stage name, both as base64 bytes.
//! `start`, `wait`, and `cancel` have a null payload.

use std::fmt;
use std::str::FromStr;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::Config;
use crate::error::{CommandError, Result};

pub mod types {
    pub const NEW: &str = "new";
    pub const START: &str = "start";
    pub const WAIT: &str = "wait";
    pub const CANCEL: &str = "cancel";
    pub const STDIN: &str = "stdin";
    pub const STDOUT: &str = "stdout";
    pub const STDERR: &str = "stderr";
    pub const EXITCODE: &str = "exitcode";
    pub const DONE: &str = "done";
    /// Server-internal failure signal; never sent over the wire.
    pub const ERROR: &str = "error";
}

/// A client-driven lifecycle stage, acknowledged by a `done` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    New,
    Start,
    Wait,
    Cancel,
}

impl Stage {
    pub const ALL: [Stage; 4] = [Stage::New, Stage::Start, Stage::Wait, Stage::Cancel];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::New => types::NEW,
            Self::Start => types::START,
            Self::Wait => types::WAIT,
            Self::Cancel => types::CANCEL,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = CommandError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            types::NEW => Ok(Self::New),
            types::START => Ok(Self::Start),
            types::WAIT => Ok(Self::Wait),
            types::CANCEL => Ok(Self::Cancel),
            other => Err(CommandError::Protocol(format!("unknown stage: {other}"))),
        }
    }
}

#[derive(Debug, Clone)]
pub enum Event {
    New(Box<Config>),
    Start,
    Wait,
    Cancel,
    Stdin(Vec<u8>),
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
    Exitcode(i32),
    Done(Stage),
}

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    #[serde(rename = "Type")]
    kind: String,
    #[serde(rename = "Payload", default)]
    payload: Value,
}

fn bytes_payload(data: &[u8]) -> Value {
    Value::String(STANDARD.encode(data))
}

fn decode_bytes(kind: &str, payload: Value) -> Result<Vec<u8>> {
    match payload {
        Value::Null => Ok(Vec::new()),
        Value::String(text) => STANDARD
            .decode(text)
            .map_err(|e| CommandError::Protocol(format!("bad {kind} payload: {e}"))),
        other => Err(CommandError::Protocol(format!(
            "bad {kind} payload: expected base64 string, got {other}"
        ))),
    }
}

fn decode_text(kind: &str, payload: Value) -> Result<String> {
    String::from_utf8(decode_bytes(kind, payload)?)
        .map_err(|e| CommandError::Protocol(format!("bad {kind} payload: {e}")))
}

impl Event {
    /// The `Type` discriminator of this event.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::New(_) => types::NEW,
            Self::Start => types::START,
            Self::Wait => types::WAIT,
            Self::Cancel => types::CANCEL,
            Self::Stdin(_) => types::STDIN,
            Self::Stdout(_) => types::STDOUT,
            Self::Stderr(_) => types::STDERR,
            Self::Exitcode(_) => types::EXITCODE,
            Self::Done(_) => types::DONE,
        }
    }

    pub fn encode(&self) -> Result<String> {
        let payload = match self {
            Self::New(config) => serde_json::to_value(config.as_ref())?,
            Self::Start | Self::Wait | Self::Cancel => Value::Null,
            Self::Stdin(data) | Self::Stdout(data) | Self::Stderr(data) => bytes_payload(data),
            Self::Exitcode(code) => bytes_payload(code.to_string().as_bytes()),
            Self::Done(stage) => bytes_payload(stage.as_str().as_bytes()),
        };
        let envelope = Envelope {
            kind: self.kind().to_string(),
            payload,
        };
        Ok(serde_json::to_string(&envelope)?)
    }

    pub fn decode(text: &str) -> Result<Self> {
        let Envelope { kind, payload } = serde_json::from_str(text)?;
        let event = match kind.as_str() {
            types::NEW => Self::New(Box::new(serde_json::from_value(payload)?)),
            types::START => Self::Start,
            types::WAIT => Self::Wait,
            types::CANCEL => Self::Cancel,
            types::STDIN => Self::Stdin(decode_bytes(&kind, payload)?),
            types::STDOUT => Self::Stdout(decode_bytes(&kind, payload)?),
            types::STDERR => Self::Stderr(decode_bytes(&kind, payload)?),
            types::EXITCODE => {
                let text = decode_text(&kind, payload)?;
                let code = text.trim().parse().map_err(|_| {
                    CommandError::Protocol(format!("bad exitcode payload: {text:?}"))
                })?;
                Self::Exitcode(code)
            }
            types::DONE => Self::Done(decode_text(&kind, payload)?.parse()?),
            other => {
                return Err(CommandError::Protocol(format!(
                    "unknown event type: {other}"
                )));
            }
        };
        Ok(event)
    }
}
