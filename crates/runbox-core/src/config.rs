//! The [`Config`] describing one command run.
//!
//! A `Config` is the only input an engine receives. It is also the payload of
//! the agent `new` event, so everything except the cancellation token is
//! serializable.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{CommandError, Result};

pub const DEFAULT_ENGINE: &str = "host";
pub const DEFAULT_SHELL: &str = "/bin/sh";

/// Memory limit (MB) applied by the sandbox overlay when none is set.
pub const SANDBOX_MEMORY_MB: i64 = 512;
/// CPU limit (cores) applied by the sandbox overlay when none is set.
pub const SANDBOX_CPU: f64 = 1.0;

/// Engines the sandbox overlay accepts. `dind` is excluded because it needs
/// a privileged container.
const SANDBOX_ENGINES: &[&str] = &["docker", "podman"];

/// Parent variables every command sees unless the caller overrides them.
const BASE_ENV_KEYS: &[&str] = &["HOME", "USER", "PATH"];

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub id: String,
    pub engine: String,
    pub command: String,
    pub workdir: Option<String>,
    pub environment: BTreeMap<String, String>,
    pub user: Option<String>,
    pub shell: String,
    pub read_only: bool,
    pub timeout: Option<Duration>,
    pub sandbox: bool,
    /// Agent server address. When set the command runs remotely.
    pub agent: Option<String>,

    // host
    pub history_disabled: bool,
    pub inherit_environment: bool,
    pub allowed_system_env_keys: Vec<String>,

    // container family
    pub image: Option<String>,
    /// Memory limit in MB.
    pub memory: i64,
    /// CPU limit in cores.
    pub cpu: f64,
    pub platform: Option<String>,
    pub network: Option<String>,
    pub disable_network: bool,
    pub privileged: bool,
    pub docker_host: Option<String>,
    pub docker_runtime: Option<String>,
    pub image_registry: Option<String>,
    pub image_registry_username: Option<String>,
    pub image_registry_password: Option<String>,
    pub data_dir_outer: Option<String>,
    pub data_dir_inner: Option<String>,
    pub podman_host: Option<String>,

    // caas
    pub server: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,

    // ssh
    pub ssh_host: Option<String>,
    pub ssh_port: Option<u16>,
    pub ssh_user: Option<String>,
    pub ssh_pass: Option<String>,
    pub ssh_private_key: Option<String>,
    pub ssh_private_key_secret: Option<String>,
    pub ssh_ignore_strict_host_key_checking: bool,
    pub ssh_known_hosts_file_path: Option<String>,

    // k8s
    pub k8s_kubeconfig: Option<String>,
    pub k8s_namespace: Option<String>,
    pub k8s_image: Option<String>,
    pub k8s_job_timeout_seconds: Option<i64>,

    // wsl
    pub wsl_distro: Option<String>,

    /// External cancellation signal. Never sent over the wire.
    #[serde(skip)]
    pub cancel: Option<CancellationToken>,
}

impl Config {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Self::default()
        }
    }

    pub fn with_engine(mut self, engine: impl Into<String>) -> Self {
        self.engine = engine.into();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.insert(key.into(), value.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Apply the sandbox policy overlay. Must run before any other defaulting.
    ///
    /// Pins the engine to the container family, forces privilege off,
    /// disables networking unless a network was named, and bounds memory and
    /// CPU when they are unset.
    pub fn apply_sandbox(&mut self) -> Result<()> {
        if !self.sandbox {
            return Ok(());
        }

        if self.engine.is_empty() {
            self.engine = "docker".to_string();
        } else if !SANDBOX_ENGINES.contains(&self.engine.as_str()) {
            return Err(CommandError::SandboxRejected(self.engine.clone()));
        }

        self.privileged = false;
        if self.network.as_deref().is_none_or(str::is_empty) {
            self.disable_network = true;
        }
        if self.memory == 0 {
            self.memory = SANDBOX_MEMORY_MB;
        }
        if self.cpu == 0.0 {
            self.cpu = SANDBOX_CPU;
        }
        Ok(())
    }

    /// Fill the engine, shell, and run ID when they are empty.
    pub fn apply_defaults(&mut self) {
        if self.engine.is_empty() {
            self.engine = DEFAULT_ENGINE.to_string();
        }
        if self.shell.is_empty() {
            self.shell = DEFAULT_SHELL.to_string();
        }
        if self.id.is_empty() {
            self.id = format!("runbox_command_{}", Uuid::new_v4());
        }
    }

    /// Variables describing this run, exposed to the command itself.
    pub fn descriptive_environment(&self) -> BTreeMap<String, String> {
        let opt = |v: &Option<String>| v.clone().unwrap_or_default();
        BTreeMap::from([
            ("RUNBOX_ENGINE".to_string(), self.engine.clone()),
            ("RUNBOX_ID".to_string(), self.id.clone()),
            ("RUNBOX_SHELL".to_string(), self.shell.clone()),
            ("RUNBOX_USER".to_string(), opt(&self.user)),
            ("RUNBOX_WORKDIR".to_string(), opt(&self.workdir)),
            ("RUNBOX_COMMAND".to_string(), self.command.clone()),
            ("RUNBOX_IMAGE".to_string(), opt(&self.image)),
            ("RUNBOX_MEMORY".to_string(), self.memory.to_string()),
            ("RUNBOX_CPU".to_string(), self.cpu.to_string()),
            ("RUNBOX_PLATFORM".to_string(), opt(&self.platform)),
            ("RUNBOX_NETWORK".to_string(), opt(&self.network)),
            (
                "RUNBOX_DISABLE_NETWORK".to_string(),
                self.disable_network.to_string(),
            ),
        ])
    }

    /// Merge descriptive variables and the parent's `HOME`/`USER`/`PATH`
    /// underneath the caller's environment. Caller entries win.
    pub fn compose_environment(&mut self) {
        let mut composed = BTreeMap::new();
        for key in BASE_ENV_KEYS {
            if let Ok(value) = std::env::var(key) {
                composed.insert((*key).to_string(), value);
            }
        }
        composed.extend(self.descriptive_environment());
        composed.append(&mut self.environment);
        self.environment = composed;
    }

    /// Values of the allow-listed parent variables that are actually set.
    pub fn allowed_system_environment(&self) -> BTreeMap<String, String> {
        self.allowed_system_env_keys
            .iter()
            .filter_map(|key| std::env::var(key).ok().map(|v| (key.clone(), v)))
            .collect()
    }

    /// The copy of this config sent to an agent server.
    pub fn forwarded(&self) -> Config {
        Config {
            agent: None,
            cancel: None,
            ..self.clone()
        }
    }
}
