//! Configuration file management for runbox.
//!
//! Provides a TOML-based config file at `~/.config/runbox/config.toml` and a
//! resolution chain: CLI flag > env var > config file > default.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use runbox_core::agent::client::DEFAULT_SERVER;
use runbox_core::agent::server::DEFAULT_PORT;
use runbox_core::config::DEFAULT_ENGINE;

pub const ENV_ENGINE: &str = "RUNBOX_DEFAULT_ENGINE";
pub const ENV_IMAGE: &str = "RUNBOX_DEFAULT_IMAGE";
pub const ENV_SHELL: &str = "RUNBOX_DEFAULT_SHELL";
pub const ENV_WORKDIR: &str = "RUNBOX_DEFAULT_WORKDIR";
pub const ENV_AGENT_SERVER: &str = "RUNBOX_AGENT_SERVER";
pub const ENV_AGENT_PORT: &str = "RUNBOX_AGENT_PORT";
pub const ENV_AGENT_BIND: &str = "RUNBOX_AGENT_BIND";

pub const DEFAULT_BIND: &str = "0.0.0.0";

// -----------------------------------------------------------------------
// Config file types
// -----------------------------------------------------------------------

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigFile {
    pub defaults: DefaultsSection,
    pub agent: AgentSection,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DefaultsSection {
    pub engine: Option<String>,
    pub image: Option<String>,
    pub shell: Option<String>,
    pub workdir: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSection {
    /// Address `exec --agent` and `agent client` connect to.
    pub server: Option<String>,
    /// Port `agent server` listens on.
    pub port: Option<u16>,
    pub bind: Option<String>,
}

impl ConfigFile {
    /// The file `runbox init` writes: built-in defaults spelled out.
    pub fn starter() -> Self {
        Self {
            defaults: DefaultsSection {
                engine: Some(DEFAULT_ENGINE.to_string()),
                ..DefaultsSection::default()
            },
            agent: AgentSection {
                server: Some(DEFAULT_SERVER.to_string()),
                port: Some(DEFAULT_PORT),
                bind: Some(DEFAULT_BIND.to_string()),
            },
        }
    }
}

// -----------------------------------------------------------------------
// Paths
// -----------------------------------------------------------------------

/// Return the runbox config directory.
///
/// Always uses XDG layout: `$XDG_CONFIG_HOME/runbox` or `~/.config/runbox`.
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("runbox");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("runbox")
}

pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

// -----------------------------------------------------------------------
// Read / write
// -----------------------------------------------------------------------

/// Parse the config file at `path`. A missing file is `Ok(None)`; a
/// malformed one is an error.
pub fn load_config_from(path: &Path) -> Result<Option<ConfigFile>> {
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(e)
                .with_context(|| format!("failed to read config file at {}", path.display()));
        }
    };
    let config = toml::from_str(&contents)
        .with_context(|| format!("failed to parse config file at {}", path.display()))?;
    Ok(Some(config))
}

pub fn load_config() -> Result<Option<ConfigFile>> {
    load_config_from(&config_path())
}

/// Serialize and write the config file to `path`, creating parent dirs as
/// needed. Sets file permissions to 0600 on Unix.
pub fn save_config_to(config: &ConfigFile, path: &Path) -> Result<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create config directory {}", dir.display()))?;
    }

    let contents = toml::to_string_pretty(config).context("failed to serialize config")?;
    std::fs::write(path, &contents)
        .with_context(|| format!("failed to write config file at {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(path, perms)
            .with_context(|| format!("failed to set permissions on {}", path.display()))?;
    }

    Ok(())
}

// -----------------------------------------------------------------------
// Resolved config
// -----------------------------------------------------------------------

/// Values given on the command line, if any.
#[derive(Debug, Default, Clone)]
pub struct Overrides {
    pub engine: Option<String>,
    pub image: Option<String>,
    pub shell: Option<String>,
    pub workdir: Option<String>,
    pub agent_server: Option<String>,
    pub port: Option<u16>,
    pub bind: Option<String>,
}

/// Fully resolved CLI settings.
#[derive(Debug, Clone, PartialEq)]
pub struct RunboxConfig {
    pub engine: String,
    pub image: Option<String>,
    pub shell: Option<String>,
    pub workdir: Option<String>,
    pub agent_server: String,
    pub port: u16,
    pub bind: String,
}

fn env_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn pick(flag: Option<String>, env_key: &str, file: Option<String>) -> Option<String> {
    flag.or_else(|| env_var(env_key)).or(file)
}

impl RunboxConfig {
    /// Resolve using the chain: CLI flag > env var > config file > default.
    pub fn resolve(overrides: Overrides) -> Result<Self> {
        let file = load_config()?;
        Self::resolve_with(overrides, file.unwrap_or_default())
    }

    pub fn resolve_with(overrides: Overrides, file: ConfigFile) -> Result<Self> {
        let ConfigFile { defaults, agent } = file;

        let port = match overrides.port {
            Some(port) => port,
            None => match env_var(ENV_AGENT_PORT) {
                Some(raw) => raw
                    .parse()
                    .with_context(|| format!("{ENV_AGENT_PORT} is not a valid port: {raw}"))?,
                None => agent.port.unwrap_or(DEFAULT_PORT),
            },
        };

        Ok(Self {
            engine: pick(overrides.engine, ENV_ENGINE, defaults.engine)
                .unwrap_or_else(|| DEFAULT_ENGINE.to_string()),
            image: pick(overrides.image, ENV_IMAGE, defaults.image),
            shell: pick(overrides.shell, ENV_SHELL, defaults.shell),
            workdir: pick(overrides.workdir, ENV_WORKDIR, defaults.workdir),
            agent_server: pick(overrides.agent_server, ENV_AGENT_SERVER, agent.server)
                .unwrap_or_else(|| DEFAULT_SERVER.to_string()),
            port,
            bind: pick(overrides.bind, ENV_AGENT_BIND, agent.bind)
                .unwrap_or_else(|| DEFAULT_BIND.to_string()),
        })
    }
}

// -----------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn lock_env() -> std::sync::MutexGuard<'static, ()> {
        crate::test_util::lock_env()
    }

    fn clear_env() {
        for key in [
            ENV_ENGINE,
            ENV_IMAGE,
            ENV_SHELL,
            ENV_WORKDIR,
            ENV_AGENT_SERVER,
            ENV_AGENT_PORT,
            ENV_AGENT_BIND,
        ] {
            unsafe { std::env::remove_var(key) };
        }
    }

    fn file_with_engine(engine: &str) -> ConfigFile {
        ConfigFile {
            defaults: DefaultsSection {
                engine: Some(engine.to_string()),
                image: Some("alpine:3.20".to_string()),
                ..DefaultsSection::default()
            },
            agent: AgentSection {
                port: Some(9000),
                ..AgentSection::default()
            },
        }
    }

    #[test]
    fn save_and_load_config_roundtrip() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("runbox").join("config.toml");

        save_config_to(&ConfigFile::starter(), &path).unwrap();
        let loaded = load_config_from(&path).unwrap().unwrap();

        assert_eq!(loaded.defaults.engine.as_deref(), Some("host"));
        assert_eq!(loaded.agent.server.as_deref(), Some("ws://localhost:8080"));
        assert_eq!(loaded.agent.port, Some(8080));
    }

    #[cfg(unix)]
    #[test]
    fn save_config_sets_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("config.toml");
        save_config_to(&ConfigFile::default(), &path).unwrap();

        let meta = std::fs::metadata(&path).unwrap();
        assert_eq!(meta.permissions().mode() & 0o777, 0o600);
    }

    #[test]
    fn missing_file_is_none_and_malformed_is_error() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("config.toml");
        assert!(load_config_from(&path).unwrap().is_none());

        std::fs::write(&path, "[defaults\nengine = ").unwrap();
        let err = load_config_from(&path).unwrap_err();
        assert!(format!("{err:#}").contains("failed to parse config file"));
    }

    #[test]
    fn partial_file_fills_missing_sections() {
        let file: ConfigFile = toml::from_str("[agent]\nport = 7000\n").unwrap();
        assert_eq!(file.agent.port, Some(7000));
        assert!(file.defaults.engine.is_none());
    }

    #[test]
    fn resolve_with_cli_flag_overrides_all() {
        let _lock = lock_env();
        clear_env();
        unsafe { std::env::set_var(ENV_ENGINE, "podman") };

        let overrides = Overrides {
            engine: Some("docker".into()),
            port: Some(1234),
            ..Overrides::default()
        };
        let config = RunboxConfig::resolve_with(overrides, file_with_engine("ssh")).unwrap();
        assert_eq!(config.engine, "docker");
        assert_eq!(config.port, 1234);

        clear_env();
    }

    #[test]
    fn resolve_with_env_var_overrides_config_file() {
        let _lock = lock_env();
        clear_env();
        unsafe { std::env::set_var(ENV_ENGINE, "podman") };
        unsafe { std::env::set_var(ENV_AGENT_PORT, "9100") };

        let config =
            RunboxConfig::resolve_with(Overrides::default(), file_with_engine("ssh")).unwrap();
        assert_eq!(config.engine, "podman");
        assert_eq!(config.port, 9100);
        assert_eq!(config.image.as_deref(), Some("alpine:3.20"));

        clear_env();
    }

    #[test]
    fn resolve_uses_config_file_then_defaults() {
        let _lock = lock_env();
        clear_env();

        let config =
            RunboxConfig::resolve_with(Overrides::default(), file_with_engine("k8s")).unwrap();
        assert_eq!(config.engine, "k8s");
        assert_eq!(config.port, 9000);
        assert_eq!(config.bind, "0.0.0.0");

        let config =
            RunboxConfig::resolve_with(Overrides::default(), ConfigFile::default()).unwrap();
        assert_eq!(config.engine, "host");
        assert_eq!(config.agent_server, "ws://localhost:8080");
        assert_eq!(config.port, 8080);
        assert!(config.image.is_none());
    }

    #[test]
    fn resolve_rejects_bad_port_env() {
        let _lock = lock_env();
        clear_env();
        unsafe { std::env::set_var(ENV_AGENT_PORT, "eighty") };

        let err = RunboxConfig::resolve_with(Overrides::default(), ConfigFile::default())
            .unwrap_err();
        assert!(err.to_string().contains(ENV_AGENT_PORT));

        clear_env();
    }

    #[test]
    fn config_path_ends_with_expected_filename() {
        let path = config_path();
        assert!(
            path.ends_with("runbox/config.toml"),
            "unexpected config path: {}",
            path.display()
        );
    }
}
