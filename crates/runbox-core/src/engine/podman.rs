//! Podman engine, over Podman's Docker-compatible API socket.

use super::container::{self, ContainerEngine, ContainerSettings};
use crate::config::Config;
use crate::error::Result;

pub const NAME: &str = "podman";
pub const DEFAULT_IMAGE: &str = "docker.io/library/alpine:latest";
pub const DEFAULT_HOST: &str = "unix:///run/podman/podman.sock";

/// `podman_host`, else `PODMAN_HOST`, else the default socket.
pub fn resolve_host(config: &Config, env_host: Option<String>) -> String {
    config
        .podman_host
        .clone()
        .filter(|h| !h.is_empty())
        .or(env_host.filter(|h| !h.is_empty()))
        .unwrap_or_else(|| DEFAULT_HOST.to_string())
}

pub(crate) fn settings(config: &Config) -> ContainerSettings {
    ContainerSettings {
        engine: NAME,
        image: config
            .image
            .clone()
            .filter(|i| !i.is_empty())
            .unwrap_or_else(|| DEFAULT_IMAGE.to_string()),
        privileged: config.privileged,
        auto_remove: true,
        runtime: None,
        data_mount: None,
        credentials: None,
    }
}

pub fn create(config: Config) -> Result<ContainerEngine> {
    let host = resolve_host(&config, std::env::var("PODMAN_HOST").ok());
    let docker = container::connect(Some(&host))?;
    let settings = settings(&config);
    ContainerEngine::new(config, settings, docker)
}
