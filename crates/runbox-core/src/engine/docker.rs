//! Docker engine.

use bollard::auth::DockerCredentials;

use super::container::{self, ContainerEngine, ContainerSettings};
use crate::config::Config;
use crate::error::Result;

pub const NAME: &str = "docker";
pub const DEFAULT_IMAGE: &str = "whatwewant/zmicro:v1";

/// Registry credentials for the image pull, when a username is configured.
fn credentials(config: &Config) -> Option<DockerCredentials> {
    let username = config.image_registry_username.clone().filter(|u| !u.is_empty())?;
    Some(DockerCredentials {
        username: Some(username),
        password: config.image_registry_password.clone(),
        serveraddress: config.image_registry.clone().filter(|r| !r.is_empty()),
        ..Default::default()
    })
}

fn data_mount(config: &Config) -> Option<(String, String)> {
    match (&config.data_dir_outer, &config.data_dir_inner) {
        (Some(outer), Some(inner)) if !outer.is_empty() && !inner.is_empty() => {
            Some((outer.clone(), inner.clone()))
        }
        _ => None,
    }
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
        auto_remove: false,
        runtime: config.docker_runtime.clone().filter(|r| !r.is_empty()),
        data_mount: data_mount(config),
        credentials: credentials(config),
    }
}

pub fn create(config: Config) -> Result<ContainerEngine> {
    let docker = container::connect(config.docker_host.as_deref())?;
    let settings = settings(&config);
    ContainerEngine::new(config, settings, docker)
}
