//! Docker-in-Docker: the docker engine with privilege forced on and a fixed
//! image.

use super::container::{self, ContainerEngine};
use super::docker;
use crate::config::Config;
use crate::error::Result;

pub const NAME: &str = "dind";
pub const IMAGE: &str = "whatwewant/dind:v24-1";

pub fn create(config: Config) -> Result<ContainerEngine> {
    let docker = container::connect(config.docker_host.as_deref())?;
    let mut settings = docker::settings(&config);
    settings.engine = NAME;
    settings.image = IMAGE.to_string();
    settings.privileged = true;
    ContainerEngine::new(config, settings, docker)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Engine;

    #[tokio::test]
    async fn dind_is_privileged_with_fixed_image() {
        let config = Config {
            image: Some("alpine:latest".into()),
            privileged: false,
            docker_host: Some("tcp://127.0.0.1:2375".into()),
            ..Config::new("true")
        };
        let engine = create(config).unwrap();
        assert_eq!(engine.name(), "dind");
        assert_eq!(engine.image(), IMAGE);
    }
}
