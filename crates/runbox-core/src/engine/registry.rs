//! Engine registry -- engine names mapped to async factories.
//!
//! [`EngineRegistry::builtin`] registers every backend this crate ships.
//! [`EngineRegistry::global`] is that set, built once on first use and
//! read-only afterwards. Callers that need a custom set build their own
//! registry and pass it to [`Command::with_registry`](crate::Command::with_registry).

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, OnceLock};

use futures::future::BoxFuture;

use super::Engine;
use super::{caas, dind, docker, host, k8s, podman, ssh, wsl};
use crate::config::Config;
use crate::error::{CommandError, Result};

/// Builds one engine instance from a config.
pub type EngineFactory =
    Arc<dyn Fn(Config) -> BoxFuture<'static, Result<Box<dyn Engine>>> + Send + Sync>;

/// A collection of engine factories, keyed by name.
#[derive(Default)]
pub struct EngineRegistry {
    factories: HashMap<String, EngineFactory>,
}

impl EngineRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding every built-in backend.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.insert(host::NAME, |config| async move {
            Ok(Box::new(host::HostEngine::new(config)?) as Box<dyn Engine>)
        });
        registry.insert(docker::NAME, |config| async move {
            Ok(Box::new(docker::create(config)?) as Box<dyn Engine>)
        });
        registry.insert(podman::NAME, |config| async move {
            Ok(Box::new(podman::create(config)?) as Box<dyn Engine>)
        });
        registry.insert(dind::NAME, |config| async move {
            Ok(Box::new(dind::create(config)?) as Box<dyn Engine>)
        });
        registry.insert(k8s::NAME, |config| async move {
            Ok(Box::new(k8s::K8sEngine::new(config).await?) as Box<dyn Engine>)
        });
        registry.insert(ssh::NAME, |config| async move {
            Ok(Box::new(ssh::SshEngine::connect(config).await?) as Box<dyn Engine>)
        });
        registry.insert(wsl::NAME, |config| async move {
            Ok(Box::new(wsl::WslEngine::new(config)?) as Box<dyn Engine>)
        });
        registry.insert(caas::NAME, |config| async move {
            Ok(Box::new(caas::CaasEngine::new(config)?) as Box<dyn Engine>)
        });
        registry
    }

    /// The process-wide built-in registry.
    pub fn global() -> &'static EngineRegistry {
        static GLOBAL: OnceLock<EngineRegistry> = OnceLock::new();
        GLOBAL.get_or_init(Self::builtin)
    }

    /// Register a factory under `name`. Duplicate names are rejected.
    pub fn register<F, Fut>(&mut self, name: &str, factory: F) -> Result<()>
    where
        F: Fn(Config) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Box<dyn Engine>>> + Send + 'static,
    {
        if self.factories.contains_key(name) {
            return Err(CommandError::EngineExists(name.to_string()));
        }
        self.insert(name, factory);
        Ok(())
    }

    fn insert<F, Fut>(&mut self, name: &str, factory: F)
    where
        F: Fn(Config) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Box<dyn Engine>>> + Send + 'static,
    {
        let boxed: EngineFactory = Arc::new(move |config: Config| {
            Box::pin(factory(config)) as BoxFuture<'static, Result<Box<dyn Engine>>>
        });
        self.factories.insert(name.to_string(), boxed);
    }

    /// Look up a factory by name.
    pub fn get(&self, name: &str) -> Result<EngineFactory> {
        self.factories
            .get(name)
            .cloned()
            .ok_or_else(|| CommandError::EngineNotFound(name.to_string()))
    }

    /// Build an engine for `config` using the factory named by `config.engine`.
    pub async fn create(&self, config: Config) -> Result<Box<dyn Engine>> {
        let factory = self.get(&config.engine)?;
        factory(config).await
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn list(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}

impl std::fmt::Debug for EngineRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineRegistry")
            .field("engines", &self.list())
            .finish()
    }
}
