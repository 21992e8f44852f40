//! Registry behaviour through the public API, including custom engines.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;

use runbox_core::engine::{Lifecycle, registry::EngineRegistry};
use runbox_core::io::StdioSlots;
use runbox_core::{Command, CommandError, Config, Engine, EngineState, Terminal};

/// An engine that records how it was driven and exits with a fixed code.
struct FixedExit {
    code: i32,
    stdio: StdioSlots,
    lifecycle: Lifecycle,
    cancels: Arc<AtomicUsize>,
}

#[async_trait]
impl Engine for FixedExit {
    fn name(&self) -> &str {
        "fixed"
    }

    fn state(&self) -> EngineState {
        self.lifecycle.get()
    }

    fn stdio(&self) -> &StdioSlots {
        &self.stdio
    }

    async fn start(&self) -> runbox_core::Result<()> {
        self.lifecycle.transition(EngineState::Running)
    }

    async fn wait(&self) -> runbox_core::Result<()> {
        let result = runbox_core::error::exit_result(self.code);
        self.lifecycle.finish(&result);
        result
    }

    async fn cancel(&self) -> runbox_core::Result<()> {
        self.cancels.fetch_add(1, Ordering::SeqCst);
        self.lifecycle.cancel();
        Ok(())
    }

    async fn terminal(&self) -> runbox_core::Result<Box<dyn Terminal>> {
        Err(CommandError::Unsupported("no terminal".into()))
    }
}

fn registry_with_fixed(code: i32, cancels: Arc<AtomicUsize>) -> EngineRegistry {
    let mut registry = EngineRegistry::new();
    registry
        .register("fixed", move |_config| {
            let cancels = Arc::clone(&cancels);
            async move {
                Ok(Box::new(FixedExit {
                    code,
                    stdio: StdioSlots::default(),
                    lifecycle: Lifecycle::new(),
                    cancels,
                }) as Box<dyn Engine>)
            }
        })
        .unwrap();
    registry
}

#[test]
fn global_registry_lists_builtin_engines() {
    let names = EngineRegistry::global().list();
    for engine in ["host", "docker", "podman", "dind", "k8s", "ssh", "wsl", "caas"] {
        assert!(names.contains(&engine), "missing {engine} in {names:?}");
    }
}

#[tokio::test]
async fn unknown_engine_is_not_found() {
    let err = Command::new(Config::new("true").with_engine("mainframe"))
        .await
        .unwrap_err();
    assert!(matches!(err, CommandError::EngineNotFound(ref n) if n == "mainframe"));
}

#[tokio::test]
async fn construction_failure_is_distinct_from_not_found() {
    let err = Command::new(Config::new("true").with_engine("caas"))
        .await
        .unwrap_err();
    assert!(matches!(err, CommandError::InvalidConfig(_)), "unexpected error: {err}");
}

#[tokio::test]
async fn custom_engine_drives_the_controller() {
    let cancels = Arc::new(AtomicUsize::new(0));
    let registry = registry_with_fixed(7, Arc::clone(&cancels));

    let command = Command::with_registry(Config::new("anything").with_engine("fixed"), &registry)
        .await
        .unwrap();
    assert_eq!(command.engine_name(), "fixed");

    let err = command.run().await.unwrap_err();
    assert_eq!(err.exit_code(), Some(7));
    assert_eq!(command.state(), EngineState::Completed);

    command.cancel().await.unwrap();
    assert_eq!(cancels.load(Ordering::SeqCst), 1);
    assert_eq!(command.state(), EngineState::Completed);
}

#[tokio::test]
async fn custom_registry_does_not_see_builtins() {
    let registry = registry_with_fixed(0, Arc::new(AtomicUsize::new(0)));
    let err = Command::with_registry(Config::new("true"), &registry)
        .await
        .unwrap_err();
    assert!(matches!(err, CommandError::EngineNotFound(ref n) if n == "host"));
}

#[test]
fn duplicate_registration_is_rejected() {
    let mut registry = registry_with_fixed(0, Arc::new(AtomicUsize::new(0)));
    let err = registry
        .register("fixed", |_config| async {
            Err::<Box<dyn Engine>, _>(CommandError::Unsupported("never built".into()))
        })
        .unwrap_err();
    assert!(matches!(err, CommandError::EngineExists(ref n) if n == "fixed"));
    assert_eq!(registry.len(), 1);
}
