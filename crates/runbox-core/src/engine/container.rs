//! Docker Engine API backend shared by the docker, podman, and dind engines.
//!
//! Resources are created lazily: construction only validates the config and
//! builds a client, `start`/`terminal` pull the image, create the container,
//! attach to it, and only then start it so no output is lost.

use std::collections::HashMap;
use std::fmt::Display;
use std::io;
use std::pin::Pin;
use std::sync::{Mutex, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use bollard::Docker;
use bollard::auth::DockerCredentials;
use bollard::container::{
    AttachContainerOptions, AttachContainerResults, Config as ContainerConfig,
    CreateContainerOptions, InspectContainerOptions, LogOutput, NetworkingConfig,
    RemoveContainerOptions, ResizeContainerTtyOptions, StartContainerOptions,
    WaitContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::image::CreateImageOptions;
use bollard::models::{ContainerStateStatusEnum, EndpointSettings, HostConfig, Mount, MountTypeEnum};
use bollard::network::InspectNetworkOptions;
use futures::StreamExt;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{Engine, EngineState, Lifecycle, guard_start, release_on_error};
use crate::config::Config;
use crate::error::{CommandError, Result};
use crate::io::{
    BoxReader, BoxWriter, CHUNK_CHANNEL_CAPACITY, ChunkReader, StdioSlots, lock, spawn_copy,
};
use crate::terminal::Terminal;

pub(crate) const SUPPORTED_PLATFORMS: &[&str] = &["linux/amd64", "linux/arm64"];
const CPU_PERIOD: i64 = 100_000;
const HOSTNAME: &str = "runbox";
const API_TIMEOUT_SECS: u64 = 120;
/// Upper bound on waiting for attached output after the container exits.
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// What distinguishes docker, podman, and dind from each other.
#[derive(Debug, Clone)]
pub(crate) struct ContainerSettings {
    pub engine: &'static str,
    pub image: String,
    pub privileged: bool,
    pub auto_remove: bool,
    pub runtime: Option<String>,
    pub data_mount: Option<(String, String)>,
    pub credentials: Option<DockerCredentials>,
}

/// Build a client for `host`, or for the local defaults (`DOCKER_HOST`, then
/// the standard socket) when no host is given.
pub(crate) fn connect(host: Option<&str>) -> Result<Docker> {
    let docker = match host.filter(|h| !h.is_empty()) {
        None => Docker::connect_with_local_defaults()?,
        #[cfg(unix)]
        Some(h) if h.starts_with("unix://") => {
            Docker::connect_with_unix(h, API_TIMEOUT_SECS, bollard::API_DEFAULT_VERSION)?
        }
        Some(h) if h.starts_with("tcp://") || h.starts_with("http://") => {
            Docker::connect_with_http(h, API_TIMEOUT_SECS, bollard::API_DEFAULT_VERSION)?
        }
        Some(h) => {
            return Err(CommandError::InvalidConfig(format!(
                "unsupported container host: {h}"
            )));
        }
    };
    Ok(docker)
}

pub(crate) fn validate_platform(platform: Option<&str>) -> Result<()> {
    match platform.filter(|p| !p.is_empty()) {
        Some(p) if !SUPPORTED_PLATFORMS.contains(&p) => Err(CommandError::InvalidConfig(format!(
            "invalid platform: {p}, available: {}",
            SUPPORTED_PLATFORMS.join(", ")
        ))),
        _ => Ok(()),
    }
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value.clone().filter(|v| !v.is_empty())
}

fn bind_mount(source: &str, target: &str) -> Mount {
    Mount {
        typ: Some(MountTypeEnum::BIND),
        source: Some(source.to_string()),
        target: Some(target.to_string()),
        read_only: Some(false),
        ..Default::default()
    }
}

/// Memory limit in bytes, or `None` when unset.
fn memory_bytes(megabytes: i64) -> Result<Option<i64>> {
    if megabytes <= 0 {
        return Ok(None);
    }
    megabytes
        .checked_mul(1024 * 1024)
        .map(Some)
        .ok_or_else(|| {
            CommandError::InvalidConfig(format!("memory limit of {megabytes} MB is out of range"))
        })
}

/// CFS quota for `cores` over [`CPU_PERIOD`], or `None` when unset.
fn cpu_quota(cores: f64) -> Result<Option<i64>> {
    if cores.is_nan() || cores <= 0.0 {
        return Ok(None);
    }
    let quota = (CPU_PERIOD as f64 * cores).round();
    if !quota.is_finite() || quota >= i64::MAX as f64 {
        return Err(CommandError::InvalidConfig(format!(
            "cpu limit of {cores} cores is out of range"
        )));
    }
    Ok(Some(quota as i64))
}

/// The container create request for `config`, minus networking.
pub(crate) fn build_container_config(
    config: &Config,
    settings: &ContainerSettings,
) -> Result<ContainerConfig<String>> {
    let memory = memory_bytes(config.memory)?;
    let cpu_quota = cpu_quota(config.cpu)?;
    let workdir = non_empty(&config.workdir);

    let mut mounts = Vec::new();
    if let Some(dir) = &workdir {
        mounts.push(bind_mount(dir, dir));
    }
    if let Some((outer, inner)) = &settings.data_mount {
        mounts.push(bind_mount(outer, inner));
    }

    let host_config = HostConfig {
        privileged: Some(settings.privileged),
        auto_remove: Some(settings.auto_remove),
        memory,
        cpu_period: cpu_quota.map(|_| CPU_PERIOD),
        cpu_quota,
        network_mode: config.disable_network.then(|| "none".to_string()),
        runtime: settings.runtime.clone(),
        mounts: (!mounts.is_empty()).then_some(mounts),
        ..Default::default()
    };

    let mut env = config.allowed_system_environment();
    env.extend(config.environment.clone());
    let env = env.into_iter().map(|(k, v)| format!("{k}={v}")).collect();

    let mut cmd = vec![config.shell.clone()];
    if !config.command.is_empty() {
        cmd.push("-c".to_string());
        cmd.push(config.command.clone());
    }

    Ok(ContainerConfig {
        hostname: Some(HOSTNAME.to_string()),
        image: Some(settings.image.clone()),
        cmd: Some(cmd),
        user: non_empty(&config.user),
        working_dir: workdir,
        env: Some(env),
        tty: Some(true),
        open_stdin: Some(true),
        stdin_once: Some(true),
        attach_stdin: Some(true),
        attach_stdout: Some(true),
        attach_stderr: Some(true),
        host_config: Some(host_config),
        ..Default::default()
    })
}

fn is_gone(err: &DockerError) -> bool {
    matches!(
        err,
        DockerError::DockerResponseServerError {
            status_code: 404 | 409,
            ..
        }
    )
}

fn container_exit(code: i64) -> Result<()> {
    if code == 0 {
        return Ok(());
    }
    Err(CommandError::Exit {
        code: code as i32,
        message: format!("container exited with non-zero status: {code}"),
    })
}

async fn wait_exit(docker: &Docker, engine: &'static str, id: &str) -> Result<i64> {
    let mut stream = Box::pin(docker.wait_container(
        id,
        Some(WaitContainerOptions {
            condition: "not-running",
        }),
    ));
    match stream.next().await {
        Some(Ok(response)) => Ok(response.status_code),
        // Non-zero exits arrive as an error carrying the code.
        Some(Err(DockerError::DockerContainerWaitError { code, .. })) => Ok(code),
        Some(Err(e)) => Err(e.into()),
        None => Err(CommandError::backend(
            engine,
            "container wait ended without a status",
        )),
    }
}

async fn remove(docker: &Docker, engine: &'static str, id: &str) -> Result<()> {
    let options = RemoveContainerOptions {
        force: true,
        ..Default::default()
    };
    match docker.remove_container(id, Some(options)).await {
        Ok(()) => {
            debug!(engine, container = %id, "container removed");
            Ok(())
        }
        Err(e) if is_gone(&e) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

// ---------------------------------------------------------------------------
// ContainerEngine
// ---------------------------------------------------------------------------

pub struct ContainerEngine {
    config: Config,
    settings: ContainerSettings,
    docker: Docker,
    stdio: StdioSlots,
    lifecycle: Lifecycle,
    container_id: Mutex<Option<String>>,
    output_pump: Mutex<Option<JoinHandle<()>>>,
    canceled: CancellationToken,
}

impl ContainerEngine {
    pub(crate) fn new(config: Config, settings: ContainerSettings, docker: Docker) -> Result<Self> {
        validate_platform(config.platform.as_deref())?;
        Ok(Self {
            config,
            settings,
            docker,
            stdio: StdioSlots::default(),
            lifecycle: Lifecycle::new(),
            container_id: Mutex::new(None),
            output_pump: Mutex::new(None),
            canceled: CancellationToken::new(),
        })
    }

    pub fn image(&self) -> &str {
        &self.settings.image
    }

    fn container_id(&self) -> Option<String> {
        lock(&self.container_id).clone()
    }

    async fn progress(&self, out: &mut BoxWriter, message: impl Display) {
        let engine = self.settings.engine;
        debug!(engine, "{message}");
        let line = format!(
            "[{}][{engine}] {message}\n",
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S")
        );
        let _ = out.write_all(line.as_bytes()).await;
        let _ = out.flush().await;
    }

    async fn ensure_image(&self, out: &mut BoxWriter) -> Result<()> {
        let image = &self.settings.image;
        if self.docker.inspect_image(image).await.is_ok() {
            return Ok(());
        }

        self.progress(out, format!("pull image {image} ...")).await;
        let options = CreateImageOptions {
            from_image: image.clone(),
            platform: self.config.platform.clone().unwrap_or_default(),
            ..Default::default()
        };
        let mut pull = Box::pin(self.docker.create_image(
            Some(options),
            None,
            self.settings.credentials.clone(),
        ));
        while let Some(item) = pull.next().await {
            match item {
                Ok(info) => {
                    if let Some(status) = info.status {
                        let line = match info.progress {
                            Some(progress) => format!("{status} {progress}\n"),
                            None => format!("{status}\n"),
                        };
                        let _ = out.write_all(line.as_bytes()).await;
                    }
                }
                Err(e) => {
                    self.progress(out, format!("failed to pull image: {e}")).await;
                    return Err(e.into());
                }
            }
        }
        Ok(())
    }

    async fn networking(&self, out: &mut BoxWriter) -> Result<Option<NetworkingConfig<String>>> {
        let Some(name) = non_empty(&self.config.network) else {
            return Ok(None);
        };
        if self.config.disable_network {
            return Ok(None);
        }

        self.progress(out, format!("inspect network {name} ...")).await;
        let network = self
            .docker
            .inspect_network(&name, None::<InspectNetworkOptions<String>>)
            .await
            .inspect_err(|e| warn!(engine = self.settings.engine, network = %name, error = %e, "network inspect failed"))?;

        let endpoint = EndpointSettings {
            network_id: network.id,
            ..Default::default()
        };
        Ok(Some(NetworkingConfig {
            endpoints_config: HashMap::from([(name, endpoint)]),
        }))
    }

    /// Pull, create, and record the container. Returns its ID.
    async fn prepare(&self, out: &mut BoxWriter) -> Result<String> {
        let engine = self.settings.engine;
        self.progress(out, format!("start to prepare {engine} environment ..."))
            .await;
        if let Some(platform) = non_empty(&self.config.platform) {
            self.progress(out, format!("platform: {platform} ...")).await;
        }

        self.ensure_image(out).await?;
        let mut body = build_container_config(&self.config, &self.settings)?;
        body.networking_config = self.networking(out).await?;

        let options = CreateContainerOptions {
            name: self.config.id.clone(),
            platform: non_empty(&self.config.platform),
        };
        let created = match self.docker.create_container(Some(options), body).await {
            Ok(created) => created,
            Err(e) => {
                self.progress(out, format!("failed to create container: {e}"))
                    .await;
                return Err(e.into());
            }
        };
        *lock(&self.container_id) = Some(created.id.clone());

        self.progress(out, format!("succeed to prepare {engine} environment."))
            .await;
        info!(engine, container = %created.id, image = %self.settings.image, "container created");
        Ok(created.id)
    }

    async fn attach(&self, id: &str) -> Result<AttachContainerResults> {
        let options = AttachContainerOptions::<String> {
            stdin: Some(true),
            stdout: Some(true),
            stderr: Some(true),
            stream: Some(true),
            logs: Some(false),
            detach_keys: None,
        };
        Ok(self.docker.attach_container(id, Some(options)).await?)
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await?;
        Ok(())
    }

    /// Attach to `id`, pump its output, then start it. Attaching first keeps
    /// early output.
    async fn attach_and_start(
        &self,
        id: &str,
        stdout: BoxWriter,
        stderr: BoxWriter,
        stdin: Option<BoxReader>,
    ) -> Result<()> {
        let AttachContainerResults { mut output, input } = self.attach(id).await?;
        let pump = tokio::spawn(async move {
            let (mut stdout, mut stderr) = (stdout, stderr);
            while let Some(item) = output.next().await {
                let written = match item {
                    Ok(LogOutput::StdErr { message }) => stderr.write_all(&message).await,
                    Ok(log) => stdout.write_all(&log.into_bytes()).await,
                    Err(e) => {
                        debug!(error = %e, "container output stream ended");
                        break;
                    }
                };
                if written.is_err() {
                    break;
                }
            }
            let _ = stdout.flush().await;
            let _ = stderr.flush().await;
        });
        *lock(&self.output_pump) = Some(pump);

        if let Some(reader) = stdin {
            spawn_copy(reader, input);
        }
        self.start_container(id).await
    }

    async fn launch(&self) -> Result<()> {
        let mut stderr = self.stdio.stderr_or_default();
        let stdout = self.stdio.stdout_or_default();
        let stdin = self.stdio.take_stdin();

        let id = self.prepare(&mut stderr).await?;
        let engine = self.settings.engine;
        release_on_error(
            engine,
            self.attach_and_start(&id, stdout, stderr, stdin),
            remove(&self.docker, engine, &id),
        )
        .await?;
        info!(engine, container = %id, "container started");
        Ok(())
    }

    /// Attach a terminal session to the created container `id` and start it.
    async fn open_terminal(&self, id: String) -> Result<ContainerTerminal> {
        let AttachContainerResults { mut output, input } = self.attach(&id).await?;

        let (tx, rx) = mpsc::channel(CHUNK_CHANNEL_CAPACITY);
        tokio::spawn(async move {
            while let Some(Ok(log)) = output.next().await {
                if tx.send(log.into_bytes().to_vec()).await.is_err() {
                    break;
                }
            }
        });

        self.start_container(&id).await?;
        Ok(ContainerTerminal {
            engine: self.settings.engine,
            docker: self.docker.clone(),
            id,
            input: tokio::sync::Mutex::new(input),
            output: ChunkReader::new(rx),
            exit_code: OnceLock::new(),
            read_only: self.config.read_only,
        })
    }

    async fn drain_output(&self) {
        let pump = lock(&self.output_pump).take();
        if let Some(pump) = pump {
            if tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, pump).await.is_err() {
                debug!(engine = self.settings.engine, "output still streaming after exit");
            }
        }
    }
}

#[async_trait]
impl Engine for ContainerEngine {
    fn name(&self) -> &str {
        self.settings.engine
    }

    fn state(&self) -> EngineState {
        self.lifecycle.get()
    }

    fn stdio(&self) -> &StdioSlots {
        &self.stdio
    }

    async fn start(&self) -> Result<()> {
        self.lifecycle.transition(EngineState::Starting)?;
        guard_start(&self.lifecycle, self.launch()).await?;
        self.lifecycle.advance(EngineState::Running)
    }

    async fn wait(&self) -> Result<()> {
        let id = self
            .container_id()
            .ok_or_else(|| CommandError::State("container has not been started".into()))?;

        let outcome = tokio::select! {
            biased;
            _ = self.canceled.cancelled() => Err(CommandError::Canceled),
            code = wait_exit(&self.docker, self.settings.engine, &id) => code,
        };
        let result = match outcome {
            Ok(code) => {
                self.drain_output().await;
                container_exit(code)
            }
            Err(e) => Err(e),
        };
        self.lifecycle.finish(&result);
        result
    }

    async fn cancel(&self) -> Result<()> {
        if self.lifecycle.cancel() {
            info!(engine = self.settings.engine, id = %self.config.id, "canceling container");
        }
        self.canceled.cancel();
        if let Some(pump) = lock(&self.output_pump).take() {
            pump.abort();
        }
        match self.container_id() {
            Some(id) => remove(&self.docker, self.settings.engine, &id).await,
            None => Ok(()),
        }
    }

    async fn terminal(&self) -> Result<Box<dyn Terminal>> {
        self.lifecycle.transition(EngineState::Running)?;
        let opened = async {
            let mut stderr = self.stdio.stderr_or_default();
            let id = self.prepare(&mut stderr).await?;
            let engine = self.settings.engine;
            release_on_error(
                engine,
                self.open_terminal(id.clone()),
                remove(&self.docker, engine, &id),
            )
            .await
        };
        let terminal = guard_start(&self.lifecycle, opened).await?;
        Ok(Box::new(terminal))
    }
}

// ---------------------------------------------------------------------------
// ContainerTerminal
// ---------------------------------------------------------------------------

struct ContainerTerminal {
    engine: &'static str,
    docker: Docker,
    id: String,
    /// Serializes interleaved writers.
    input: tokio::sync::Mutex<Pin<Box<dyn AsyncWrite + Send>>>,
    output: ChunkReader,
    exit_code: OnceLock<i32>,
    read_only: bool,
}

#[async_trait]
impl Terminal for ContainerTerminal {
    async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.output.read(buf).await
    }

    async fn write(&self, data: &[u8]) -> io::Result<usize> {
        if self.read_only {
            return Ok(0);
        }
        let mut input = self.input.lock().await;
        input.write_all(data).await?;
        input.flush().await?;
        Ok(data.len())
    }

    async fn resize(&self, rows: u16, cols: u16) -> Result<()> {
        let inspect = self
            .docker
            .inspect_container(&self.id, None::<InspectContainerOptions>)
            .await?;
        let running = inspect
            .state
            .and_then(|state| state.status)
            .is_some_and(|status| status == ContainerStateStatusEnum::RUNNING);
        if !running {
            return Ok(());
        }
        self.docker
            .resize_container_tty(
                &self.id,
                ResizeContainerTtyOptions {
                    height: rows,
                    width: cols,
                },
            )
            .await?;
        Ok(())
    }

    async fn wait(&self) -> Result<()> {
        let code = wait_exit(&self.docker, self.engine, &self.id).await?;
        let _ = self.exit_code.set(code as i32);
        container_exit(code)
    }

    fn exit_code(&self) -> Option<i32> {
        self.exit_code.get().copied()
    }

    async fn close(&self) -> Result<()> {
        let _ = self.input.lock().await.shutdown().await;
        remove(&self.docker, self.engine, &self.id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::stub::StubApi;
    use axum::body::Bytes;
    use axum::http::{Method, StatusCode};

    fn settings() -> ContainerSettings {
        ContainerSettings {
            engine: "docker",
            image: "alpine:latest".into(),
            privileged: false,
            auto_remove: false,
            runtime: None,
            data_mount: None,
            credentials: None,
        }
    }

    fn config(command: &str) -> Config {
        let mut config = Config::new(command);
        config.apply_defaults();
        config
    }

    #[test]
    fn resources_translate_to_bytes_and_quota() {
        let config = Config {
            memory: 512,
            cpu: 1.5,
            ..config("true")
        };
        let body = build_container_config(&config, &settings()).unwrap();
        let host = body.host_config.unwrap();
        assert_eq!(host.memory, Some(512 * 1024 * 1024));
        assert_eq!(host.cpu_period, Some(100_000));
        assert_eq!(host.cpu_quota, Some(150_000));
    }

    #[test]
    fn unset_resources_are_left_to_the_daemon() {
        let body = build_container_config(&config("true"), &settings()).unwrap();
        let host = body.host_config.unwrap();
        assert_eq!(host.memory, None);
        assert_eq!(host.cpu_quota, None);
        assert_eq!(host.network_mode, None);
        assert_eq!(host.mounts, None);
    }

    #[test]
    fn command_runs_through_shell() {
        let body = build_container_config(&config("echo hi"), &settings()).unwrap();
        assert_eq!(
            body.cmd.unwrap(),
            vec!["/bin/sh".to_string(), "-c".into(), "echo hi".into()]
        );
        assert_eq!(body.tty, Some(true));
        assert_eq!(body.open_stdin, Some(true));
        assert_eq!(body.hostname.as_deref(), Some("runbox"));
    }

    #[test]
    fn workdir_and_data_dir_are_bind_mounted() {
        let mut config = config("ls");
        config.workdir = Some("/srv/app".into());
        let settings = ContainerSettings {
            data_mount: Some(("/var/data".into(), "/data".into())),
            ..settings()
        };
        let body = build_container_config(&config, &settings).unwrap();
        assert_eq!(body.working_dir.as_deref(), Some("/srv/app"));

        let mounts = body.host_config.unwrap().mounts.unwrap();
        assert_eq!(mounts.len(), 2);
        assert_eq!(mounts[0].source.as_deref(), Some("/srv/app"));
        assert_eq!(mounts[0].target.as_deref(), Some("/srv/app"));
        assert_eq!(mounts[0].typ, Some(MountTypeEnum::BIND));
        assert_eq!(mounts[1].source.as_deref(), Some("/var/data"));
        assert_eq!(mounts[1].target.as_deref(), Some("/data"));
    }

    #[test]
    fn disabled_network_uses_none_mode() {
        let config = Config {
            disable_network: true,
            ..config("true")
        };
        let body = build_container_config(&config, &settings()).unwrap();
        assert_eq!(body.host_config.unwrap().network_mode.as_deref(), Some("none"));
    }

    #[test]
    fn environment_is_rendered_as_pairs() {
        let config = config("env").with_env("FOO", "bar");
        let env = build_container_config(&config, &settings())
            .unwrap()
            .env
            .unwrap();
        assert!(env.contains(&"FOO=bar".to_string()));
    }

    #[test]
    fn privileged_and_runtime_follow_settings() {
        let settings = ContainerSettings {
            privileged: true,
            auto_remove: true,
            runtime: Some("runsc".into()),
            ..settings()
        };
        let host = build_container_config(&config("true"), &settings)
            .unwrap()
            .host_config
            .unwrap();
        assert_eq!(host.privileged, Some(true));
        assert_eq!(host.auto_remove, Some(true));
        assert_eq!(host.runtime.as_deref(), Some("runsc"));
    }

    #[test]
    fn platform_validation() {
        assert!(validate_platform(None).is_ok());
        assert!(validate_platform(Some("")).is_ok());
        assert!(validate_platform(Some("linux/arm64")).is_ok());
        let err = validate_platform(Some("windows/amd64")).unwrap_err();
        assert!(err.to_string().contains("invalid platform: windows/amd64"));
    }

    #[test]
    fn container_exit_codes() {
        assert!(container_exit(0).is_ok());
        let err = container_exit(137).unwrap_err();
        assert_eq!(err.exit_code(), Some(137));
        assert_eq!(err.to_string(), "container exited with non-zero status: 137");
    }

    #[test]
    fn missing_containers_count_as_gone() {
        let not_found = DockerError::DockerResponseServerError {
            status_code: 404,
            message: "no such container".into(),
        };
        let server = DockerError::DockerResponseServerError {
            status_code: 500,
            message: "boom".into(),
        };
        assert!(is_gone(&not_found));
        assert!(!is_gone(&server));
    }

    #[test]
    fn unknown_host_scheme_is_rejected() {
        assert!(matches!(
            connect(Some("ssh://builder")),
            Err(CommandError::InvalidConfig(_))
        ));
    }

    #[test]
    fn oversized_limits_are_rejected() {
        let config = Config {
            memory: i64::MAX / 1024,
            ..config("true")
        };
        let err = build_container_config(&config, &settings()).unwrap_err();
        assert!(matches!(err, CommandError::InvalidConfig(_)));
        assert!(err.to_string().contains("memory limit"));

        let config = Config {
            cpu: f64::INFINITY,
            ..self::config("true")
        };
        let err = build_container_config(&config, &settings()).unwrap_err();
        assert!(err.to_string().contains("cpu limit"));
    }

    #[test]
    fn fractional_quota_rounds() {
        assert_eq!(cpu_quota(0.333_333).unwrap(), Some(33_333));
        assert_eq!(cpu_quota(f64::NAN).unwrap(), None);
        assert_eq!(memory_bytes(-1).unwrap(), None);
    }

    // -- cleanup after a failed attach --------------------------------------

    const STUB_CONTAINER: &str = "stub-container";

    fn refusing_attach(method: &Method, path: &str, _body: &Bytes) -> (StatusCode, String) {
        if *method == Method::GET && path.contains("/images/") {
            (StatusCode::OK, "{}".into())
        } else if *method == Method::POST && path.ends_with("/containers/create") {
            (
                StatusCode::CREATED,
                format!(r#"{{"Id":"{STUB_CONTAINER}","Warnings":[]}}"#),
            )
        } else if *method == Method::POST && path.ends_with("/attach") {
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                r#"{"message":"attach refused"}"#.into(),
            )
        } else if *method == Method::DELETE && path.contains("/containers/") {
            (StatusCode::NO_CONTENT, String::new())
        } else {
            (StatusCode::NOT_FOUND, r#"{"message":"no such route"}"#.into())
        }
    }

    async fn stub_engine(stub: &StubApi) -> ContainerEngine {
        let docker = connect(Some(stub.url().as_str())).unwrap();
        let engine = ContainerEngine::new(config("echo hi"), settings(), docker).unwrap();
        engine.stdio().set_stderr(Box::new(tokio::io::sink()));
        engine.stdio().set_stdout(Box::new(tokio::io::sink()));
        engine
    }

    #[tokio::test]
    async fn failed_attach_on_start_removes_container() {
        let stub = StubApi::spawn(refusing_attach).await;
        let engine = stub_engine(&stub).await;

        assert!(engine.start().await.is_err());
        assert_eq!(engine.state(), EngineState::Failed);
        assert!(stub.saw("POST", "/containers/create"), "{:?}", stub.requests());
        assert!(
            stub.saw("DELETE", &format!("/containers/{STUB_CONTAINER}")),
            "container left behind: {:?}",
            stub.requests()
        );
    }

    #[tokio::test]
    async fn failed_attach_on_terminal_removes_container() {
        let stub = StubApi::spawn(refusing_attach).await;
        let engine = stub_engine(&stub).await;

        assert!(engine.terminal().await.is_err());
        assert_eq!(engine.state(), EngineState::Failed);
        assert!(
            stub.saw("DELETE", &format!("/containers/{STUB_CONTAINER}")),
            "container left behind: {:?}",
            stub.requests()
        );
    }
}
