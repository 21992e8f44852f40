//! Kubernetes engine: runs the command as a single-pod, never-restarting Job.
//!
//! The Job is created on `start`/`terminal`, not at construction. Output is
//! taken from an attach stream on the Job's pod, or from the pod log when the
//! command finished before the attach could happen.

use std::collections::BTreeMap;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use futures::SinkExt;
use futures::channel::mpsc::Sender as SizeSender;
use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{Container, EnvVar, Pod, PodSpec, PodTemplateSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{
    Api, AttachParams, AttachedProcess, DeleteParams, ListParams, LogParams, PostParams,
    TerminalSize,
};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, ResourceExt};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{Engine, EngineState, Lifecycle, guard_start, release_on_error};
use crate::config::Config;
use crate::error::{CommandError, Result};
use crate::io::{
    BoxReader, BoxWriter, CHUNK_CHANNEL_CAPACITY, ChunkReader, StdioSlots, lock, spawn_chunk_pump,
    spawn_copy,
};
use crate::terminal::Terminal;

pub const NAME: &str = "k8s";

pub const CONTAINER_NAME: &str = "cmd";
pub const DEFAULT_IMAGE: &str = "alpine:latest";
pub const DEFAULT_NAMESPACE: &str = "default";
const DEFAULT_JOB_NAME: &str = "runbox-command";
const MAX_JOB_NAME_LEN: usize = 52;
const JOB_TTL_SECONDS: i32 = 300;
const DEFAULT_ACTIVE_DEADLINE_SECONDS: i64 = 3600;
const POLL_INTERVAL: Duration = Duration::from_millis(500);
const POD_READY_TIMEOUT: Duration = Duration::from_secs(5 * 60);
const JOB_WAIT_TIMEOUT: Duration = Duration::from_secs(60 * 60);
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Derive a Job name from a run ID: lowercase, `_` to `-`, at most 52
/// characters so the `job-name` label stays valid.
pub fn job_name(id: &str) -> String {
    let base = if id.is_empty() { DEFAULT_JOB_NAME } else { id };
    let mut name: String = base
        .to_lowercase()
        .replace('_', "-")
        .chars()
        .take(MAX_JOB_NAME_LEN)
        .collect();
    while name.ends_with('-') {
        name.pop();
    }
    name
}

/// Active deadline: the explicit job timeout, else the run timeout, else an
/// hour.
fn active_deadline_seconds(config: &Config) -> i64 {
    config
        .k8s_job_timeout_seconds
        .filter(|s| *s > 0)
        .or_else(|| {
            config
                .timeout
                .map(|t| t.as_secs().max(1) as i64)
        })
        .unwrap_or(DEFAULT_ACTIVE_DEADLINE_SECONDS)
}

fn image(config: &Config) -> String {
    [&config.k8s_image, &config.image]
        .into_iter()
        .flatten()
        .find(|i| !i.is_empty())
        .cloned()
        .unwrap_or_else(|| DEFAULT_IMAGE.to_string())
}

/// The Job manifest for one run.
pub fn build_job(config: &Config, name: &str, image: &str) -> Job {
    let mut env: BTreeMap<String, String> = config.allowed_system_environment();
    env.extend(config.environment.clone());
    let env = env
        .into_iter()
        .map(|(name, value)| EnvVar {
            name,
            value: Some(value),
            ..Default::default()
        })
        .collect();

    let script = if config.command.is_empty() {
        "sleep 0".to_string()
    } else {
        config.command.clone()
    };

    let container = Container {
        name: CONTAINER_NAME.to_string(),
        image: Some(image.to_string()),
        command: Some(vec![config.shell.clone()]),
        args: Some(vec!["-c".to_string(), script]),
        env: Some(env),
        working_dir: config.workdir.clone().filter(|w| !w.is_empty()),
        stdin: Some(true),
        stdin_once: Some(true),
        tty: Some(true),
        ..Default::default()
    };

    Job {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(BTreeMap::from([(
                "app.kubernetes.io/managed-by".to_string(),
                "runbox".to_string(),
            )])),
            ..Default::default()
        },
        spec: Some(JobSpec {
            backoff_limit: Some(0),
            active_deadline_seconds: Some(active_deadline_seconds(config)),
            ttl_seconds_after_finished: Some(JOB_TTL_SECONDS),
            template: PodTemplateSpec {
                metadata: None,
                spec: Some(PodSpec {
                    restart_policy: Some("Never".to_string()),
                    containers: vec![container],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// How far a Job pod has got, as far as attaching is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PodProgress {
    Pending,
    /// Running with the command container ready.
    Running,
    /// Already succeeded or failed.
    Terminated,
}

pub(crate) fn pod_progress(pod: &Pod) -> PodProgress {
    let Some(status) = pod.status.as_ref() else {
        return PodProgress::Pending;
    };
    match status.phase.as_deref() {
        Some("Succeeded" | "Failed") => PodProgress::Terminated,
        Some("Running") => {
            let ready = status
                .container_statuses
                .iter()
                .flatten()
                .any(|c| c.name == CONTAINER_NAME && c.ready);
            if ready {
                PodProgress::Running
            } else {
                PodProgress::Pending
            }
        }
        _ => PodProgress::Pending,
    }
}

/// Exit code of the terminated command container, if it has terminated.
pub(crate) fn container_exit_code(pod: &Pod) -> Option<i32> {
    pod.status
        .as_ref()?
        .container_statuses
        .iter()
        .flatten()
        .find(|c| c.name == CONTAINER_NAME)?
        .state
        .as_ref()?
        .terminated
        .as_ref()
        .map(|t| t.exit_code)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum JobOutcome {
    Complete,
    Failed(String),
}

pub(crate) fn job_outcome(job: &Job) -> Option<JobOutcome> {
    let conditions = job.status.as_ref()?.conditions.as_ref()?;
    conditions
        .iter()
        .filter(|c| c.status == "True")
        .find_map(|c| match c.type_.as_str() {
            "Complete" => Some(JobOutcome::Complete),
            "Failed" => Some(JobOutcome::Failed(
                c.reason.clone().unwrap_or_else(|| "unknown".to_string()),
            )),
            _ => None,
        })
}

fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(e) if e.code == 404)
}

fn job_exit(name: &str, code: i32) -> Result<()> {
    if code == 0 {
        return Ok(());
    }
    Err(CommandError::Exit {
        code,
        message: format!("job {name} exited with status {code}"),
    })
}

/// Client from an explicit kubeconfig, else `KUBECONFIG`, else in-cluster.
async fn client(config: &Config) -> Result<Client> {
    let explicit = config.k8s_kubeconfig.clone().filter(|p| !p.is_empty());
    let from_env = std::env::var("KUBECONFIG").is_ok_and(|v| !v.is_empty());
    let options = KubeConfigOptions::default();

    let kube_config = if let Some(path) = explicit {
        let kubeconfig = Kubeconfig::read_from(&path).map_err(|e| {
            CommandError::InvalidConfig(format!("cannot read kubeconfig {path}: {e}"))
        })?;
        kube::Config::from_custom_kubeconfig(kubeconfig, &options)
            .await
            .map_err(|e| CommandError::backend(NAME, format!("build config: {e}")))?
    } else if from_env {
        kube::Config::from_kubeconfig(&options)
            .await
            .map_err(|e| CommandError::backend(NAME, format!("build config: {e}")))?
    } else {
        kube::Config::incluster()
            .map_err(|e| CommandError::backend(NAME, format!("build config: {e}")))?
    };
    Ok(Client::try_from(kube_config)?)
}

// ---------------------------------------------------------------------------
// JobHandle
// ---------------------------------------------------------------------------

/// The API calls one Job run needs, shared by the engine and its terminal.
#[derive(Clone)]
struct JobHandle {
    jobs: Api<Job>,
    pods: Api<Pod>,
    name: String,
}

impl JobHandle {
    fn selector(&self) -> ListParams {
        ListParams::default().labels(&format!("job-name={}", self.name))
    }

    async fn create(&self, job: &Job) -> Result<()> {
        self.jobs.create(&PostParams::default(), job).await?;
        info!(engine = NAME, job = %self.name, "job created");
        Ok(())
    }

    /// Poll until the Job's pod is attachable or already finished.
    async fn wait_for_pod(&self, canceled: &CancellationToken) -> Result<Pod> {
        let deadline = Instant::now() + POD_READY_TIMEOUT;
        loop {
            let pods = self.pods.list(&self.selector()).await?;
            if let Some(pod) = pods
                .items
                .into_iter()
                .find(|p| pod_progress(p) != PodProgress::Pending)
            {
                return Ok(pod);
            }
            if Instant::now() >= deadline {
                return Err(CommandError::backend(
                    NAME,
                    format!("pod for job {} not ready after {POD_READY_TIMEOUT:?}", self.name),
                ));
            }
            tokio::select! {
                _ = canceled.cancelled() => return Err(CommandError::Canceled),
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
            }
        }
    }

    async fn attach(&self, pod: &str, stdin: bool) -> Result<AttachedProcess> {
        let params = AttachParams {
            stdin,
            ..AttachParams::interactive_tty().container(CONTAINER_NAME)
        };
        Ok(self.pods.attach(pod, &params).await?)
    }

    async fn logs(&self, pod: &str) -> Result<String> {
        let params = LogParams {
            container: Some(CONTAINER_NAME.to_string()),
            ..Default::default()
        };
        Ok(self.pods.logs(pod, &params).await?)
    }

    /// Poll the Job until it completes or fails, then read the command's
    /// exit code from its pod.
    async fn wait_exit(&self) -> Result<i32> {
        let deadline = Instant::now() + JOB_WAIT_TIMEOUT;
        let outcome = loop {
            let job = self.jobs.get(&self.name).await?;
            if let Some(outcome) = job_outcome(&job) {
                break outcome;
            }
            if Instant::now() >= deadline {
                return Err(CommandError::backend(
                    NAME,
                    format!("job {} still running after {JOB_WAIT_TIMEOUT:?}", self.name),
                ));
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        };

        let pods = self.pods.list(&self.selector()).await?;
        let code = pods.items.first().and_then(container_exit_code);
        match (outcome, code) {
            (_, Some(code)) => Ok(code),
            (JobOutcome::Complete, None) => Ok(0),
            (JobOutcome::Failed(reason), None) => Err(CommandError::backend(
                NAME,
                format!("job {} failed: {reason}", self.name),
            )),
        }
    }

    /// Delete the Job and, through foreground propagation, its pod.
    async fn delete(&self) -> Result<()> {
        match self.jobs.delete(&self.name, &DeleteParams::foreground()).await {
            Ok(_) => {
                debug!(engine = NAME, job = %self.name, "job deleted");
                Ok(())
            }
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// K8sEngine
// ---------------------------------------------------------------------------

pub struct K8sEngine {
    config: Config,
    job: JobHandle,
    image: String,
    stdio: StdioSlots,
    lifecycle: Lifecycle,
    created: AtomicBool,
    output_pump: Mutex<Option<JoinHandle<()>>>,
    canceled: CancellationToken,
}

impl K8sEngine {
    pub async fn new(config: Config) -> Result<Self> {
        let client = client(&config).await?;
        Ok(Self::with_client(config, client))
    }

    /// Build the engine on an existing API client.
    pub fn with_client(config: Config, client: Client) -> Self {
        let namespace = config
            .k8s_namespace
            .clone()
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| DEFAULT_NAMESPACE.to_string());
        let job = JobHandle {
            jobs: Api::namespaced(client.clone(), &namespace),
            pods: Api::namespaced(client, &namespace),
            name: job_name(&config.id),
        };
        Self {
            image: image(&config),
            config,
            job,
            stdio: StdioSlots::default(),
            lifecycle: Lifecycle::new(),
            created: AtomicBool::new(false),
            output_pump: Mutex::new(None),
            canceled: CancellationToken::new(),
        }
    }

    pub fn job_name(&self) -> &str {
        &self.job.name
    }

    async fn create_job(&self) -> Result<()> {
        let manifest = build_job(&self.config, &self.job.name, &self.image);
        self.job.create(&manifest).await?;
        self.created.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Create the Job and run `step` against it. The Job is deleted again if
    /// `step` fails, since a failed start never reaches `cancel`.
    async fn with_job<T>(&self, step: impl std::future::Future<Output = Result<T>>) -> Result<T> {
        self.create_job().await?;
        release_on_error(NAME, step, self.job.delete()).await
    }

    /// Wait for the pod and wire its output to `stdout`. Returns the pod name.
    async fn stream_output(&self, stdout: BoxWriter, stdin: Option<BoxReader>) -> Result<String> {
        let pod = self.job.wait_for_pod(&self.canceled).await?;
        let pod_name = pod.name_any();

        let pump = match pod_progress(&pod) {
            PodProgress::Terminated => {
                debug!(engine = NAME, pod = %pod_name, "pod already finished, reading logs");
                let logs = self.job.logs(&pod_name).await?;
                tokio::spawn(write_logs(logs, stdout))
            }
            _ => {
                let mut attached = self.job.attach(&pod_name, stdin.is_some()).await?;
                let output = attached
                    .stdout()
                    .ok_or_else(|| CommandError::backend(NAME, "attach stream has no stdout"))?;
                if let (Some(reader), Some(input)) = (stdin, attached.stdin()) {
                    spawn_copy(reader, input);
                }
                tokio::spawn(async move {
                    let (mut output, mut stdout) = (output, stdout);
                    if let Err(e) = tokio::io::copy(&mut output, &mut stdout).await {
                        debug!(engine = NAME, error = %e, "attach stream ended");
                    }
                    let _ = stdout.flush().await;
                    if let Err(e) = attached.join().await {
                        debug!(engine = NAME, error = %e, "attach session closed with error");
                    }
                })
            }
        };
        *lock(&self.output_pump) = Some(pump);
        Ok(pod_name)
    }

    async fn launch(&self) -> Result<()> {
        let stdout = self.stdio.stdout_or_default();
        let stdin = self.stdio.take_stdin();
        let pod_name = self.with_job(self.stream_output(stdout, stdin)).await?;
        info!(engine = NAME, job = %self.job.name, pod = %pod_name, "job running");
        Ok(())
    }

    async fn open_terminal(&self) -> Result<K8sTerminal> {
        let pod = self.job.wait_for_pod(&self.canceled).await?;
        let pod_name = pod.name_any();
        let (tx, rx) = mpsc::channel(CHUNK_CHANNEL_CAPACITY);

        if pod_progress(&pod) == PodProgress::Terminated {
            let logs = self.job.logs(&pod_name).await?;
            let _ = tx.send(logs.into_bytes()).await;
            return Ok(K8sTerminal {
                job: self.job.clone(),
                input: tokio::sync::Mutex::new(None),
                sizes: tokio::sync::Mutex::new(None),
                output: ChunkReader::new(rx),
                session: Mutex::new(None),
                exit_code: OnceLock::new(),
                read_only: self.config.read_only,
            });
        }

        let mut attached = self.job.attach(&pod_name, true).await?;
        let output = attached
            .stdout()
            .ok_or_else(|| CommandError::backend(NAME, "attach stream has no stdout"))?;
        let input = attached
            .stdin()
            .map(|w| Box::new(w) as Box<dyn AsyncWrite + Send + Unpin>);
        let sizes = attached.terminal_size();

        spawn_chunk_pump(output, tx);

        Ok(K8sTerminal {
            job: self.job.clone(),
            input: tokio::sync::Mutex::new(input),
            sizes: tokio::sync::Mutex::new(sizes),
            output: ChunkReader::new(rx),
            session: Mutex::new(Some(attached)),
            exit_code: OnceLock::new(),
            read_only: self.config.read_only,
        })
    }

    async fn drain_output(&self) {
        let pump = lock(&self.output_pump).take();
        if let Some(pump) = pump {
            if tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, pump).await.is_err() {
                debug!(engine = NAME, "output still streaming after job finished");
            }
        }
    }
}

async fn write_logs(logs: String, mut out: BoxWriter) {
    let _ = out.write_all(logs.as_bytes()).await;
    let _ = out.flush().await;
}

#[async_trait]
impl Engine for K8sEngine {
    fn name(&self) -> &str {
        NAME
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
        if !self.created.load(Ordering::SeqCst) {
            return Err(CommandError::State("job has not been started".into()));
        }
        let outcome = tokio::select! {
            biased;
            _ = self.canceled.cancelled() => Err(CommandError::Canceled),
            code = self.job.wait_exit() => code,
        };
        let result = match outcome {
            Ok(code) => {
                self.drain_output().await;
                job_exit(&self.job.name, code)
            }
            Err(e) => Err(e),
        };
        self.lifecycle.finish(&result);
        result
    }

    async fn cancel(&self) -> Result<()> {
        if self.lifecycle.cancel() {
            info!(engine = NAME, job = %self.job.name, "canceling job");
        }
        self.canceled.cancel();
        if let Some(pump) = lock(&self.output_pump).take() {
            pump.abort();
        }
        if !self.created.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.job.delete().await
    }

    async fn terminal(&self) -> Result<Box<dyn Terminal>> {
        self.lifecycle.transition(EngineState::Running)?;
        let opened = self.with_job(self.open_terminal());
        let terminal = guard_start(&self.lifecycle, opened).await?;
        Ok(Box::new(terminal))
    }
}

// ---------------------------------------------------------------------------
// K8sTerminal
// ---------------------------------------------------------------------------

struct K8sTerminal {
    job: JobHandle,
    /// Serializes interleaved writers.
    input: tokio::sync::Mutex<Option<Box<dyn AsyncWrite + Send + Unpin>>>,
    sizes: tokio::sync::Mutex<Option<SizeSender<TerminalSize>>>,
    output: ChunkReader,
    session: Mutex<Option<AttachedProcess>>,
    exit_code: OnceLock<i32>,
    read_only: bool,
}

#[async_trait]
impl Terminal for K8sTerminal {
    async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.output.read(buf).await
    }

    async fn write(&self, data: &[u8]) -> io::Result<usize> {
        if self.read_only {
            return Ok(0);
        }
        let mut input = self.input.lock().await;
        let pipe = input
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "terminal input closed"))?;
        pipe.write_all(data).await?;
        pipe.flush().await?;
        Ok(data.len())
    }

    async fn resize(&self, rows: u16, cols: u16) -> Result<()> {
        let mut sizes = self.sizes.lock().await;
        let Some(sender) = sizes.as_mut() else {
            return Ok(());
        };
        sender
            .send(TerminalSize {
                width: cols,
                height: rows,
            })
            .await
            .map_err(|e| CommandError::backend(NAME, format!("resize: {e}")))
    }

    async fn wait(&self) -> Result<()> {
        let code = self.job.wait_exit().await?;
        let _ = self.exit_code.set(code);
        job_exit(&self.job.name, code)
    }

    fn exit_code(&self) -> Option<i32> {
        self.exit_code.get().copied()
    }

    async fn close(&self) -> Result<()> {
        if let Some(mut input) = self.input.lock().await.take() {
            let _ = input.shutdown().await;
        }
        if let Some(session) = lock(&self.session).take() {
            session.abort();
        }
        self.job.delete().await
    }
}
