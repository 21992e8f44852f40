//! Agent client: drives a command on an agent server over one WebSocket.
//!
//! Each stage (`new`, `start`, `wait`, `cancel`) is sent as an event and then
//! blocks on its own acknowledgement queue. A background reader routes
//! `stdout`/`stderr` into the bound writers and `exitcode`/`done` into queues;
//! a writer task owns the sending half of the socket.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::event::{Event, Stage};
use crate::config::Config;
use crate::engine::{Engine, EngineState, Lifecycle, guard_start};
use crate::error::{CommandError, Result, exit_result};
use crate::io::{BoxReader, BoxWriter, StdioSlots, lock};
use crate::terminal::Terminal;

pub const DEFAULT_SERVER: &str = "ws://localhost:8080";
pub const ACK_TIMEOUT: Duration = Duration::from_secs(30);

/// Engine name reported by [`AgentClient`].
pub const NAME: &str = "agent";

#[derive(Debug, Clone)]
pub struct AgentClientOptions {
    pub server: String,
    /// HTTP basic credentials sent on the handshake.
    pub credentials: Option<(String, String)>,
    /// Bound on the `new`, `start`, and `cancel` acknowledgements.
    pub ack_timeout: Duration,
    /// External cancellation; pending stage waits return `Canceled`.
    pub cancel: Option<CancellationToken>,
}

impl Default for AgentClientOptions {
    fn default() -> Self {
        Self {
            server: DEFAULT_SERVER.to_string(),
            credentials: None,
            ack_timeout: ACK_TIMEOUT,
            cancel: None,
        }
    }
}

impl AgentClientOptions {
    pub fn new(server: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            ..Self::default()
        }
    }

    pub fn with_credentials(mut self, id: impl Into<String>, secret: impl Into<String>) -> Self {
        self.credentials = Some((id.into(), secret.into()));
        self
    }

    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }

    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

fn basic_auth(id: &str, secret: &str) -> Result<HeaderValue> {
    let token = STANDARD.encode(format!("{id}:{secret}"));
    HeaderValue::from_str(&format!("Basic {token}"))
        .map_err(|e| CommandError::InvalidConfig(format!("invalid agent credentials: {e}")))
}

// ---------------------------------------------------------------------------
// Reader task
// ---------------------------------------------------------------------------

/// Output targets handed to the reader task.
struct Outputs {
    stdout: BoxWriter,
    stderr: BoxWriter,
}

struct AckSenders {
    new: mpsc::UnboundedSender<()>,
    start: mpsc::UnboundedSender<()>,
    wait: mpsc::UnboundedSender<()>,
    cancel: mpsc::UnboundedSender<()>,
}

impl AckSenders {
    fn get(&self, stage: Stage) -> &mpsc::UnboundedSender<()> {
        match stage {
            Stage::New => &self.new,
            Stage::Start => &self.start,
            Stage::Wait => &self.wait,
            Stage::Cancel => &self.cancel,
        }
    }
}

struct AckQueues {
    new: tokio::sync::Mutex<mpsc::UnboundedReceiver<()>>,
    start: tokio::sync::Mutex<mpsc::UnboundedReceiver<()>>,
    wait: tokio::sync::Mutex<mpsc::UnboundedReceiver<()>>,
    cancel: tokio::sync::Mutex<mpsc::UnboundedReceiver<()>>,
}

impl AckQueues {
    fn channel() -> (AckSenders, AckQueues) {
        let (new_tx, new_rx) = mpsc::unbounded_channel();
        let (start_tx, start_rx) = mpsc::unbounded_channel();
        let (wait_tx, wait_rx) = mpsc::unbounded_channel();
        let (cancel_tx, cancel_rx) = mpsc::unbounded_channel();
        (
            AckSenders {
                new: new_tx,
                start: start_tx,
                wait: wait_tx,
                cancel: cancel_tx,
            },
            AckQueues {
                new: tokio::sync::Mutex::new(new_rx),
                start: tokio::sync::Mutex::new(start_rx),
                wait: tokio::sync::Mutex::new(wait_rx),
                cancel: tokio::sync::Mutex::new(cancel_rx),
            },
        )
    }

    fn get(&self, stage: Stage) -> &tokio::sync::Mutex<mpsc::UnboundedReceiver<()>> {
        match stage {
            Stage::New => &self.new,
            Stage::Start => &self.start,
            Stage::Wait => &self.wait,
            Stage::Cancel => &self.cancel,
        }
    }
}

async fn read_events<S>(
    mut stream: S,
    mut outputs_rx: mpsc::UnboundedReceiver<Outputs>,
    acks: AckSenders,
    exitcodes: mpsc::UnboundedSender<i32>,
    closed: CancellationToken,
) where
    S: futures::Stream<Item = std::result::Result<Message, tokio_tungstenite::tungstenite::Error>>
        + Unpin,
{
    let mut outputs = Outputs {
        stdout: Box::new(tokio::io::stdout()),
        stderr: Box::new(tokio::io::stderr()),
    };
    loop {
        let frame = tokio::select! {
            biased;
            Some(installed) = outputs_rx.recv() => {
                outputs = installed;
                continue;
            }
            frame = stream.next() => frame,
        };
        let text = match frame {
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                debug!(error = %e, "agent connection failed");
                break;
            }
        };
        let event = match Event::decode(&text) {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, "skipping undecodable agent event");
                continue;
            }
        };
        match event {
            Event::Stdout(data) => {
                let _ = outputs.stdout.write_all(&data).await;
            }
            Event::Stderr(data) => {
                let _ = outputs.stderr.write_all(&data).await;
            }
            Event::Exitcode(code) => {
                debug!(code, "received exit code");
                let _ = exitcodes.send(code);
            }
            Event::Done(stage) => {
                debug!(%stage, "stage acknowledged");
                if stage == Stage::Wait {
                    let _ = outputs.stdout.flush().await;
                    let _ = outputs.stderr.flush().await;
                }
                let _ = acks.get(stage).send(());
            }
            other => debug!(kind = other.kind(), "ignoring unexpected agent event"),
        }
    }
    let _ = outputs.stdout.flush().await;
    let _ = outputs.stderr.flush().await;
    closed.cancel();
}

// ---------------------------------------------------------------------------
// AgentClient
// ---------------------------------------------------------------------------

pub struct AgentClient {
    server: String,
    outgoing: mpsc::UnboundedSender<Message>,
    outputs: mpsc::UnboundedSender<Outputs>,
    acks: AckQueues,
    exitcodes: tokio::sync::Mutex<mpsc::UnboundedReceiver<i32>>,
    closed: CancellationToken,
    external: CancellationToken,
    ack_timeout: Duration,
    stdio: StdioSlots,
    lifecycle: Lifecycle,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl AgentClient {
    /// Connect to `server` with default options.
    pub async fn connect(server: &str) -> Result<Self> {
        Self::connect_with(AgentClientOptions::new(server)).await
    }

    pub async fn connect_with(options: AgentClientOptions) -> Result<Self> {
        if options.server.is_empty() {
            return Err(CommandError::InvalidConfig(
                "agent server address is required".into(),
            ));
        }
        let mut request = options.server.as_str().into_client_request()?;
        if let Some((id, secret)) = &options.credentials {
            request
                .headers_mut()
                .insert(AUTHORIZATION, basic_auth(id, secret)?);
        }

        let (socket, _) = tokio_tungstenite::connect_async(request).await?;
        info!(server = %options.server, "connected to agent");
        let (mut sink, stream) = socket.split();

        let (outgoing, mut outgoing_rx) = mpsc::unbounded_channel::<Message>();
        let writer = tokio::spawn(async move {
            while let Some(message) = outgoing_rx.recv().await {
                if let Err(e) = sink.send(message).await {
                    debug!(error = %e, "agent send failed");
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let (ack_senders, acks) = AckQueues::channel();
        let (exit_tx, exit_rx) = mpsc::unbounded_channel();
        let (outputs, outputs_rx) = mpsc::unbounded_channel();
        let closed = CancellationToken::new();
        let reader = tokio::spawn(read_events(
            stream,
            outputs_rx,
            ack_senders,
            exit_tx,
            closed.clone(),
        ));

        Ok(Self {
            server: options.server,
            outgoing,
            outputs,
            acks,
            exitcodes: tokio::sync::Mutex::new(exit_rx),
            closed,
            external: options.cancel.unwrap_or_else(CancellationToken::new),
            ack_timeout: options.ack_timeout,
            stdio: StdioSlots::default(),
            lifecycle: Lifecycle::new(),
            tasks: Mutex::new(vec![reader, writer]),
        })
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    fn send(&self, event: &Event) -> Result<()> {
        let text = event.encode()?;
        debug!(kind = event.kind(), "sending agent event");
        self.outgoing
            .send(Message::Text(text))
            .map_err(|_| CommandError::ConnectionClosed)
    }

    /// Block until `stage` is acknowledged. Exactly one of acknowledgement,
    /// connection closure, timeout, or external cancellation wins. `wait` has
    /// no timeout since it lasts as long as the command, so a connection that
    /// stays open while the server is dead is only bounded by the caller's
    /// run `timeout` or cancellation token.
    async fn await_ack(&self, stage: Stage) -> Result<()> {
        let mut queue = self.acks.get(stage).lock().await;
        let bounded = stage != Stage::Wait;
        let cancelable = stage != Stage::Cancel;
        tokio::select! {
            biased;
            ack = queue.recv() => ack.ok_or(CommandError::ConnectionClosed),
            _ = self.closed.cancelled() => Err(CommandError::ConnectionClosed),
            _ = self.external.cancelled(), if cancelable => Err(CommandError::Canceled),
            _ = tokio::time::sleep(self.ack_timeout), if bounded => Err(CommandError::AckTimeout {
                stage: stage.to_string(),
            }),
        }
    }

    /// A failed stage is reported as an exit code ahead of its `done`.
    async fn stage_failure(&self) -> Result<()> {
        match self.exitcodes.lock().await.try_recv() {
            Ok(code) => exit_result(code),
            Err(_) => Ok(()),
        }
    }

    async fn round_trip(&self, event: Event, stage: Stage) -> Result<()> {
        self.send(&event)?;
        self.await_ack(stage).await
    }

    /// Ask the server to build a command for `config`.
    pub async fn create(&self, config: &Config) -> Result<()> {
        self.round_trip(Event::New(Box::new(config.forwarded())), Stage::New)
            .await?;
        self.stage_failure().await
    }

    /// Forward bytes to the remote command's stdin. Empty input closes it.
    pub fn send_stdin(&self, data: &[u8]) -> Result<()> {
        self.send(&Event::Stdin(data.to_vec()))
    }

    /// `create`, `start`, then `wait`.
    pub async fn run(&self, config: &Config) -> Result<()> {
        self.create(config).await?;
        self.start().await?;
        self.wait().await
    }

    /// Close the connection.
    pub fn close(&self) {
        let _ = self.outgoing.send(Message::Close(None));
    }

    fn spawn_stdin_pump(&self, mut reader: BoxReader) {
        let outgoing = self.outgoing.clone();
        let pump = tokio::spawn(async move {
            let mut buf = vec![0u8; 8192];
            loop {
                let n = match reader.read(&mut buf).await {
                    Ok(0) | Err(_) => 0,
                    Ok(n) => n,
                };
                let Ok(text) = Event::Stdin(buf[..n].to_vec()).encode() else {
                    break;
                };
                if outgoing.send(Message::Text(text)).is_err() || n == 0 {
                    break;
                }
            }
        });
        lock(&self.tasks).push(pump);
    }

    async fn launch(&self) -> Result<()> {
        let outputs = Outputs {
            stdout: self.stdio.stdout_or_default(),
            stderr: self.stdio.stderr_or_default(),
        };
        self.outputs
            .send(outputs)
            .map_err(|_| CommandError::ConnectionClosed)?;

        self.round_trip(Event::Start, Stage::Start).await?;
        self.stage_failure().await?;

        match self.stdio.take_stdin() {
            Some(reader) => self.spawn_stdin_pump(reader),
            None => self.send_stdin(&[])?,
        }
        Ok(())
    }

    async fn wait_exit(&self) -> Result<i32> {
        {
            let mut stale = self.exitcodes.lock().await;
            while stale.try_recv().is_ok() {}
        }
        self.round_trip(Event::Wait, Stage::Wait).await?;

        let mut exitcodes = self.exitcodes.lock().await;
        tokio::select! {
            biased;
            code = exitcodes.recv() => code.ok_or(CommandError::ConnectionClosed),
            _ = tokio::time::sleep(self.ack_timeout) => Err(CommandError::AckTimeout {
                stage: "exitcode".to_string(),
            }),
        }
    }
}

impl Drop for AgentClient {
    fn drop(&mut self) {
        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
    }
}

#[async_trait]
impl Engine for AgentClient {
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
        let result = self.wait_exit().await.and_then(exit_result);
        self.lifecycle.finish(&result);
        result
    }

    async fn cancel(&self) -> Result<()> {
        if self.lifecycle.cancel() {
            info!(server = %self.server, "canceling remote command");
        }
        if self.closed.is_cancelled() {
            return Ok(());
        }
        match self.round_trip(Event::Cancel, Stage::Cancel).await {
            Err(CommandError::ConnectionClosed) => Ok(()),
            other => other,
        }
    }

    async fn terminal(&self) -> Result<Box<dyn Terminal>> {
        Err(CommandError::Unsupported(
            "terminals are not available through an agent".into(),
        ))
    }
}
