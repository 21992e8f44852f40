//! Agent server: accepts WebSocket connections and runs one command per
//! connection on behalf of a remote [`AgentClient`](super::AgentClient).
//!
//! Each connection gets a [`Worker`]. Frames are decoded in order; stage
//! handlers (`new`, `start`, `wait`, `cancel`) run as their own tasks so a
//! long `wait` never blocks `stdin` or `cancel`. Every stage ends with a
//! `done` event, preceded by an `exitcode` when it failed.

use std::future::Future;
use std::io::{self, Cursor};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use axum::Router;
use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use axum::routing::get;
use futures::{SinkExt, StreamExt};
use tokio::io::AsyncWrite;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::event::{Event, Stage, types};
use crate::command::Command;
use crate::config::Config;
use crate::engine::EngineRegistry;
use crate::error::{CommandError, Result};
use crate::io::lock;

pub const DEFAULT_PORT: u16 = 8080;

#[derive(Debug, Clone)]
pub struct AgentServerOptions {
    pub port: u16,
    pub bind: String,
    /// Route the WebSocket endpoint is served on.
    pub path: String,
}

impl Default for AgentServerOptions {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            bind: "0.0.0.0".to_string(),
            path: "/".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// AgentServer
// ---------------------------------------------------------------------------

pub struct AgentServer {
    options: AgentServerOptions,
    registry: Arc<EngineRegistry>,
    /// Fired once the listener stops; disconnects live sessions.
    stopped: CancellationToken,
}

#[derive(Clone)]
struct ServerState {
    registry: Arc<EngineRegistry>,
    stopped: CancellationToken,
}

impl AgentServer {
    pub fn new(options: AgentServerOptions) -> Self {
        Self {
            options,
            registry: Arc::new(EngineRegistry::builtin()),
            stopped: CancellationToken::new(),
        }
    }

    /// Resolve engines from `registry` instead of the built-in set.
    pub fn with_registry(mut self, registry: Arc<EngineRegistry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn options(&self) -> &AgentServerOptions {
        &self.options
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route(&self.options.path, get(upgrade))
            .with_state(ServerState {
                registry: self.registry.clone(),
                stopped: self.stopped.clone(),
            })
    }

    /// Listen on the configured address until Ctrl-C.
    pub async fn serve(self) -> Result<()> {
        let listener = TcpListener::bind((self.options.bind.as_str(), self.options.port)).await?;
        self.serve_with_listener(listener, shutdown_signal()).await
    }

    /// Serve on an already-bound listener until `shutdown` resolves.
    pub async fn serve_with_listener<F>(self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = listener.local_addr()?;
        info!(%addr, path = %self.options.path, "agent server listening");
        let served = axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown)
            .await;
        self.stopped.cancel();
        served?;
        info!("agent server shut down");
        Ok(())
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "cannot listen for Ctrl-C, serving until killed");
        std::future::pending::<()>().await;
    }
}

async fn upgrade(ws: WebSocketUpgrade, State(state): State<ServerState>) -> Response {
    ws.on_upgrade(move |socket| serve_connection(socket, state))
}

async fn serve_connection(socket: WebSocket, state: ServerState) {
    let ServerState { registry, stopped } = state;
    let session = Uuid::new_v4();
    info!(%session, "agent connection opened");
    let (mut sink, mut stream) = socket.split();
    let (worker, mut events) = Worker::new(registry);

    let writer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let text = match event.encode() {
                Ok(text) => text,
                Err(e) => {
                    warn!(%session, error = %e, "cannot encode agent event");
                    continue;
                }
            };
            if sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    loop {
        let frame = tokio::select! {
            frame = stream.next() => frame,
            _ = stopped.cancelled() => break,
        };
        let Some(frame) = frame else { break };
        let text = match frame {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                debug!(%session, error = %e, "agent connection failed");
                break;
            }
        };
        match Event::decode(text.as_str()) {
            Ok(event) => worker.dispatch(event),
            Err(e) => warn!(%session, error = %e, "skipping undecodable agent event"),
        }
    }

    worker.disconnect();
    drop(worker);
    let _ = writer.await;
    info!(%session, "agent connection closed");
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

type StdinChunk = io::Result<Cursor<Vec<u8>>>;

/// Per-connection dispatcher holding at most one command.
pub struct Worker {
    registry: Arc<EngineRegistry>,
    events: mpsc::UnboundedSender<Event>,
    command: tokio::sync::Mutex<Option<Arc<Command>>>,
    stdin: Mutex<Option<mpsc::UnboundedSender<StdinChunk>>>,
    stdin_reader: Mutex<Option<mpsc::UnboundedReceiver<StdinChunk>>>,
    connection: CancellationToken,
}

impl Worker {
    /// A worker plus the events it emits, in send order.
    pub fn new(registry: Arc<EngineRegistry>) -> (Arc<Self>, mpsc::UnboundedReceiver<Event>) {
        let (events, rx) = mpsc::unbounded_channel();
        let (stdin_tx, stdin_rx) = mpsc::unbounded_channel();
        let worker = Arc::new(Self {
            registry,
            events,
            command: tokio::sync::Mutex::new(None),
            stdin: Mutex::new(Some(stdin_tx)),
            stdin_reader: Mutex::new(Some(stdin_rx)),
            connection: CancellationToken::new(),
        });
        (worker, rx)
    }

    /// Route one decoded event. Stage handlers run on their own tasks.
    pub fn dispatch(self: &Arc<Self>, event: Event) {
        let (stage, config) = match event {
            Event::New(config) => (Stage::New, Some(config)),
            Event::Start => (Stage::Start, None),
            Event::Wait => (Stage::Wait, None),
            Event::Cancel => (Stage::Cancel, None),
            Event::Stdin(data) => {
                self.feed_stdin(data);
                return;
            }
            other => {
                warn!(kind = other.kind(), "ignoring event the server does not handle");
                return;
            }
        };
        let worker = Arc::clone(self);
        tokio::spawn(async move { worker.handle(stage, config).await });
    }

    /// The peer is gone: cancel whatever is running.
    pub fn disconnect(&self) {
        self.connection.cancel();
        lock(&self.stdin).take();
    }

    fn emit(&self, event: Event) {
        if self.events.send(event).is_err() {
            debug!("agent connection already closed, dropping event");
        }
    }

    fn feed_stdin(&self, data: Vec<u8>) {
        let mut stdin = lock(&self.stdin);
        if data.is_empty() {
            stdin.take();
            return;
        }
        if let Some(tx) = stdin.as_ref() {
            let _ = tx.send(Ok(Cursor::new(data)));
        }
    }

    async fn handle(&self, stage: Stage, config: Option<Box<Config>>) {
        debug!(%stage, "handling stage");
        let outcome = match stage {
            Stage::New => self.create(config).await,
            Stage::Start => match self.current(stage).await {
                Ok(command) => command.start().await,
                Err(e) => Err(e),
            },
            Stage::Wait => match self.current(stage).await {
                Ok(command) => command.wait().await.map(|()| self.emit(Event::Exitcode(0))),
                Err(e) => Err(e),
            },
            Stage::Cancel => match self.current(stage).await {
                Ok(command) => command.cancel().await,
                Err(e) => Err(e),
            },
        };
        if let Err(e) = outcome {
            self.report_error(stage, &e);
        }
        self.emit(Event::Done(stage));
    }

    /// The internal `error` path: every failure becomes an exit code.
    fn report_error(&self, stage: Stage, err: &CommandError) {
        let code = err.exit_code().unwrap_or(1);
        debug!(%stage, code, error = %err, signal = types::ERROR, "stage failed");
        self.emit(Event::Exitcode(code));
    }

    async fn current(&self, stage: Stage) -> Result<Arc<Command>> {
        self.command
            .lock()
            .await
            .clone()
            .ok_or_else(|| CommandError::Protocol(format!("[stage:{stage}] command is not created")))
    }

    async fn create(&self, config: Option<Box<Config>>) -> Result<()> {
        let mut slot = self.command.lock().await;
        if slot.is_some() {
            return Err(CommandError::Protocol(
                "[stage:new] command is already created".into(),
            ));
        }
        let mut config = *config.ok_or_else(|| CommandError::Protocol("new without config".into()))?;
        config.agent = None;
        config.cancel = Some(self.connection.child_token());

        let command = Command::with_registry(config, &self.registry).await?;
        command.set_stdout(Box::new(EventWriter::new(Event::Stdout, self.events.clone())));
        command.set_stderr(Box::new(EventWriter::new(Event::Stderr, self.events.clone())));
        if let Some(rx) = lock(&self.stdin_reader).take() {
            command.set_stdin(Box::new(StreamReader::new(UnboundedReceiverStream::new(rx))));
        }
        info!(id = %command.id(), engine = %command.config().engine, "command created");
        *slot = Some(Arc::new(command));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// EventWriter
// ---------------------------------------------------------------------------

/// Wraps every write in an output event.
pub struct EventWriter {
    wrap: fn(Vec<u8>) -> Event,
    events: mpsc::UnboundedSender<Event>,
}

impl EventWriter {
    pub fn new(wrap: fn(Vec<u8>) -> Event, events: mpsc::UnboundedSender<Event>) -> Self {
        Self { wrap, events }
    }
}

impl AsyncWrite for EventWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        let sent = self.events.send((self.wrap)(buf.to_vec()));
        Poll::Ready(match sent {
            Ok(()) => Ok(buf.len()),
            Err(_) => Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "agent connection closed",
            )),
        })
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}
