//! Shared test utilities for runbox integration tests.
//!
//! Provides in-process agent servers bound to loopback ports. Each fixture
//! gets its own listener and shuts down when its handle is dropped.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use axum::routing::get;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use runbox_core::agent::{AgentServer, AgentServerOptions, Event, Stage};
use runbox_core::{Config, EngineRegistry};

/// A running test server. Dropping it stops the server.
pub struct ServerHandle {
    pub addr: SocketAddr,
    shutdown: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl ServerHandle {
    /// `ws://` URL of the server root.
    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    /// Stop the server and wait for it to finish.
    pub async fn shutdown(mut self) {
        self.shutdown.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn loopback_listener() -> TcpListener {
    TcpListener::bind("127.0.0.1:0")
        .await
        .expect("failed to bind loopback listener")
}

/// Start an agent server with the built-in engines.
pub async fn spawn_agent_server() -> ServerHandle {
    spawn_agent_server_with(Arc::new(EngineRegistry::builtin())).await
}

/// Start an agent server resolving engines from `registry`.
pub async fn spawn_agent_server_with(registry: Arc<EngineRegistry>) -> ServerHandle {
    let listener = loopback_listener().await;
    let addr = listener.local_addr().expect("listener has no address");
    let shutdown = CancellationToken::new();

    let server = AgentServer::new(AgentServerOptions::default()).with_registry(registry);
    let signal = shutdown.clone();
    let task = tokio::spawn(async move {
        server
            .serve_with_listener(listener, async move { signal.cancelled().await })
            .await
            .expect("agent server failed");
    });

    ServerHandle {
        addr,
        shutdown,
        task: Some(task),
    }
}

async fn swallow(socket: WebSocket) {
    let mut socket = socket;
    while let Some(Ok(_)) = socket.recv().await {}
}

async fn silent_upgrade(ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(swallow)
}

/// Start a WebSocket server that accepts frames and never answers, for
/// acknowledgement-timeout tests.
pub async fn spawn_silent_server() -> ServerHandle {
    let listener = loopback_listener().await;
    let addr = listener.local_addr().expect("listener has no address");
    let shutdown = CancellationToken::new();

    let router = Router::new().route("/", get(silent_upgrade));
    let signal = shutdown.clone();
    let task = tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(async move { signal.cancelled().await })
            .await
            .expect("silent server failed");
    });

    ServerHandle {
        addr,
        shutdown,
        task: Some(task),
    }
}

async fn ack_stages(mut socket: WebSocket, acked: Arc<Vec<Stage>>) {
    while let Some(Ok(frame)) = socket.recv().await {
        let Message::Text(text) = frame else {
            continue;
        };
        let stage = match Event::decode(text.as_str()) {
            Ok(Event::New(_)) => Stage::New,
            Ok(Event::Start) => Stage::Start,
            Ok(Event::Wait) => Stage::Wait,
            Ok(Event::Cancel) => Stage::Cancel,
            _ => continue,
        };
        if !acked.contains(&stage) {
            continue;
        }
        let Ok(reply) = Event::Done(stage).encode() else {
            continue;
        };
        if socket.send(Message::Text(reply.into())).await.is_err() {
            break;
        }
    }
}

/// Start a WebSocket server that answers `done` for the `acked` stages only
/// and stays silent on everything else.
pub async fn spawn_acking_server(acked: &[Stage]) -> ServerHandle {
    let listener = loopback_listener().await;
    let addr = listener.local_addr().expect("listener has no address");
    let shutdown = CancellationToken::new();

    let acked = Arc::new(acked.to_vec());
    let router = Router::new().route(
        "/",
        get(move |ws: WebSocketUpgrade| {
            let acked = Arc::clone(&acked);
            async move { ws.on_upgrade(move |socket| ack_stages(socket, acked)) }
        }),
    );
    let signal = shutdown.clone();
    let task = tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(async move { signal.cancelled().await })
            .await
            .expect("acking server failed");
    });

    ServerHandle {
        addr,
        shutdown,
        task: Some(task),
    }
}

/// A config that runs `command` on the host engine.
pub fn host_config(command: &str) -> Config {
    Config::new(command).with_engine("host")
}
