//! In-process HTTP stand-in for the Docker and Kubernetes APIs.
//!
//! Every request is recorded as `"<METHOD> <path>"` and answered by a plain
//! function, so tests can script failures at a chosen call and then check
//! which cleanup calls followed.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use axum::Router;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{Method, StatusCode, Uri, header};
use axum::response::{IntoResponse, Response};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use crate::io::lock;

/// Answers one request: status plus JSON body.
pub(crate) type Responder = fn(&Method, &str, &Bytes) -> (StatusCode, String);

#[derive(Clone)]
struct StubState {
    responder: Responder,
    requests: Arc<Mutex<Vec<String>>>,
}

async fn handle(State(state): State<StubState>, method: Method, uri: Uri, body: Bytes) -> Response {
    let path = uri.path().to_string();
    lock(&state.requests).push(format!("{method} {path}"));
    let (status, body) = (state.responder)(&method, &path, &body);
    (status, [(header::CONTENT_TYPE, "application/json")], body).into_response()
}

pub(crate) struct StubApi {
    addr: SocketAddr,
    requests: Arc<Mutex<Vec<String>>>,
    task: JoinHandle<()>,
}

impl StubApi {
    pub(crate) async fn spawn(responder: Responder) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let requests = Arc::new(Mutex::new(Vec::new()));
        let router = Router::new().fallback(handle).with_state(StubState {
            responder,
            requests: Arc::clone(&requests),
        });
        let task = tokio::spawn(async move {
            let _ = axum::serve(listener, router).await;
        });
        Self {
            addr,
            requests,
            task,
        }
    }

    pub(crate) fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub(crate) fn requests(&self) -> Vec<String> {
        lock(&self.requests).clone()
    }

    /// Whether a `method` request whose path contains `fragment` arrived.
    pub(crate) fn saw(&self, method: &str, fragment: &str) -> bool {
        let prefix = format!("{method} ");
        self.requests()
            .iter()
            .any(|r| r.starts_with(&prefix) && r.contains(fragment))
    }
}

impl Drop for StubApi {
    fn drop(&mut self) {
        self.task.abort();
    }
}
