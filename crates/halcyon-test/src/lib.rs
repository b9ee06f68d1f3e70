//! Helpers for setting up integration tests.

#![warn(missing_docs)]
#![warn(unused_must_use)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Path, Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;

pub use tempfile::TempDir;

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from this crate and mutes all other logs.
pub fn setup() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .compact()
        .try_init()
        .ok();
}

/// Creates a temporary directory.
///
/// The directory is deleted when the [`TempDir`] instance is dropped, unless
/// `TempDir::into_path()` is called. Use it as a guard to automatically clean
/// up after tests.
pub fn tempdir() -> TempDir {
    TempDir::new().unwrap()
}

#[derive(Clone)]
struct Payload {
    body: Vec<u8>,
    delay: Option<Duration>,
}

#[derive(Default)]
struct ServerState {
    payloads: Mutex<HashMap<String, Payload>>,
    hits: Mutex<HashMap<String, usize>>,
    accesses: AtomicUsize,
}

async fn hitcounter(
    State(state): State<Arc<ServerState>>,
    request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path().to_owned();
    state.accesses.fetch_add(1, Ordering::SeqCst);
    *state.hits.lock().unwrap().entry(path).or_default() += 1;

    next.run(request).await
}

async fn files(State(state): State<Arc<ServerState>>, Path(path): Path<String>) -> Response {
    let payload = state.payloads.lock().unwrap().get(&path).cloned();
    match payload {
        Some(payload) => {
            if let Some(delay) = payload.delay {
                tokio::time::sleep(delay).await;
            }
            payload.body.into_response()
        }
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn respond_statuscode(Path((status, _tail)): Path<(u16, String)>) -> StatusCode {
    StatusCode::from_u16(status).unwrap()
}

async fn echo_header(headers: HeaderMap) -> Vec<u8> {
    headers
        .get("x-echo-header")
        .map(|value| value.as_bytes().to_vec())
        .unwrap_or_default()
}

/// A local HTTP server serving registered payloads, with hit counting.
///
/// Routes:
///
///  - `/files/<name>`: serves the payload registered under `<name>`, after
///    its optional delay; `404` for unregistered names.
///  - `/respond_statuscode/<status>/<anything>`: responds with the given
///    status code and an empty body.
///  - `/echo_header`: responds with the value of the `x-echo-header` request
///    header.
pub struct Server {
    handle: tokio::task::JoinHandle<()>,
    socket: SocketAddr,
    state: Arc<ServerState>,
}

impl Server {
    /// Spawns the server on a random local port.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new() -> Self {
        let state = Arc::new(ServerState::default());

        let router = Router::new()
            .route("/files/*path", get(files))
            .route("/respond_statuscode/:status/*tail", get(respond_statuscode))
            .route("/echo_header", get(echo_header))
            .layer(middleware::from_fn_with_state(
                Arc::clone(&state),
                hitcounter,
            ))
            .with_state(Arc::clone(&state));

        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.set_nonblocking(true).unwrap();
        let socket = listener.local_addr().unwrap();

        let handle = tokio::spawn(async move {
            let listener = tokio::net::TcpListener::from_std(listener).unwrap();
            axum::serve(listener, router).await.unwrap();
        });

        Self {
            handle,
            socket,
            state,
        }
    }

    /// Returns the full URL for the given path on this server.
    pub fn url(&self, path: &str) -> String {
        let path = path.trim_start_matches('/');
        format!("http://{}/{}", self.socket, path)
    }

    /// Registers a payload to be served under `/files/<name>`.
    pub fn register(&self, name: &str, body: impl Into<Vec<u8>>) {
        self.register_with_delay_opt(name, body, None)
    }

    /// Registers a payload whose response is delayed by `delay`.
    pub fn register_with_delay(&self, name: &str, body: impl Into<Vec<u8>>, delay: Duration) {
        self.register_with_delay_opt(name, body, Some(delay))
    }

    fn register_with_delay_opt(
        &self,
        name: &str,
        body: impl Into<Vec<u8>>,
        delay: Option<Duration>,
    ) {
        self.state.payloads.lock().unwrap().insert(
            name.to_owned(),
            Payload {
                body: body.into(),
                delay,
            },
        );
    }

    /// The number of requests made to the given path (with leading slash).
    pub fn hits(&self, path: &str) -> usize {
        self.state
            .hits
            .lock()
            .unwrap()
            .get(path)
            .copied()
            .unwrap_or_default()
    }

    /// The total number of requests made to this server.
    pub fn accesses(&self) -> usize {
        self.state.accesses.load(Ordering::SeqCst)
    }
}

impl Default for Server {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
