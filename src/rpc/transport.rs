//! HTTP transport for the RPC server.
//!
//! Serves JSON-RPC on a single `POST /rpc` endpoint bound to a loopback
//! address. Each connection is handled in its own task and every request is
//! dispatched on the blocking pool, so slow handlers do not stall the accept
//! loop.
//!
//! Lifecycle state lives behind an async mutex held only for the state
//! change itself. A second `transition` lock orders start and stop, so a
//! `start()` issued while the previous listener drains waits for the port
//! instead of racing it, while `status()` answers immediately.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    body::{Body, Bytes},
    extract::State,
    http::{HeaderValue, header},
    response::IntoResponse,
    routing::post,
};
use serde_json::Value;
use tokio::net::{TcpListener, TcpSocket};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::builtin;
use super::dispatch::Dispatcher;
use super::protocol::{EncodeStage, Request, Response};
use super::registry::MethodRegistry;
use crate::config::ServerConfig;

/// Path of the single JSON-RPC endpoint.
pub const RPC_PATH: &str = "/rpc";

const LISTEN_BACKLOG: u32 = 128;

/// Errors surfaced by server lifecycle operations.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("server is already running on {addr}")]
    AlreadyRunning { addr: SocketAddr },

    #[error("no port available on {host}: tried {ports:?} (last error: {last_error})")]
    PortUnavailable {
        host: std::net::IpAddr,
        ports: Vec<u16>,
        last_error: std::io::Error,
    },

    #[error("failed to install built-in methods: {0}")]
    Builtins(#[from] super::registry::RegistryError),
}

/// Snapshot of the lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerStatus {
    pub running: bool,
    pub addr: Option<SocketAddr>,
}

struct Running {
    addr: SocketAddr,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct ServerState {
    running: Option<Running>,
}

impl ServerState {
    /// Forget a listener whose task already ended on its own.
    fn reap(&mut self) {
        if self.running.as_ref().is_some_and(|r| r.task.is_finished()) {
            if let Some(running) = self.running.take() {
                warn!(addr = %running.addr, "RPC listener had stopped unexpectedly");
            }
        }
    }
}

struct Endpoint {
    dispatcher: Dispatcher,
    max_body_bytes: usize,
}

/// Loopback JSON-RPC server.
pub struct RpcServer {
    config: ServerConfig,
    endpoint: Arc<Endpoint>,
    state: Mutex<ServerState>,
    transition: Mutex<()>,
}

impl RpcServer {
    /// Create a stopped server. Built-in `rpc.*` methods are added to `registry`,
    /// which is then frozen.
    pub fn new(config: ServerConfig, mut registry: MethodRegistry) -> Result<Self, ServerError> {
        builtin::install(&mut registry)?;
        let endpoint = Endpoint {
            dispatcher: Dispatcher::new(Arc::new(registry)),
            max_body_bytes: config.max_body_bytes,
        };

        Ok(Self {
            config,
            endpoint: Arc::new(endpoint),
            state: Mutex::new(ServerState::default()),
            transition: Mutex::new(()),
        })
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.endpoint.dispatcher
    }

    /// Bind the first free candidate port and start serving in the background.
    ///
    /// Returns the bound address.
    pub async fn start(&self) -> Result<SocketAddr, ServerError> {
        let _transition = self.transition.lock().await;
        let mut state = self.state.lock().await;
        state.reap();

        if let Some(running) = &state.running {
            return Err(ServerError::AlreadyRunning { addr: running.addr });
        }

        let (listener, addr) = self.bind()?;
        let shutdown = CancellationToken::new();

        let app = Router::new()
            .route(RPC_PATH, post(handle_rpc))
            .with_state(self.endpoint.clone());

        let signal = shutdown.clone();
        let task = tokio::spawn(async move {
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move { signal.cancelled().await })
                .await;
            match result {
                Ok(()) => debug!(addr = %addr, "RPC listener closed"),
                Err(e) => error!(addr = %addr, error = %e, "RPC server failed"),
            }
        });

        info!(addr = %addr, "RPC server listening");
        state.running = Some(Running {
            addr,
            shutdown,
            task,
        });
        Ok(addr)
    }

    fn bind(&self) -> Result<(TcpListener, SocketAddr), ServerError> {
        let candidates = self.config.candidate_addrs();
        let mut last_error = None;

        for addr in &candidates {
            match bind_reusable(*addr) {
                Ok(listener) => {
                    let bound = listener.local_addr().unwrap_or(*addr);
                    return Ok((listener, bound));
                }
                Err(e) => {
                    warn!(addr = %addr, error = %e, "Port unavailable, trying next");
                    last_error = Some(e);
                }
            }
        }

        Err(ServerError::PortUnavailable {
            host: self.config.host,
            ports: candidates.iter().map(SocketAddr::port).collect(),
            last_error: last_error
                .unwrap_or_else(|| std::io::Error::other("no candidate ports configured")),
        })
    }

    /// Stop serving. A no-op when the server is not running.
    ///
    /// In-flight requests get the configured grace period to finish; after
    /// that the listener task is aborted.
    pub async fn stop(&self) {
        let _transition = self.transition.lock().await;
        let Some(running) = self.state.lock().await.running.take() else {
            return;
        };

        // Reported as stopped from here on; the drain happens without the state lock.
        running.shutdown.cancel();
        shutdown_task(running.task, self.config.shutdown_grace).await;
        info!(addr = %running.addr, "RPC server stopped");
    }

    pub async fn status(&self) -> ServerStatus {
        let mut state = self.state.lock().await;
        state.reap();
        ServerStatus {
            running: state.running.is_some(),
            addr: state.running.as_ref().map(|r| r.addr),
        }
    }

    pub async fn is_running(&self) -> bool {
        self.status().await.running
    }

    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.status().await.addr
    }
}

impl Drop for RpcServer {
    fn drop(&mut self) {
        if let Some(running) = self.state.get_mut().running.take() {
            running.shutdown.cancel();
            running.task.abort();
        }
    }
}

async fn shutdown_task(mut task: JoinHandle<()>, grace: Duration) {
    if tokio::time::timeout(grace, &mut task).await.is_err() {
        warn!(grace_ms = grace.as_millis() as u64, "Graceful shutdown timed out, aborting listener");
        task.abort();
        let _ = task.await;
    }
}

fn bind_reusable(addr: SocketAddr) -> std::io::Result<TcpListener> {
    let socket = match addr {
        SocketAddr::V4(_) => TcpSocket::new_v4()?,
        SocketAddr::V6(_) => TcpSocket::new_v6()?,
    };
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    socket.listen(LISTEN_BACKLOG)
}

/// `POST /rpc` handler. Always answers with a JSON-RPC body.
async fn handle_rpc(State(endpoint): State<Arc<Endpoint>>, body: Body) -> impl IntoResponse {
    let response = match axum::body::to_bytes(body, endpoint.max_body_bytes).await {
        Ok(bytes) => process(&endpoint, bytes).await,
        Err(e) => {
            warn!(error = %e, "Failed to read request body");
            Response::parse_error(format!("failed to read request body: {}", e))
        }
    };

    let encoded = response.encode();
    if encoded.stage != EncodeStage::Full {
        warn!(stage = ?encoded.stage, "Sent fallback response");
    }

    (
        [(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        )],
        encoded.bytes,
    )
}

async fn process(endpoint: &Endpoint, bytes: Bytes) -> Response {
    let request = match Request::from_slice(&bytes) {
        Ok(request) => request,
        Err(e) => {
            warn!(error = %e, "Rejected request");
            return e.into_response();
        }
    };

    let id = request.id.clone().unwrap_or(Value::Null);
    let method = request.method.clone();
    debug!(method = %method, "RPC call");

    let dispatcher = endpoint.dispatcher.clone();
    match tokio::task::spawn_blocking(move || dispatcher.dispatch(request)).await {
        Ok(response) => {
            if let Some(code) = response.error_code() {
                debug!(method = %method, code, "RPC call failed");
            }
            response
        }
        Err(e) => {
            error!(method = %method, error = %e, "Dispatch task failed");
            Response::internal_error(id, format!("Internal error while executing '{}'", method))
        }
    }
}
