//! RPC client for calling the bridge from another process.
//!
//! Every call opens its own HTTP connection, with pooling disabled, and the
//! connection is released before the call returns, whatever the outcome.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;

use super::builtin;
use super::protocol::{Reply, Request, RpcError, decode_reply};
use super::transport::RPC_PATH;
use crate::config::ClientConfig;

/// What went wrong at the transport level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionFailure {
    Refused,
    TimedOut,
    Reset,
    Other,
}

impl std::fmt::Display for ConnectionFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            ConnectionFailure::Refused => "connection refused",
            ConnectionFailure::TimedOut => "timed out",
            ConnectionFailure::Reset => "connection reset",
            ConnectionFailure::Other => "transport error",
        };
        f.write_str(text)
    }
}

/// Error returned by RPC client operations.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// Could not reach the server, or the exchange broke off.
    #[error("failed to reach bridge at {addr}: {kind} ({detail})")]
    ConnectionFailed {
        addr: SocketAddr,
        kind: ConnectionFailure,
        detail: String,
    },
    /// Failed to build the HTTP client
    #[error("failed to set up client: {0}")]
    Setup(String),
    /// Failed to serialize request
    #[error("failed to serialize request: {0}")]
    Serialize(serde_json::Error),
    /// Response was not a JSON-RPC response
    #[error("failed to decode response (HTTP {status}): {detail}")]
    Decode { status: u16, detail: String },
    /// Result did not have the expected shape
    #[error("unexpected result shape: {0}")]
    Result(serde_json::Error),
    /// Server returned an error
    #[error("RPC error {}: {}", .0.code, .0.message)]
    Rpc(RpcError),
}

impl ClientError {
    pub fn is_connection_failure(&self) -> bool {
        matches!(self, ClientError::ConnectionFailed { .. })
    }

    pub fn connection_failure(&self) -> Option<ConnectionFailure> {
        match self {
            ClientError::ConnectionFailed { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}

/// RPC client for communicating with a running bridge.
#[derive(Debug)]
pub struct RpcClient {
    addr: SocketAddr,
    url: String,
    http: reqwest::Client,
    next_id: AtomicU64,
    open: Arc<AtomicUsize>,
}

impl RpcClient {
    /// Create a client for the server at `config.addr()`.
    pub fn new(config: &ClientConfig) -> Result<Self, ClientError> {
        Self::with_addr(config.addr(), config)
    }

    fn with_addr(addr: SocketAddr, config: &ClientConfig) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder()
            .no_proxy()
            .pool_max_idle_per_host(0)
            .connect_timeout(config.timeout)
            .timeout(config.timeout)
            .build()
            .map_err(|e| ClientError::Setup(e.to_string()))?;

        Ok(Self {
            addr,
            url: format!("http://{}{}", addr, RPC_PATH),
            http,
            next_id: AtomicU64::new(1),
            open: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Find a running server by pinging each candidate port in order.
    pub async fn discover(config: &ClientConfig) -> Result<Self, ClientError> {
        let mut last_error = None;
        for addr in config.candidate_addrs() {
            let client = Self::with_addr(addr, config)?;
            match client.call_value(builtin::PING, None).await {
                Ok(_) => {
                    debug!(addr = %addr, "Found bridge");
                    return Ok(client);
                }
                Err(e) => {
                    debug!(addr = %addr, error = %e, "No bridge on candidate port");
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| ClientError::ConnectionFailed {
            addr: config.addr(),
            kind: ConnectionFailure::Other,
            detail: "no candidate ports".to_string(),
        }))
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Connections currently held open by in-flight calls.
    pub fn open_connections(&self) -> usize {
        self.open.load(Ordering::SeqCst)
    }

    /// Call an RPC method and return the result.
    pub async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<T, ClientError> {
        let result = self.call_value(method, params).await?;
        serde_json::from_value(result).map_err(ClientError::Result)
    }

    /// Call an RPC method with no parameters.
    pub async fn call_no_params<T: DeserializeOwned>(
        &self,
        method: &str,
    ) -> Result<T, ClientError> {
        self.call(method, None).await
    }

    /// Call an RPC method and return the raw result value.
    pub async fn call_value(&self, method: &str, params: Option<Value>) -> Result<Value, ClientError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = Request::new(method, params, Value::from(id));
        let body = serde_json::to_vec(&request).map_err(ClientError::Serialize)?;

        debug!(addr = %self.addr, method, id, "RPC call");
        let connection = Connection::open(self, body).await?;
        let (status, bytes) = connection.read_to_end().await?;

        match decode_reply(&bytes) {
            Ok(Reply::Result { result, .. }) => Ok(result),
            Ok(Reply::Error { error, .. }) => Err(ClientError::Rpc(error)),
            Err(detail) => Err(ClientError::Decode { status, detail }),
        }
    }

    fn transport_error(&self, err: reqwest::Error) -> ClientError {
        ClientError::ConnectionFailed {
            addr: self.addr,
            kind: classify(&err),
            detail: error_chain(&err),
        }
    }
}

/// One HTTP exchange. Counted in [`RpcClient::open_connections`] until dropped.
struct Connection<'a> {
    client: &'a RpcClient,
    response: reqwest::Response,
    _guard: OpenGuard,
}

struct OpenGuard(Arc<AtomicUsize>);

impl OpenGuard {
    fn acquire(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter.clone())
    }
}

impl Drop for OpenGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl<'a> Connection<'a> {
    async fn open(client: &'a RpcClient, body: Vec<u8>) -> Result<Self, ClientError> {
        let guard = OpenGuard::acquire(&client.open);
        let response = client
            .http
            .post(&client.url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .header(reqwest::header::CONNECTION, "close")
            .body(body)
            .send()
            .await
            .map_err(|e| client.transport_error(e))?;

        Ok(Self {
            client,
            response,
            _guard: guard,
        })
    }

    /// Read the whole body. Consumes the connection, releasing it on return.
    async fn read_to_end(self) -> Result<(u16, Vec<u8>), ClientError> {
        let status = self.response.status().as_u16();
        let bytes = self
            .response
            .bytes()
            .await
            .map_err(|e| self.client.transport_error(e))?;
        Ok((status, bytes.to_vec()))
    }
}

/// Map a reqwest error onto a [`ConnectionFailure`].
fn classify(err: &reqwest::Error) -> ConnectionFailure {
    if err.is_timeout() {
        return ConnectionFailure::TimedOut;
    }
    if let Some(kind) = io_error_kind(err) {
        let failure = classify_io(kind);
        if failure != ConnectionFailure::Other {
            return failure;
        }
    }
    if err.is_connect() {
        return ConnectionFailure::Refused;
    }
    // Connected, then the peer went away before a full response arrived.
    if err.is_request() || err.is_body() {
        return ConnectionFailure::Reset;
    }
    ConnectionFailure::Other
}

/// Map an I/O error kind onto a [`ConnectionFailure`].
pub fn classify_io(kind: std::io::ErrorKind) -> ConnectionFailure {
    use std::io::ErrorKind;

    match kind {
        ErrorKind::ConnectionRefused => ConnectionFailure::Refused,
        ErrorKind::TimedOut | ErrorKind::WouldBlock => ConnectionFailure::TimedOut,
        ErrorKind::ConnectionReset
        | ErrorKind::ConnectionAborted
        | ErrorKind::BrokenPipe
        | ErrorKind::UnexpectedEof => ConnectionFailure::Reset,
        _ => ConnectionFailure::Other,
    }
}

fn io_error_kind(err: &reqwest::Error) -> Option<std::io::ErrorKind> {
    let mut source: Option<&(dyn std::error::Error + 'static)> = std::error::Error::source(err);
    while let Some(cause) = source {
        if let Some(io) = cause.downcast_ref::<std::io::Error>() {
            return Some(io.kind());
        }
        source = cause.source();
    }
    None
}

fn error_chain(err: &reqwest::Error) -> String {
    let mut parts = vec![err.to_string()];
    let mut source = std::error::Error::source(err);
    while let Some(cause) = source {
        parts.push(cause.to_string());
        source = cause.source();
    }
    parts.join(": ")
}
