//! Loopback JSON-RPC bridge.
//!
//! Exposes registered methods to other processes on the same machine over
//! JSON-RPC 2.0 on HTTP.
//!
//! ## Architecture
//!
//! - `coerce`: parameter type schema and wire value coercion
//! - `registry`: method name to schema and handler
//! - `dispatch`: binds params, invokes handlers, builds error responses
//! - `protocol`: JSON-RPC request/response types and fallback encoding
//! - `transport`: HTTP server lifecycle (start with port retry, stop)
//! - `client`: client for calling a running bridge
//! - `builtin`: `rpc.ping`, `rpc.methods` and `rpc.describe`

pub mod builtin;
pub mod client;
pub mod coerce;
pub mod dispatch;
pub mod protocol;
pub mod registry;
pub mod transport;

pub use client::{ClientError, ConnectionFailure, RpcClient};
pub use coerce::{Arg, CoercionError, ParamType, Primitive};
pub use dispatch::{DispatchError, Dispatcher};
pub use protocol::{Request, Response, RpcError};
pub use registry::{Args, MethodRegistry, ParamSpec, RegistryError};
pub use transport::{RPC_PATH, RpcServer, ServerError, ServerStatus};
