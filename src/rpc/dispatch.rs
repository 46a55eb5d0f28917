//! Request dispatch.
//!
//! Resolves the method, binds and coerces parameters against its schema,
//! invokes the handler and turns every failure into a structured error
//! response. Nothing raised by a handler crosses this boundary.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use serde_json::{Map, Value, json};
use tracing::{debug, warn};

use super::coerce::{Arg, CoercionError, coerce, describe_value};
use super::protocol::{INTERNAL_ERROR, INVALID_PARAMS, METHOD_NOT_FOUND, Request, Response, WirePayload};
use super::registry::{Args, MethodDescriptor, MethodRegistry};

/// Why a request did not produce a result.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DispatchError {
    #[error("Method not found: {0}")]
    MethodNotFound(String),

    #[error("Missing required parameter '{param}' for method '{method}'")]
    MissingParameter { method: String, param: String },

    #[error("Invalid params for '{method}': {reason}")]
    InvalidParams { method: String, reason: String },

    #[error("Invalid params for '{method}': {source}")]
    Coercion {
        method: String,
        #[source]
        source: CoercionError,
    },

    #[error("{message}")]
    HandlerFailure { method: String, message: String },
}

impl DispatchError {
    /// JSON-RPC error code for this failure.
    pub fn code(&self) -> i32 {
        match self {
            DispatchError::MethodNotFound(_) => METHOD_NOT_FOUND,
            DispatchError::MissingParameter { .. }
            | DispatchError::InvalidParams { .. }
            | DispatchError::Coercion { .. } => INVALID_PARAMS,
            DispatchError::HandlerFailure { .. } => INTERNAL_ERROR,
        }
    }

    /// Stable name of the failure kind, reported as `error.data.kind`.
    pub fn kind(&self) -> &'static str {
        match self {
            DispatchError::MethodNotFound(_) => "MethodNotFound",
            DispatchError::MissingParameter { .. } => "MissingParameter",
            DispatchError::InvalidParams { .. } => "InvalidParams",
            DispatchError::Coercion {
                source: CoercionError::TypeMismatch { .. },
                ..
            } => "TypeMismatch",
            DispatchError::Coercion {
                source: CoercionError::Parse { .. },
                ..
            } => "ParseError",
            DispatchError::HandlerFailure { .. } => "HandlerFailure",
        }
    }

    fn data(&self) -> Value {
        match self {
            DispatchError::MissingParameter { param, .. } => {
                json!({"kind": self.kind(), "param": param})
            }
            DispatchError::Coercion {
                source:
                    CoercionError::TypeMismatch {
                        param,
                        expected,
                        received,
                    },
                ..
            } => json!({
                "kind": self.kind(),
                "param": param,
                "expected": expected,
                "received": received,
            }),
            DispatchError::Coercion {
                source:
                    CoercionError::Parse {
                        param,
                        expected,
                        reason,
                    },
                ..
            } => json!({
                "kind": self.kind(),
                "param": param,
                "expected": expected,
                "reason": reason,
            }),
            _ => json!({"kind": self.kind()}),
        }
    }

    pub fn into_response(self, id: Value) -> Response {
        let data = self.data();
        Response::error_with_data(id, self.code(), self.to_string(), data)
    }
}

/// Stateless dispatcher over a frozen registry.
#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<MethodRegistry>,
}

impl Dispatcher {
    pub fn new(registry: Arc<MethodRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &MethodRegistry {
        &self.registry
    }

    /// Handle a request and build its response.
    pub fn dispatch(&self, request: Request) -> Response {
        let id = request.id.unwrap_or(Value::Null);

        match self.invoke(&request.method, request.params) {
            Ok(payload) => Response::from_payload(id, payload),
            Err(err) => {
                debug!(method = %request.method, kind = err.kind(), error = %err, "Request failed");
                err.into_response(id)
            }
        }
    }

    /// Resolve, bind and invoke `method`.
    pub fn invoke(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<Box<dyn WirePayload>, DispatchError> {
        let descriptor = self
            .registry
            .lookup(method)
            .map_err(|_| DispatchError::MethodNotFound(method.to_string()))?;
        let args = bind_args(descriptor, params)?;

        debug!(method, args = args.len(), "Invoking handler");
        let outcome = catch_unwind(AssertUnwindSafe(|| descriptor.invoke(&args)));

        match outcome {
            Ok(Ok(payload)) => Ok(payload),
            Ok(Err(err)) => {
                let chain = format!("{:#}", err);
                warn!(method, error = %chain, "Handler failed");
                Err(DispatchError::HandlerFailure {
                    method: method.to_string(),
                    message: err.to_string(),
                })
            }
            Err(panic) => {
                let detail = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "non-string panic payload".to_string());
                warn!(method, panic = %detail, "Handler panicked");
                Err(DispatchError::HandlerFailure {
                    method: method.to_string(),
                    message: format!("Internal error while executing '{}'", method),
                })
            }
        }
    }
}

/// Bind wire params to the method's schema and coerce each value.
fn bind_args(descriptor: &MethodDescriptor, params: Option<Value>) -> Result<Args, DispatchError> {
    let method = descriptor.name.as_str();
    let mut named = match params {
        None | Some(Value::Null) => Map::new(),
        Some(Value::Object(map)) => map,
        Some(Value::Array(items)) => positional_to_named(descriptor, items)?,
        Some(other) => {
            return Err(DispatchError::InvalidParams {
                method: method.to_string(),
                reason: format!(
                    "params must be an object or array, got {}",
                    describe_value(&other)
                ),
            });
        }
    };

    let mut values = Vec::with_capacity(descriptor.params.len());
    for spec in &descriptor.params {
        let arg = match named.remove(&spec.name) {
            Some(value) => coerce(&spec.name, &spec.ty, &value).map_err(|source| {
                DispatchError::Coercion {
                    method: method.to_string(),
                    source,
                }
            })?,
            None if spec.required => {
                return Err(DispatchError::MissingParameter {
                    method: method.to_string(),
                    param: spec.name.clone(),
                });
            }
            None => Arg::Absent,
        };
        values.push((spec.name.clone(), arg));
    }

    if let Some(extra) = named.keys().next() {
        return Err(DispatchError::InvalidParams {
            method: method.to_string(),
            reason: format!("unexpected parameter '{}'", extra),
        });
    }

    Ok(Args::new(values))
}

fn positional_to_named(
    descriptor: &MethodDescriptor,
    items: Vec<Value>,
) -> Result<Map<String, Value>, DispatchError> {
    if items.len() > descriptor.params.len() {
        return Err(DispatchError::InvalidParams {
            method: descriptor.name.clone(),
            reason: format!(
                "expected at most {} positional parameter(s), got {}",
                descriptor.params.len(),
                items.len()
            ),
        });
    }
    Ok(descriptor
        .params
        .iter()
        .map(|spec| spec.name.clone())
        .zip(items)
        .collect())
}
