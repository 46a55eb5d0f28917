//! JSON-RPC 2.0 protocol types.
//!
//! Implements the subset of JSON-RPC 2.0 spoken over the loopback endpoint.
//! See: https://www.jsonrpc.org/specification
//!
//! Success payloads stay unencoded inside [`Response`] until the server writes
//! them out, so a payload that cannot be represented as JSON is caught at the
//! encoding boundary and replaced by a fallback error instead of breaking the
//! connection.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::warn;

/// JSON-RPC request object as received on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    /// `"2.0"` when present. Clients may omit it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jsonrpc: Option<String>,
    /// Method name to invoke
    pub method: String,
    /// Named (object) or positional (array) parameters
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    /// Correlation id, echoed back in the response
    #[serde(default)]
    pub id: Option<Value>,
}

/// JSON-RPC error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    /// Error code (see standard codes below)
    pub code: i32,
    /// Short error description
    pub message: String,
    /// Optional additional error data
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

// Standard JSON-RPC 2.0 error codes
pub const PARSE_ERROR: i32 = -32700;
pub const INVALID_REQUEST: i32 = -32600;
pub const METHOD_NOT_FOUND: i32 = -32601;
pub const INVALID_PARAMS: i32 = -32602;
pub const INTERNAL_ERROR: i32 = -32603;

/// Last-resort payload, used when nothing else could be encoded.
pub const FALLBACK_RESPONSE: &[u8] =
    br#"{"jsonrpc":"2.0","error":{"code":-32603,"message":"Internal error"},"id":null}"#;

/// A handler result that has not been turned into JSON yet.
pub trait WirePayload: Send {
    fn to_wire(&self) -> Result<Value, serde_json::Error>;
}

impl<T: Serialize + Send> WirePayload for T {
    fn to_wire(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(self)
    }
}

/// Outcome carried by a [`Response`].
pub enum Outcome {
    Success(Box<dyn WirePayload>),
    Failure(RpcError),
}

impl std::fmt::Debug for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Outcome::Success(_) => f.write_str("Success(..)"),
            Outcome::Failure(e) => f.debug_tuple("Failure").field(e).finish(),
        }
    }
}

/// JSON-RPC response, before encoding.
#[derive(Debug)]
pub struct Response {
    /// Request identifier (echoed from request, `null` if unknown)
    pub id: Value,
    pub outcome: Outcome,
}

/// Serializable shape of a response on the wire.
#[derive(Debug, Serialize)]
struct WireResponse<'a> {
    jsonrpc: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'a RpcError>,
    id: &'a Value,
}

/// Which step of the encoding chain produced the bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodeStage {
    Full,
    Minimal,
    Literal,
}

/// Encoded response bytes.
#[derive(Debug)]
pub struct Encoded {
    pub bytes: Vec<u8>,
    pub stage: EncodeStage,
}

type EncodeFn = fn(&Response) -> Result<Vec<u8>, serde_json::Error>;

const ENCODE_CHAIN: [(EncodeStage, EncodeFn); 2] = [
    (EncodeStage::Full, encode_full),
    (EncodeStage::Minimal, encode_minimal),
];

fn encode_full(response: &Response) -> Result<Vec<u8>, serde_json::Error> {
    let wire = match &response.outcome {
        Outcome::Success(payload) => WireResponse {
            jsonrpc: "2.0",
            result: Some(payload.to_wire()?),
            error: None,
            id: &response.id,
        },
        Outcome::Failure(error) => WireResponse {
            jsonrpc: "2.0",
            result: None,
            error: Some(error),
            id: &response.id,
        },
    };
    serde_json::to_vec(&wire)
}

fn encode_minimal(response: &Response) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(&json!({
        "jsonrpc": "2.0",
        "error": {"code": INTERNAL_ERROR, "message": "Failed to encode response"},
        "id": response.id,
    }))
}

impl Response {
    /// Create a success response with the given result.
    pub fn success(id: Value, result: impl Serialize + Send + 'static) -> Self {
        Self::from_payload(id, Box::new(result))
    }

    pub fn from_payload(id: Value, payload: Box<dyn WirePayload>) -> Self {
        Self {
            id,
            outcome: Outcome::Success(payload),
        }
    }

    /// Create an error response.
    pub fn error(id: Value, code: i32, message: impl Into<String>) -> Self {
        Self {
            id,
            outcome: Outcome::Failure(RpcError {
                code,
                message: message.into(),
                data: None,
            }),
        }
    }

    /// Create an error response with additional data.
    pub fn error_with_data(id: Value, code: i32, message: impl Into<String>, data: Value) -> Self {
        Self {
            id,
            outcome: Outcome::Failure(RpcError {
                code,
                message: message.into(),
                data: Some(data),
            }),
        }
    }

    /// Create a parse error response (the request id is unknown).
    pub fn parse_error(details: impl Into<String>) -> Self {
        Self::error_with_data(
            Value::Null,
            PARSE_ERROR,
            format!("Parse error: {}", details.into()),
            json!({"kind": "ParseError"}),
        )
    }

    /// Create an invalid request response.
    pub fn invalid_request(id: Value, details: impl Into<String>) -> Self {
        Self::error(id, INVALID_REQUEST, format!("Invalid request: {}", details.into()))
    }

    /// Create a method not found response.
    pub fn method_not_found(id: Value, method: &str) -> Self {
        Self::error_with_data(
            id,
            METHOD_NOT_FOUND,
            format!("Method not found: {}", method),
            json!({"kind": "MethodNotFound"}),
        )
    }

    /// Create an internal error response.
    pub fn internal_error(id: Value, details: impl Into<String>) -> Self {
        Self::error(id, INTERNAL_ERROR, details.into())
    }

    pub fn is_error(&self) -> bool {
        matches!(self.outcome, Outcome::Failure(_))
    }

    pub fn error_code(&self) -> Option<i32> {
        match &self.outcome {
            Outcome::Failure(e) => Some(e.code),
            Outcome::Success(_) => None,
        }
    }

    /// Encode to JSON bytes. Never fails: if the full response cannot be
    /// encoded a minimal internal error is produced, and if that fails too
    /// [`FALLBACK_RESPONSE`] is returned.
    pub fn encode(&self) -> Encoded {
        self.encode_with(&ENCODE_CHAIN)
    }

    fn encode_with(&self, chain: &[(EncodeStage, EncodeFn)]) -> Encoded {
        for (stage, encode) in chain {
            match encode(self) {
                Ok(bytes) => {
                    return Encoded {
                        bytes,
                        stage: *stage,
                    };
                }
                Err(e) => warn!(stage = ?stage, error = %e, "Response encoding failed"),
            }
        }
        Encoded {
            bytes: FALLBACK_RESPONSE.to_vec(),
            stage: EncodeStage::Literal,
        }
    }

    /// Encode and parse back into a JSON value. Handy for inspecting responses.
    pub fn to_value(&self) -> Value {
        serde_json::from_slice(&self.encode().bytes).unwrap_or(Value::Null)
    }
}

/// Why an incoming body could not be turned into a [`Request`].
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RequestError {
    #[error("malformed JSON: {0}")]
    Parse(String),
    #[error("{reason}")]
    Invalid { id: Value, reason: String },
}

impl RequestError {
    pub fn into_response(self) -> Response {
        match self {
            RequestError::Parse(details) => Response::parse_error(details),
            RequestError::Invalid { id, reason } => Response::invalid_request(id, reason),
        }
    }
}

impl Request {
    pub fn new(method: impl Into<String>, params: Option<Value>, id: Value) -> Self {
        Self {
            jsonrpc: Some("2.0".to_string()),
            method: method.into(),
            params,
            id: Some(id),
        }
    }

    /// Decode a request body.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, RequestError> {
        let value: Value =
            serde_json::from_slice(bytes).map_err(|e| RequestError::Parse(e.to_string()))?;

        let id = match value.get("id") {
            Some(id @ (Value::Null | Value::Number(_) | Value::String(_))) => id.clone(),
            _ => Value::Null,
        };

        let request: Request =
            serde_json::from_value(value).map_err(|e| RequestError::Invalid {
                id: id.clone(),
                reason: e.to_string(),
            })?;

        request
            .validate()
            .map_err(|reason| RequestError::Invalid {
                id,
                reason: reason.to_string(),
            })?;

        Ok(request)
    }

    /// Validate the request shape.
    pub fn validate(&self) -> Result<(), &'static str> {
        if let Some(version) = &self.jsonrpc {
            if version != "2.0" {
                return Err("jsonrpc must be \"2.0\"");
            }
        }
        if self.method.is_empty() {
            return Err("method must not be empty");
        }
        match &self.id {
            None | Some(Value::Null | Value::Number(_) | Value::String(_)) => Ok(()),
            Some(_) => Err("id must be a number, string or null"),
        }
    }
}

/// Decoded response, as seen by a client.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Result { id: Value, result: Value },
    Error { id: Value, error: RpcError },
}

/// Decode a response body. `result: null` is a valid success.
pub fn decode_reply(bytes: &[u8]) -> Result<Reply, String> {
    let value: Value = serde_json::from_slice(bytes).map_err(|e| e.to_string())?;
    let Value::Object(mut object) = value else {
        return Err("response is not a JSON object".to_string());
    };
    let id = object.remove("id").unwrap_or(Value::Null);

    if let Some(error) = object.remove("error") {
        let error: RpcError =
            serde_json::from_value(error).map_err(|e| format!("invalid error object: {}", e))?;
        return Ok(Reply::Error { id, error });
    }
    match object.remove("result") {
        Some(result) => Ok(Reply::Result { id, result }),
        None => Err("response has neither result nor error".to_string()),
    }
}
