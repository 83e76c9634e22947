//! JSON-RPC style message types and the JSON codec.
//!
//! Wire format:
//! - Request:  `{"id": "1", "method": "echo", "params": {...}}`
//! - Success:  `{"id": "1", "result": ...}`
//! - Failure:  `{"id": "1", "error": {"code": -32603, "message": "..."}}`
//!
//! Requests carry string ids only. Responses whose originating request could not
//! be decoded use [`UNKNOWN_ID`].

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Id used when the request id cannot be recovered.
pub const UNKNOWN_ID: &str = "unknown";

/// Standard JSON-RPC error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    ParseError,
    InvalidRequest,
    MethodNotFound,
    InvalidParams,
    InternalError,
}

impl ErrorCode {
    /// Numeric value on the wire.
    pub fn code(self) -> i64 {
        match self {
            ErrorCode::ParseError => -32700,
            ErrorCode::InvalidRequest => -32600,
            ErrorCode::MethodNotFound => -32601,
            ErrorCode::InvalidParams => -32602,
            ErrorCode::InternalError => -32603,
        }
    }

    /// Map a numeric code back to a known variant.
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            -32700 => Some(ErrorCode::ParseError),
            -32600 => Some(ErrorCode::InvalidRequest),
            -32601 => Some(ErrorCode::MethodNotFound),
            -32602 => Some(ErrorCode::InvalidParams),
            -32603 => Some(ErrorCode::InternalError),
            _ => None,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorCode::ParseError => "parse error",
            ErrorCode::InvalidRequest => "invalid request",
            ErrorCode::MethodNotFound => "method not found",
            ErrorCode::InvalidParams => "invalid params",
            ErrorCode::InternalError => "internal error",
        };
        f.write_str(name)
    }
}

/// Error object carried in a failure response.
///
/// Dispatch functions are free to use application-specific codes; the
/// constructors cover the standard ones.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("[{code}] {message}")]
pub struct RpcError {
    pub code: i64,
    pub message: String,
}

impl RpcError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn with_code(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::new(code.code(), message)
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::with_code(ErrorCode::MethodNotFound, format!("method not found: {method}"))
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::with_code(ErrorCode::InvalidParams, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::with_code(ErrorCode::InternalError, message)
    }
}

/// A decoded request. Immutable once produced by [`decode_request`].
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Request {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

/// A response: either a result or an error, never both.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Response {
    Success { id: String, result: Value },
    Failure { id: String, error: RpcError },
}

impl Response {
    pub fn success(id: impl Into<String>, result: Value) -> Self {
        Response::Success {
            id: id.into(),
            result,
        }
    }

    pub fn failure(id: impl Into<String>, error: RpcError) -> Self {
        Response::Failure {
            id: id.into(),
            error,
        }
    }

    /// Build the response for a completed dispatch.
    pub fn from_result(id: impl Into<String>, result: Result<Value, RpcError>) -> Self {
        match result {
            Ok(value) => Response::success(id, value),
            Err(error) => Response::failure(id, error),
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Response::Success { id, .. } | Response::Failure { id, .. } => id,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Response::Failure { .. })
    }
}

/// Structured parameter payload handed to a dispatch function.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RpcObject(Value);

impl RpcObject {
    pub fn new(value: Value) -> Self {
        RpcObject(value)
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }

    pub fn into_value(self) -> Value {
        self.0
    }

    /// Look up a field when the payload is an object.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn is_null(&self) -> bool {
        self.0.is_null()
    }
}

impl From<Value> for RpcObject {
    fn from(value: Value) -> Self {
        RpcObject(value)
    }
}

impl From<RpcObject> for Value {
    fn from(obj: RpcObject) -> Self {
        obj.0
    }
}

/// Decode one framed payload into a request.
pub fn decode_request(payload: &[u8]) -> Result<Request, serde_json::Error> {
    serde_json::from_slice(payload)
}

/// Encode a response into JSON bytes (no framing).
pub fn encode_response(response: &Response) -> Result<Bytes, serde_json::Error> {
    serde_json::to_vec(response).map(Bytes::from)
}
