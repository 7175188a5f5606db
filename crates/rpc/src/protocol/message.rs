//! Messages exchanged between client and server.

use crate::dispatch::DispatchEntry;
use crate::protocol::Value;

use std::sync::Arc;

/// Reserved error codes.
///
/// The framework range follows JSON-RPC 2.0. Every application failure
/// travels under [`codes::APPLICATION`] with the exception as payload.
pub mod codes {
    /// Message could not be parsed.
    pub const PARSE_ERROR: i32 = -32700;
    /// Message parsed but is not a valid request.
    pub const INVALID_REQUEST: i32 = -32600;
    /// No such method.
    pub const METHOD_NOT_FOUND: i32 = -32601;
    /// Wrong argument count or argument type.
    pub const INVALID_ARGUMENT: i32 = -32602;
    /// Framework-side failure.
    pub const INTERNAL_ERROR: i32 = -32603;
    /// Caller may not invoke the method.
    pub const ACCESS_DENIED: i32 = -32003;
    /// Unchecked failure without a more specific kind.
    pub const RUNTIME_ERROR: i32 = -32004;
    /// Application exception; payload carries it.
    pub const APPLICATION: i32 = -32000;
}

/// A call on the wire.
#[derive(Clone, Debug)]
pub struct Request {
    /// Correlation id.
    pub id: u64,
    /// Target method.
    pub method: Arc<DispatchEntry>,
    /// Arguments in declaration order.
    pub args: Vec<Value>,
}

/// Error half of a response.
#[derive(Clone, Debug, PartialEq)]
pub struct ErrorDescriptor {
    /// Numeric code, see [`codes`].
    pub code: i32,
    /// Human-readable message.
    pub message: String,
    /// Serialized application exception, if any.
    pub payload: Option<Value>,
}

impl ErrorDescriptor {
    /// Descriptor without payload.
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            payload: None,
        }
    }

    /// Attaches a payload.
    #[must_use]
    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }
}

/// Reply to a [`Request`].
#[derive(Clone, Debug, PartialEq)]
pub struct Response {
    /// Id of the request this answers; `None` when the request id could not
    /// be read.
    pub id: Option<u64>,
    /// Result value or error.
    pub outcome: Result<Value, ErrorDescriptor>,
}

impl Response {
    /// Successful response.
    #[must_use]
    pub const fn success(id: u64, value: Value) -> Self {
        Self {
            id: Some(id),
            outcome: Ok(value),
        }
    }

    /// Error response.
    #[must_use]
    pub const fn failure(id: Option<u64>, error: ErrorDescriptor) -> Self {
        Self {
            id,
            outcome: Err(error),
        }
    }
}
