//! Message-level codec abstraction.

use crate::dispatch::DispatchTable;
use crate::error::{DispatchError, Error, ProtocolError, Result};
use crate::protocol::binary::BinaryWireCodec;
use crate::protocol::json::JsonWireCodec;
use crate::protocol::message::{ErrorDescriptor, Request, Response, codes};
use crate::protocol::{CodecRegistry, TypeDesc};

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;

/// An inbound request that cannot be served.
///
/// The server answers it with [`MalformedRequest::error`] rather than
/// dropping it.
#[derive(Clone, Debug, PartialEq)]
pub struct MalformedRequest {
    /// Request id, if it could be read.
    pub id: Option<u64>,
    /// What to send back.
    pub error: ErrorDescriptor,
}

impl MalformedRequest {
    pub(crate) fn new(id: Option<u64>, code: i32, message: impl Into<String>) -> Self {
        Self {
            id,
            error: ErrorDescriptor::new(code, message),
        }
    }

    pub(crate) fn invalid_argument(id: u64, message: impl fmt::Display) -> Self {
        Self::new(Some(id), codes::INVALID_ARGUMENT, message.to_string())
    }
}

/// Why an inbound response could not be delivered.
#[derive(Clone, Debug)]
pub enum ResponseDecodeError {
    /// The response belongs to request `id`, which alone fails.
    Message {
        /// Request the response belongs to.
        id: u64,
        /// Failure to hand to that request.
        error: Error,
    },
    /// No request with this id is pending.
    UnknownId(u64),
    /// The bytes cannot be attributed to any single request.
    Connection(ProtocolError),
}

/// Encodes and decodes whole messages.
///
/// Argument and result values go through the [`CodecRegistry`]; the
/// implementation decides the envelope around them.
pub trait WireCodec: Send + Sync + 'static {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Serializes a request.
    ///
    /// # Errors
    ///
    /// Returns an error if the argument count is wrong or an argument cannot
    /// be encoded with its declared type.
    fn encode_request(&self, request: &Request) -> Result<Bytes>;

    /// Parses a request, resolving its method against `table`.
    ///
    /// # Errors
    ///
    /// Returns the error response to send if the request is unusable.
    fn decode_request(
        &self,
        frame: Bytes,
        table: &DispatchTable,
    ) -> std::result::Result<Request, MalformedRequest>;

    /// Serializes a response. `returns` is the declared return type of the
    /// method being answered, if known.
    ///
    /// # Errors
    ///
    /// Returns an error if the result cannot be encoded with `returns`.
    fn encode_response(&self, response: &Response, returns: Option<&TypeDesc>) -> Result<Bytes>;

    /// Parses a response. `returns` gives the declared return type of a
    /// pending request, or `None` if no request with that id is pending.
    ///
    /// # Errors
    ///
    /// Returns an error describing how far the failure reaches.
    fn decode_response(
        &self,
        frame: Bytes,
        returns: &dyn Fn(u64) -> Option<TypeDesc>,
    ) -> std::result::Result<Response, ResponseDecodeError>;
}

/// Choice of [`WireCodec`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum WireFormat {
    /// Compact type-driven binary.
    #[default]
    Binary,
    /// Self-describing JSON-RPC 2.0.
    Json,
}

impl WireFormat {
    /// Codec for this format over `registry`.
    #[must_use]
    pub fn codec(self, registry: Arc<CodecRegistry>) -> Arc<dyn WireCodec> {
        match self {
            Self::Binary => Arc::new(BinaryWireCodec::new(registry)),
            Self::Json => Arc::new(JsonWireCodec::new(registry)),
        }
    }
}

pub(crate) fn check_arity(request: &Request) -> Result<()> {
    let expected = request.method.signature().params().len();
    if request.args.len() != expected {
        return Err(DispatchError::ArgumentCount {
            method: request.method.wire_name().to_string(),
            expected,
            actual: request.args.len(),
        }
        .into());
    }
    Ok(())
}

pub(crate) fn missing_return_type() -> Error {
    Error::Internal("response has a result but no declared return type".to_string())
}
