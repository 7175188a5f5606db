//! Error types for the RPC runtime.
//!
//! Every failure a caller can observe is one of the variants of [`Error`]. The
//! type is `Clone` because a single connection failure has to be delivered to
//! every call that was pending on that connection.

use crate::protocol::Exception;

use std::io;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// Result type alias for RPC operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for RPC operations.
#[derive(Clone, Debug, Error)]
pub enum Error {
    /// The byte stream to the peer failed or could not be established.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// The peer sent something that is not a valid message.
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The call could not be routed to a method.
    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    /// A value could not be encoded or decoded.
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// An interface or runtime was configured incorrectly.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The remote method raised an exception.
    #[error("Remote exception: {0}")]
    Application(Exception),

    /// The framework hit a state it does not expect to be in.
    #[error("Internal error: {0}")]
    Internal(String),

    /// The call was cancelled before a response arrived.
    #[error("Call cancelled")]
    Cancelled,
}

impl Error {
    /// Returns `true` if this is a transport failure.
    #[must_use]
    pub const fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_))
    }

    /// Returns the remote exception, if the remote side raised one.
    #[must_use]
    pub const fn exception(&self) -> Option<&Exception> {
        match self {
            Self::Application(exception)
            | Self::Dispatch(DispatchError::Remote(exception))
            | Self::Protocol(ProtocolError::Remote(exception)) => Some(exception),
            _ => None,
        }
    }
}

/// Transport-level errors.
#[derive(Clone, Debug, Error)]
pub enum TransportError {
    /// Failed to establish a connection.
    #[error("Failed to connect to {address}: {source}")]
    ConnectFailed {
        /// The address we tried to connect to.
        address: String,
        /// The underlying error.
        #[source]
        source: Arc<io::Error>,
    },

    /// Connect attempt did not complete in time.
    #[error("Connect to {address} timed out after {timeout:?}")]
    ConnectTimedOut {
        /// The address we tried to connect to.
        address: String,
        /// The configured connect timeout.
        timeout: Duration,
    },

    /// Connection closed while the call was outstanding.
    #[error("Connection closed")]
    Closed,

    /// No bytes moved within the idle window, or the call deadline passed.
    #[error("Timed out after {0:?}")]
    TimedOut(Duration),

    /// Reading from or writing to the stream failed.
    #[error("I/O error: {0}")]
    Io(Arc<io::Error>),

    /// The client or server is shutting down.
    #[error("Shutting down")]
    ShuttingDown,
}

impl From<io::Error> for TransportError {
    fn from(err: io::Error) -> Self {
        Self::Io(Arc::new(err))
    }
}

/// Protocol-level errors.
#[derive(Clone, Debug, Error)]
pub enum ProtocolError {
    /// Frame too large.
    #[error("Frame size {size} exceeds maximum {max}")]
    FrameTooLarge {
        /// Size of the frame.
        size: usize,
        /// Maximum allowed size.
        max: usize,
    },

    /// The outbound payload contains the frame delimiter.
    #[error("Payload contains frame delimiter {0:#04x}")]
    DelimiterInPayload(u8),

    /// Message carried the wrong protocol version.
    #[error("Unsupported protocol version: {0}")]
    UnsupportedVersion(String),

    /// Message could not be parsed.
    #[error("Malformed message: {0}")]
    Malformed(String),

    /// A request arrived where a response was expected, or the reverse.
    #[error("Unexpected message kind: {0:#04x}")]
    UnexpectedKind(u8),

    /// The peer rejected our request as malformed.
    #[error("Peer rejected request: {0}")]
    Remote(Exception),
}

/// Method routing errors.
#[derive(Clone, Debug, Error)]
pub enum DispatchError {
    /// No method with this wire name.
    #[error("Unknown method: {0}")]
    UnknownMethod(String),

    /// No method with this ordinal.
    #[error("Unknown method ordinal: {0}")]
    UnknownOrdinal(u16),

    /// The local signature is not part of the interface.
    #[error("Method {0} is not part of the interface")]
    UnknownSignature(String),

    /// Wrong number of arguments for the method.
    #[error("Method {method} takes {expected} arguments, got {actual}")]
    ArgumentCount {
        /// Wire name of the method.
        method: String,
        /// Declared parameter count.
        expected: usize,
        /// Number of arguments supplied.
        actual: usize,
    },

    /// The peer could not route our request.
    #[error("Peer could not dispatch request: {0}")]
    Remote(Exception),
}

/// Value encoding errors.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    /// Input ended before the value was complete.
    #[error("Truncated input: needed {needed} bytes, {remaining} remaining")]
    Truncated {
        /// Bytes required.
        needed: usize,
        /// Bytes available.
        remaining: usize,
    },

    /// Value does not match the declared type.
    #[error("Type mismatch: expected {expected}, got {actual}")]
    TypeMismatch {
        /// Declared type.
        expected: String,
        /// What was found instead.
        actual: String,
    },

    /// Null supplied where the declared type cannot hold one.
    #[error("Null is not a valid {0}")]
    UnexpectedNull(String),

    /// No registered strategy supports the type.
    #[error("No codec supports type {0}")]
    Unsupported(String),

    /// Polymorphic value whose runtime type is the abstract base.
    #[error("Cannot encode a value whose runtime type is the abstract object type")]
    AbstractType,

    /// Type name could not be parsed.
    #[error("Invalid type name: {0}")]
    InvalidTypeName(String),

    /// Length prefix is negative (other than the null marker) or absurd.
    #[error("Invalid length prefix: {0}")]
    InvalidLength(i64),

    /// String bytes are not UTF-8.
    #[error("Invalid UTF-8 in string")]
    InvalidUtf8,

    /// Char scalar value out of range.
    #[error("Invalid char scalar value: {0:#x}")]
    InvalidChar(u32),

    /// Presence or boolean flag byte is neither 0 nor 1.
    #[error("Invalid flag byte: {0:#04x}")]
    InvalidFlag(u8),

    /// Address family tag is not recognised.
    #[error("Invalid address family: {0}")]
    InvalidAddressFamily(u8),

    /// Serde-backed serialization failed.
    #[error("Failed to serialize: {0}")]
    SerializationFailed(String),

    /// Serde-backed deserialization failed.
    #[error("Failed to deserialize: {0}")]
    DeserializationFailed(String),
}

impl From<ciborium::de::Error<io::Error>> for CodecError {
    fn from(err: ciborium::de::Error<io::Error>) -> Self {
        Self::DeserializationFailed(err.to_string())
    }
}

impl From<ciborium::ser::Error<io::Error>> for CodecError {
    fn from(err: ciborium::ser::Error<io::Error>) -> Self {
        Self::SerializationFailed(err.to_string())
    }
}

/// Configuration errors, raised eagerly at registration or build time.
#[derive(Clone, Debug, Error)]
pub enum ConfigError {
    /// A method cannot be exposed over this transport.
    #[error("Method {interface}.{method} is invalid: {reason}")]
    InvalidMethod {
        /// Interface name.
        interface: String,
        /// Method name.
        method: String,
        /// Why the method was rejected.
        reason: String,
    },

    /// The same signature is declared twice.
    #[error("Interface {interface} declares {signature} more than once")]
    DuplicateSignature {
        /// Interface name.
        interface: String,
        /// Canonical signature.
        signature: String,
    },

    /// Interface has more methods than a binary ordinal can address.
    #[error("Interface {0} has too many methods")]
    TooManyMethods(String),

    /// A required builder field was not set.
    #[error("Missing required setting: {0}")]
    Missing(&'static str),

    /// A setting has an unusable value.
    #[error("Invalid setting {name}: {reason}")]
    InvalidSetting {
        /// Setting name.
        name: &'static str,
        /// Why the value was rejected.
        reason: String,
    },
}
