//! Protocol layer for the RPC runtime.
//!
//! This module contains:
//! - The type model (`TypeDesc`, `Value`, `Exception`)
//! - The ordered per-type codec registry and its built-in strategies
//! - Request/response messages and the binary and JSON wire codecs
//! - Byte-level framing

pub mod binary;
pub mod codecs;
pub mod exception;
pub mod framing;
pub mod json;
pub mod message;
pub mod registry;
pub mod types;
pub mod value;
pub mod wire;

pub use binary::BinaryWireCodec;
pub use exception::Exception;
pub use framing::{FrameCodec, Framing};
pub use json::JsonWireCodec;
pub use message::{ErrorDescriptor, Request, Response, codes};
pub use registry::{CodecRegistry, TypeCodec, precedence};
pub use types::{Primitive, TypeDesc};
pub use value::{Value, WireValue};
pub use wire::{MalformedRequest, ResponseDecodeError, WireCodec, WireFormat};
