//! Ordered registry of per-type codec strategies.
//!
//! Lookup is a linear scan: the first strategy whose [`TypeCodec::supports`]
//! predicate accepts the declared type wins. Overlapping predicates are
//! resolved by precedence, so broad strategies must sit after specific ones.
//! The built-in order is fixed by the constants in [`precedence`].

use crate::error::CodecError;
use crate::protocol::codecs::{
    ArrayCodec, ExceptionCodec, ListCodec, NetworkAddressCodec, PolymorphicCodec,
    PrimitiveCodec, SerializableCodec, StringCodec, VoidCodec,
};
use crate::protocol::{Primitive, TypeDesc, Value};

use std::sync::Arc;

use bytes::{Bytes, BytesMut};

/// Precedence slots of the built-in strategies, lowest first.
///
/// A custom strategy registered at a slot sorts ahead of every strategy
/// already registered at the same or a higher slot, so registering at
/// [`precedence::STRING`] overrides the built-in string codec.
pub mod precedence {
    /// `void`.
    pub const VOID: u16 = 100;
    /// Fixed-width primitives, boxed or not.
    pub const PRIMITIVE: u16 = 200;
    /// Strings.
    pub const STRING: u16 = 300;
    /// Arrays.
    pub const ARRAY: u16 = 400;
    /// Homogeneous collections.
    pub const COLLECTION: u16 = 500;
    /// IP and socket addresses.
    pub const NETWORK: u16 = 600;
    /// Exceptions (stack trace stripped).
    pub const EXCEPTION: u16 = 700;
    /// Any named serializable type.
    pub const SERIALIZABLE: u16 = 800;
    /// Values declared as `object`.
    pub const POLYMORPHIC: u16 = 900;
}

/// Encode/decode strategy for a family of types.
///
/// Each strategy knows both wire forms: the compact binary form and the
/// self-describing JSON form. Nested values are delegated back to the
/// registry so that custom strategies apply at every depth.
pub trait TypeCodec: Send + Sync + 'static {
    /// Name used in logs and diagnostics.
    fn name(&self) -> &'static str;

    /// Whether this strategy handles values declared as `ty`.
    fn supports(&self, ty: &TypeDesc) -> bool;

    /// Appends the binary form of `value` to `out`.
    ///
    /// # Errors
    ///
    /// Returns an error if `value` does not fit `ty` or cannot be encoded.
    fn encode(
        &self,
        value: &Value,
        ty: &TypeDesc,
        out: &mut BytesMut,
        registry: &CodecRegistry,
    ) -> Result<(), CodecError>;

    /// Reads one value of `ty` from the front of `input`.
    ///
    /// # Errors
    ///
    /// Returns an error if the input is truncated or malformed.
    fn decode(
        &self,
        input: &mut Bytes,
        ty: &TypeDesc,
        registry: &CodecRegistry,
    ) -> Result<Value, CodecError>;

    /// Converts `value` into its JSON form.
    ///
    /// # Errors
    ///
    /// Returns an error if `value` does not fit `ty` or cannot be encoded.
    fn to_json(
        &self,
        value: &Value,
        ty: &TypeDesc,
        registry: &CodecRegistry,
    ) -> Result<serde_json::Value, CodecError>;

    /// Converts a JSON form back into a value of `ty`.
    ///
    /// # Errors
    ///
    /// Returns an error if the JSON does not describe a `ty`.
    fn from_json(
        &self,
        json: &serde_json::Value,
        ty: &TypeDesc,
        registry: &CodecRegistry,
    ) -> Result<Value, CodecError>;
}

struct Entry {
    precedence: u16,
    codec: Arc<dyn TypeCodec>,
}

/// Ordered list of codec strategies.
pub struct CodecRegistry {
    entries: Vec<Entry>,
}

impl CodecRegistry {
    /// Registry with no strategies at all.
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Registry holding every built-in strategy in precedence order.
    #[must_use]
    pub fn new() -> Self {
        let mut registry = Self::empty();
        registry.push_builtin(precedence::VOID, VoidCodec);
        for primitive in Primitive::ALL {
            registry.push_builtin(precedence::PRIMITIVE, PrimitiveCodec::new(primitive));
        }
        registry.push_builtin(precedence::STRING, StringCodec);
        registry.push_builtin(precedence::ARRAY, ArrayCodec);
        registry.push_builtin(precedence::COLLECTION, ListCodec);
        registry.push_builtin(precedence::NETWORK, NetworkAddressCodec);
        registry.push_builtin(precedence::EXCEPTION, ExceptionCodec);
        registry.push_builtin(precedence::SERIALIZABLE, SerializableCodec);
        registry.push_builtin(precedence::POLYMORPHIC, PolymorphicCodec);
        registry
    }

    /// Inserts `codec` ahead of every strategy at `precedence` or later.
    pub fn register(&mut self, precedence: u16, codec: impl TypeCodec) {
        self.register_arc(precedence, Arc::new(codec));
    }

    /// Inserts a shared strategy; see [`CodecRegistry::register`].
    pub fn register_arc(&mut self, precedence: u16, codec: Arc<dyn TypeCodec>) {
        let index = self
            .entries
            .iter()
            .position(|entry| entry.precedence >= precedence)
            .unwrap_or(self.entries.len());
        self.entries.insert(index, Entry { precedence, codec });
    }

    // Built-ins sharing a slot keep their registration order.
    fn push_builtin(&mut self, precedence: u16, codec: impl TypeCodec) {
        let index = self
            .entries
            .iter()
            .position(|entry| entry.precedence > precedence)
            .unwrap_or(self.entries.len());
        self.entries.insert(
            index,
            Entry {
                precedence,
                codec: Arc::new(codec),
            },
        );
    }

    /// Names of the registered strategies, in lookup order.
    #[must_use]
    pub fn names(&self) -> Vec<&'static str> {
        self.entries.iter().map(|entry| entry.codec.name()).collect()
    }

    /// First strategy supporting `ty`.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Unsupported`] if none does.
    pub fn lookup(&self, ty: &TypeDesc) -> Result<&dyn TypeCodec, CodecError> {
        self.entries
            .iter()
            .find(|entry| entry.codec.supports(ty))
            .map(|entry| entry.codec.as_ref())
            .ok_or_else(|| CodecError::Unsupported(ty.to_string()))
    }

    /// Appends the binary form of `value` declared as `ty`.
    ///
    /// # Errors
    ///
    /// Returns an error if no strategy supports `ty` or encoding fails.
    pub fn encode(&self, value: &Value, ty: &TypeDesc, out: &mut BytesMut) -> Result<(), CodecError> {
        self.lookup(ty)?.encode(value, ty, out, self)
    }

    /// Reads one value declared as `ty`.
    ///
    /// # Errors
    ///
    /// Returns an error if no strategy supports `ty` or decoding fails.
    pub fn decode(&self, input: &mut Bytes, ty: &TypeDesc) -> Result<Value, CodecError> {
        self.lookup(ty)?.decode(input, ty, self)
    }

    /// JSON form of `value` declared as `ty`.
    ///
    /// # Errors
    ///
    /// Returns an error if no strategy supports `ty` or encoding fails.
    pub fn to_json(&self, value: &Value, ty: &TypeDesc) -> Result<serde_json::Value, CodecError> {
        self.lookup(ty)?.to_json(value, ty, self)
    }

    /// Value declared as `ty` from its JSON form.
    ///
    /// # Errors
    ///
    /// Returns an error if no strategy supports `ty` or decoding fails.
    pub fn from_json(&self, json: &serde_json::Value, ty: &TypeDesc) -> Result<Value, CodecError> {
        self.lookup(ty)?.from_json(json, ty, self)
    }
}

impl Default for CodecRegistry {
    fn default() -> Self {
        Self::new()
    }
}
