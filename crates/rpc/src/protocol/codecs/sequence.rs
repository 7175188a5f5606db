//! Arrays and homogeneous collections.
//!
//! Both are an `i32` element count (`-1` for null) followed by each element
//! encoded with the declared component type. The two differ only in which
//! declared type they answer to and which [`Value`] variant they produce.
//! `void` has no wire form and is never a component type, so every element
//! occupies at least one byte.

use super::{ensure, json_mismatch, read_length, write_length};
use crate::error::CodecError;
use crate::protocol::{CodecRegistry, TypeCodec, TypeDesc, Value};

use bytes::{Bytes, BytesMut};

#[derive(Clone, Copy)]
enum Shape {
    Array,
    List,
}

impl Shape {
    fn element(self, ty: &TypeDesc) -> Option<&TypeDesc> {
        match (self, ty) {
            (Self::Array, TypeDesc::Array(element)) | (Self::List, TypeDesc::List(element))
                if **element != TypeDesc::Void =>
            {
                Some(element.as_ref())
            }
            _ => None,
        }
    }

    fn items(self, value: &Value) -> Option<&[Value]> {
        match (self, value) {
            (Self::Array, Value::Array { items, .. }) | (Self::List, Value::List { items, .. }) => {
                Some(items.as_slice())
            }
            _ => None,
        }
    }

    fn build(self, element: TypeDesc, items: Vec<Value>) -> Value {
        match self {
            Self::Array => Value::Array { element, items },
            Self::List => Value::List { element, items },
        }
    }

    fn element_or_mismatch(self, ty: &TypeDesc) -> Result<&TypeDesc, CodecError> {
        self.element(ty).ok_or_else(|| CodecError::Unsupported(ty.to_string()))
    }

    fn encode(
        self,
        value: &Value,
        ty: &TypeDesc,
        out: &mut BytesMut,
        registry: &CodecRegistry,
    ) -> Result<(), CodecError> {
        let element = self.element_or_mismatch(ty)?;
        if value.is_null() {
            return write_length(out, None);
        }
        let items = self.items(value).ok_or_else(|| value.mismatch(ty))?;
        write_length(out, Some(items.len()))?;
        for item in items {
            registry.encode(item, element, out)?;
        }
        Ok(())
    }

    fn decode(
        self,
        input: &mut Bytes,
        ty: &TypeDesc,
        registry: &CodecRegistry,
    ) -> Result<Value, CodecError> {
        let element = self.element_or_mismatch(ty)?;
        let Some(len) = read_length(input)? else {
            return Ok(Value::Null);
        };
        ensure(input, len)?;
        let mut items = Vec::with_capacity(len);
        for _ in 0..len {
            items.push(registry.decode(input, element)?);
        }
        Ok(self.build(element.clone(), items))
    }

    fn to_json(
        self,
        value: &Value,
        ty: &TypeDesc,
        registry: &CodecRegistry,
    ) -> Result<serde_json::Value, CodecError> {
        let element = self.element_or_mismatch(ty)?;
        if value.is_null() {
            return Ok(serde_json::Value::Null);
        }
        let items = self.items(value).ok_or_else(|| value.mismatch(ty))?;
        items
            .iter()
            .map(|item| registry.to_json(item, element))
            .collect::<Result<Vec<_>, _>>()
            .map(serde_json::Value::Array)
    }

    fn from_json(
        self,
        json: &serde_json::Value,
        ty: &TypeDesc,
        registry: &CodecRegistry,
    ) -> Result<Value, CodecError> {
        let element = self.element_or_mismatch(ty)?;
        match json {
            serde_json::Value::Null => Ok(Value::Null),
            serde_json::Value::Array(items) => {
                let items = items
                    .iter()
                    .map(|item| registry.from_json(item, element))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(self.build(element.clone(), items))
            }
            other => Err(json_mismatch(ty, other)),
        }
    }
}

/// Arrays, e.g. `[i32]`.
pub struct ArrayCodec;

/// Homogeneous collections, e.g. `list<string>`.
pub struct ListCodec;

macro_rules! sequence_codec {
    ($codec:ident, $shape:expr, $name:literal) => {
        impl TypeCodec for $codec {
            fn name(&self) -> &'static str {
                $name
            }

            fn supports(&self, ty: &TypeDesc) -> bool {
                $shape.element(ty).is_some()
            }

            fn encode(
                &self,
                value: &Value,
                ty: &TypeDesc,
                out: &mut BytesMut,
                registry: &CodecRegistry,
            ) -> Result<(), CodecError> {
                $shape.encode(value, ty, out, registry)
            }

            fn decode(
                &self,
                input: &mut Bytes,
                ty: &TypeDesc,
                registry: &CodecRegistry,
            ) -> Result<Value, CodecError> {
                $shape.decode(input, ty, registry)
            }

            fn to_json(
                &self,
                value: &Value,
                ty: &TypeDesc,
                registry: &CodecRegistry,
            ) -> Result<serde_json::Value, CodecError> {
                $shape.to_json(value, ty, registry)
            }

            fn from_json(
                &self,
                json: &serde_json::Value,
                ty: &TypeDesc,
                registry: &CodecRegistry,
            ) -> Result<Value, CodecError> {
                $shape.from_json(json, ty, registry)
            }
        }
    };
}

sequence_codec!(ArrayCodec, Shape::Array, "array");
sequence_codec!(ListCodec, Shape::List, "collection");
