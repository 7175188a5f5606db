//! `void`, primitives and strings.

use super::{ensure, json_mismatch, read_flag, read_string, write_length, write_str};
use crate::error::CodecError;
use crate::protocol::{CodecRegistry, Primitive, TypeCodec, TypeDesc, Value};

use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Writes and reads nothing.
pub struct VoidCodec;

impl TypeCodec for VoidCodec {
    fn name(&self) -> &'static str {
        "void"
    }

    fn supports(&self, ty: &TypeDesc) -> bool {
        matches!(ty, TypeDesc::Void)
    }

    fn encode(
        &self,
        value: &Value,
        ty: &TypeDesc,
        _out: &mut BytesMut,
        _registry: &CodecRegistry,
    ) -> Result<(), CodecError> {
        match value {
            Value::Unit | Value::Null => Ok(()),
            other => Err(other.mismatch(ty)),
        }
    }

    fn decode(
        &self,
        _input: &mut Bytes,
        _ty: &TypeDesc,
        _registry: &CodecRegistry,
    ) -> Result<Value, CodecError> {
        Ok(Value::Unit)
    }

    fn to_json(
        &self,
        value: &Value,
        ty: &TypeDesc,
        _registry: &CodecRegistry,
    ) -> Result<serde_json::Value, CodecError> {
        match value {
            Value::Unit | Value::Null => Ok(serde_json::Value::Null),
            other => Err(other.mismatch(ty)),
        }
    }

    fn from_json(
        &self,
        json: &serde_json::Value,
        ty: &TypeDesc,
        _registry: &CodecRegistry,
    ) -> Result<Value, CodecError> {
        match json {
            serde_json::Value::Null => Ok(Value::Unit),
            other => Err(json_mismatch(ty, other)),
        }
    }
}

/// One fixed-width primitive, in both its plain and boxed forms.
///
/// The boxed form is preceded by a presence byte so that null stays distinct
/// from zero.
pub struct PrimitiveCodec {
    primitive: Primitive,
}

impl PrimitiveCodec {
    /// Codec for `primitive`.
    #[must_use]
    pub const fn new(primitive: Primitive) -> Self {
        Self { primitive }
    }

    fn write(&self, value: &Value, ty: &TypeDesc, out: &mut BytesMut) -> Result<(), CodecError> {
        match (self.primitive, value) {
            (Primitive::Bool, Value::Bool(v)) => out.put_u8(u8::from(*v)),
            (Primitive::Byte, Value::Byte(v)) => out.put_i8(*v),
            (Primitive::Short, Value::Short(v)) => out.put_i16(*v),
            (Primitive::Int, Value::Int(v)) => out.put_i32(*v),
            (Primitive::Long, Value::Long(v)) => out.put_i64(*v),
            (Primitive::Float, Value::Float(v)) => out.put_u32(v.to_bits()),
            (Primitive::Double, Value::Double(v)) => out.put_u64(v.to_bits()),
            (Primitive::Char, Value::Char(v)) => out.put_u32(u32::from(*v)),
            (_, other) => return Err(other.mismatch(ty)),
        }
        Ok(())
    }

    fn read(&self, input: &mut Bytes) -> Result<Value, CodecError> {
        if self.primitive == Primitive::Bool {
            return read_flag(input).map(Value::Bool);
        }
        ensure(input, self.primitive.width())?;
        Ok(match self.primitive {
            Primitive::Bool | Primitive::Byte => Value::Byte(input.get_i8()),
            Primitive::Short => Value::Short(input.get_i16()),
            Primitive::Int => Value::Int(input.get_i32()),
            Primitive::Long => Value::Long(input.get_i64()),
            Primitive::Float => Value::Float(f32::from_bits(input.get_u32())),
            Primitive::Double => Value::Double(f64::from_bits(input.get_u64())),
            Primitive::Char => {
                let raw = input.get_u32();
                Value::Char(char::from_u32(raw).ok_or(CodecError::InvalidChar(raw))?)
            }
        })
    }
}

fn integer(json: &serde_json::Value, ty: &TypeDesc) -> Result<i64, CodecError> {
    json.as_i64().ok_or_else(|| json_mismatch(ty, json))
}

fn float_to_json(v: f64) -> serde_json::Value {
    if v.is_nan() {
        serde_json::Value::from("NaN")
    } else if v.is_infinite() {
        serde_json::Value::from(if v > 0.0 { "Infinity" } else { "-Infinity" })
    } else {
        serde_json::Number::from_f64(v).map_or(serde_json::Value::Null, serde_json::Value::Number)
    }
}

fn float_from_json(json: &serde_json::Value, ty: &TypeDesc) -> Result<f64, CodecError> {
    match json {
        serde_json::Value::Number(n) => n.as_f64().ok_or_else(|| json_mismatch(ty, json)),
        serde_json::Value::String(s) => match s.as_str() {
            "NaN" => Ok(f64::NAN),
            "Infinity" => Ok(f64::INFINITY),
            "-Infinity" => Ok(f64::NEG_INFINITY),
            _ => Err(json_mismatch(ty, json)),
        },
        other => Err(json_mismatch(ty, other)),
    }
}

fn out_of_range(ty: &TypeDesc, value: i64) -> CodecError {
    CodecError::TypeMismatch {
        expected: ty.to_string(),
        actual: format!("out of range integer {value}"),
    }
}

impl TypeCodec for PrimitiveCodec {
    fn name(&self) -> &'static str {
        self.primitive.name()
    }

    fn supports(&self, ty: &TypeDesc) -> bool {
        matches!(ty, TypeDesc::Primitive(p) | TypeDesc::Boxed(p) if *p == self.primitive)
    }

    fn encode(
        &self,
        value: &Value,
        ty: &TypeDesc,
        out: &mut BytesMut,
        _registry: &CodecRegistry,
    ) -> Result<(), CodecError> {
        if matches!(ty, TypeDesc::Boxed(_)) {
            if value.is_null() {
                out.put_u8(0);
                return Ok(());
            }
            out.put_u8(1);
        } else if value.is_null() {
            return Err(CodecError::UnexpectedNull(ty.to_string()));
        }
        self.write(value, ty, out)
    }

    fn decode(
        &self,
        input: &mut Bytes,
        ty: &TypeDesc,
        _registry: &CodecRegistry,
    ) -> Result<Value, CodecError> {
        if matches!(ty, TypeDesc::Boxed(_)) && !read_flag(input)? {
            return Ok(Value::Null);
        }
        self.read(input)
    }

    fn to_json(
        &self,
        value: &Value,
        ty: &TypeDesc,
        _registry: &CodecRegistry,
    ) -> Result<serde_json::Value, CodecError> {
        Ok(match (self.primitive, value) {
            (_, Value::Null) if matches!(ty, TypeDesc::Boxed(_)) => serde_json::Value::Null,
            (_, Value::Null) => return Err(CodecError::UnexpectedNull(ty.to_string())),
            (Primitive::Bool, Value::Bool(v)) => serde_json::Value::Bool(*v),
            (Primitive::Byte, Value::Byte(v)) => serde_json::Value::from(*v),
            (Primitive::Short, Value::Short(v)) => serde_json::Value::from(*v),
            (Primitive::Int, Value::Int(v)) => serde_json::Value::from(*v),
            (Primitive::Long, Value::Long(v)) => serde_json::Value::from(*v),
            (Primitive::Float, Value::Float(v)) => float_to_json(f64::from(*v)),
            (Primitive::Double, Value::Double(v)) => float_to_json(*v),
            (Primitive::Char, Value::Char(v)) => serde_json::Value::String(v.to_string()),
            (_, other) => return Err(other.mismatch(ty)),
        })
    }

    fn from_json(
        &self,
        json: &serde_json::Value,
        ty: &TypeDesc,
        _registry: &CodecRegistry,
    ) -> Result<Value, CodecError> {
        if json.is_null() {
            return if matches!(ty, TypeDesc::Boxed(_)) {
                Ok(Value::Null)
            } else {
                Err(CodecError::UnexpectedNull(ty.to_string()))
            };
        }
        Ok(match self.primitive {
            Primitive::Bool => Value::Bool(json.as_bool().ok_or_else(|| json_mismatch(ty, json))?),
            Primitive::Byte => {
                let v = integer(json, ty)?;
                Value::Byte(i8::try_from(v).map_err(|_| out_of_range(ty, v))?)
            }
            Primitive::Short => {
                let v = integer(json, ty)?;
                Value::Short(i16::try_from(v).map_err(|_| out_of_range(ty, v))?)
            }
            Primitive::Int => {
                let v = integer(json, ty)?;
                Value::Int(i32::try_from(v).map_err(|_| out_of_range(ty, v))?)
            }
            Primitive::Long => Value::Long(integer(json, ty)?),
            #[allow(clippy::cast_possible_truncation)]
            Primitive::Float => Value::Float(float_from_json(json, ty)? as f32),
            Primitive::Double => Value::Double(float_from_json(json, ty)?),
            Primitive::Char => {
                let s = json.as_str().ok_or_else(|| json_mismatch(ty, json))?;
                let mut chars = s.chars();
                match (chars.next(), chars.next()) {
                    (Some(c), None) => Value::Char(c),
                    _ => return Err(json_mismatch(ty, json)),
                }
            }
        })
    }
}

/// Length-prefixed UTF-8; null is length `-1`.
pub struct StringCodec;

impl TypeCodec for StringCodec {
    fn name(&self) -> &'static str {
        "string"
    }

    fn supports(&self, ty: &TypeDesc) -> bool {
        matches!(ty, TypeDesc::String)
    }

    fn encode(
        &self,
        value: &Value,
        ty: &TypeDesc,
        out: &mut BytesMut,
        _registry: &CodecRegistry,
    ) -> Result<(), CodecError> {
        match value {
            Value::Null => write_length(out, None),
            Value::String(s) => write_str(out, s),
            other => Err(other.mismatch(ty)),
        }
    }

    fn decode(
        &self,
        input: &mut Bytes,
        _ty: &TypeDesc,
        _registry: &CodecRegistry,
    ) -> Result<Value, CodecError> {
        Ok(read_string(input)?.map_or(Value::Null, Value::String))
    }

    fn to_json(
        &self,
        value: &Value,
        ty: &TypeDesc,
        _registry: &CodecRegistry,
    ) -> Result<serde_json::Value, CodecError> {
        match value {
            Value::Null => Ok(serde_json::Value::Null),
            Value::String(s) => Ok(serde_json::Value::String(s.clone())),
            other => Err(other.mismatch(ty)),
        }
    }

    fn from_json(
        &self,
        json: &serde_json::Value,
        ty: &TypeDesc,
        _registry: &CodecRegistry,
    ) -> Result<Value, CodecError> {
        match json {
            serde_json::Value::Null => Ok(Value::Null),
            serde_json::Value::String(s) => Ok(Value::String(s.clone())),
            other => Err(json_mismatch(ty, other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn binary(value: &Value, ty: &TypeDesc) -> Value {
        let registry = CodecRegistry::new();
        let mut out = BytesMut::new();
        registry.encode(value, ty, &mut out).unwrap();
        let mut input = out.freeze();
        let decoded = registry.decode(&mut input, ty).unwrap();
        assert!(input.is_empty(), "trailing bytes after {ty}");
        decoded
    }

    #[test]
    fn test_boxed_null_differs_from_zero() {
        let ty = TypeDesc::Boxed(Primitive::Int);

        assert_eq!(binary(&Value::Null, &ty), Value::Null);
        assert_eq!(binary(&Value::Int(0), &ty), Value::Int(0));
    }

    #[test]
    fn test_plain_primitive_rejects_null() {
        let registry = CodecRegistry::new();
        let mut out = BytesMut::new();

        let err = registry
            .encode(&Value::Null, &TypeDesc::Primitive(Primitive::Long), &mut out)
            .unwrap_err();

        assert_eq!(err, CodecError::UnexpectedNull("i64".to_string()));
    }

    #[test]
    fn test_invalid_char_rejected() {
        let registry = CodecRegistry::new();
        let mut input = Bytes::from_static(&[0x00, 0x00, 0xD8, 0x00]);

        let err = registry
            .decode(&mut input, &TypeDesc::Primitive(Primitive::Char))
            .unwrap_err();

        assert_eq!(err, CodecError::InvalidChar(0xD800));
    }

    #[test]
    fn test_string_null_and_empty() {
        assert_eq!(binary(&Value::Null, &TypeDesc::String), Value::Null);
        assert_eq!(
            binary(&Value::String(String::new()), &TypeDesc::String),
            Value::String(String::new())
        );
    }

    #[test]
    fn test_json_non_finite_floats() {
        let registry = CodecRegistry::new();
        let ty = TypeDesc::Primitive(Primitive::Double);

        let json = registry.to_json(&Value::Double(f64::NEG_INFINITY), &ty).unwrap();
        assert_eq!(json, serde_json::json!("-Infinity"));

        let back = registry.from_json(&serde_json::json!("NaN"), &ty).unwrap();
        assert!(matches!(back, Value::Double(v) if v.is_nan()));
    }

    #[test]
    fn test_json_integer_range_checked() {
        let registry = CodecRegistry::new();

        let err = registry
            .from_json(&serde_json::json!(300), &TypeDesc::Primitive(Primitive::Byte))
            .unwrap_err();

        assert!(matches!(err, CodecError::TypeMismatch { .. }));
    }
}
