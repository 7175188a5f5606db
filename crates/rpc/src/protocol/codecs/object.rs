//! Exceptions, named serializable types and polymorphic `object` values.

use super::{json_mismatch, read_cbor, read_flag, read_string, write_cbor, write_str};
use crate::error::CodecError;
use crate::protocol::{CodecRegistry, Exception, TypeCodec, TypeDesc, Value};

use bytes::{BufMut, Bytes, BytesMut};

const ABSENT: u8 = 0;
const PRESENT: u8 = 1;

/// Exceptions, with local stack frames stripped before they leave the process.
pub struct ExceptionCodec;

impl TypeCodec for ExceptionCodec {
    fn name(&self) -> &'static str {
        "exception"
    }

    fn supports(&self, ty: &TypeDesc) -> bool {
        matches!(ty, TypeDesc::Exception)
    }

    fn encode(
        &self,
        value: &Value,
        ty: &TypeDesc,
        out: &mut BytesMut,
        _registry: &CodecRegistry,
    ) -> Result<(), CodecError> {
        match value {
            Value::Null => {
                out.put_u8(ABSENT);
                Ok(())
            }
            Value::Exception(exception) => {
                out.put_u8(PRESENT);
                write_cbor(out, &exception.without_stack_trace())
            }
            other => Err(other.mismatch(ty)),
        }
    }

    fn decode(
        &self,
        input: &mut Bytes,
        _ty: &TypeDesc,
        _registry: &CodecRegistry,
    ) -> Result<Value, CodecError> {
        if !read_flag(input)? {
            return Ok(Value::Null);
        }
        read_cbor::<Exception>(input).map(Value::Exception)
    }

    fn to_json(
        &self,
        value: &Value,
        ty: &TypeDesc,
        _registry: &CodecRegistry,
    ) -> Result<serde_json::Value, CodecError> {
        match value {
            Value::Null => Ok(serde_json::Value::Null),
            Value::Exception(exception) => serde_json::to_value(exception.without_stack_trace())
                .map_err(|e| CodecError::SerializationFailed(e.to_string())),
            other => Err(other.mismatch(ty)),
        }
    }

    fn from_json(
        &self,
        json: &serde_json::Value,
        _ty: &TypeDesc,
        _registry: &CodecRegistry,
    ) -> Result<Value, CodecError> {
        if json.is_null() {
            return Ok(Value::Null);
        }
        serde_json::from_value::<Exception>(json.clone())
            .map(Value::Exception)
            .map_err(|e| CodecError::DeserializationFailed(e.to_string()))
    }
}

/// Any [`TypeDesc::Named`] type, carried as CBOR of its serde form.
pub struct SerializableCodec;

impl SerializableCodec {
    fn data<'v>(value: &'v Value, ty: &TypeDesc) -> Result<&'v serde_json::Value, CodecError> {
        match (ty, value) {
            (TypeDesc::Named(expected), Value::Record { type_name, data }) if type_name == expected => {
                Ok(data)
            }
            (_, other) => Err(other.mismatch(ty)),
        }
    }

    fn record(ty: &TypeDesc, data: serde_json::Value) -> Value {
        Value::Record {
            type_name: ty.to_string(),
            data,
        }
    }
}

impl TypeCodec for SerializableCodec {
    fn name(&self) -> &'static str {
        "serializable"
    }

    fn supports(&self, ty: &TypeDesc) -> bool {
        matches!(ty, TypeDesc::Named(_))
    }

    fn encode(
        &self,
        value: &Value,
        ty: &TypeDesc,
        out: &mut BytesMut,
        _registry: &CodecRegistry,
    ) -> Result<(), CodecError> {
        if value.is_null() {
            out.put_u8(ABSENT);
            return Ok(());
        }
        let data = Self::data(value, ty)?;
        out.put_u8(PRESENT);
        write_cbor(out, data)
    }

    fn decode(
        &self,
        input: &mut Bytes,
        ty: &TypeDesc,
        _registry: &CodecRegistry,
    ) -> Result<Value, CodecError> {
        if !read_flag(input)? {
            return Ok(Value::Null);
        }
        let data = read_cbor::<serde_json::Value>(input)?;
        Ok(Self::record(ty, data))
    }

    fn to_json(
        &self,
        value: &Value,
        ty: &TypeDesc,
        _registry: &CodecRegistry,
    ) -> Result<serde_json::Value, CodecError> {
        if value.is_null() {
            return Ok(serde_json::Value::Null);
        }
        Self::data(value, ty).cloned()
    }

    fn from_json(
        &self,
        json: &serde_json::Value,
        ty: &TypeDesc,
        _registry: &CodecRegistry,
    ) -> Result<Value, CodecError> {
        if json.is_null() {
            return Ok(Value::Null);
        }
        Ok(Self::record(ty, json.clone()))
    }
}

/// Values declared as [`TypeDesc::Object`].
///
/// The canonical name of the runtime type goes first so the reader can pick
/// the concrete codec. A runtime type of `object` itself carries no usable
/// type information and is rejected, as is any runtime type no strategy
/// supports.
pub struct PolymorphicCodec;

impl PolymorphicCodec {
    fn runtime_type(value: &Value) -> Result<TypeDesc, CodecError> {
        let ty = value
            .runtime_type()
            .ok_or_else(|| CodecError::UnexpectedNull(TypeDesc::Object.to_string()))?;
        if ty == TypeDesc::Object {
            return Err(CodecError::AbstractType);
        }
        // Record names travel as text and must survive the trip.
        let name = ty.to_string();
        if name.parse::<TypeDesc>().ok().as_ref() != Some(&ty) {
            return Err(CodecError::InvalidTypeName(name));
        }
        Ok(ty)
    }

    fn parse_type(name: &str) -> Result<TypeDesc, CodecError> {
        match name.parse::<TypeDesc>()? {
            TypeDesc::Object => Err(CodecError::AbstractType),
            ty => Ok(ty),
        }
    }
}

impl TypeCodec for PolymorphicCodec {
    fn name(&self) -> &'static str {
        "polymorphic"
    }

    fn supports(&self, ty: &TypeDesc) -> bool {
        matches!(ty, TypeDesc::Object)
    }

    fn encode(
        &self,
        value: &Value,
        _ty: &TypeDesc,
        out: &mut BytesMut,
        registry: &CodecRegistry,
    ) -> Result<(), CodecError> {
        if value.is_null() {
            out.put_u8(ABSENT);
            return Ok(());
        }
        let runtime = Self::runtime_type(value)?;
        let codec = registry.lookup(&runtime)?;
        out.put_u8(PRESENT);
        write_str(out, &runtime.to_string())?;
        codec.encode(value, &runtime, out, registry)
    }

    fn decode(
        &self,
        input: &mut Bytes,
        _ty: &TypeDesc,
        registry: &CodecRegistry,
    ) -> Result<Value, CodecError> {
        if !read_flag(input)? {
            return Ok(Value::Null);
        }
        let name = read_string(input)?
            .ok_or_else(|| CodecError::InvalidTypeName("null".to_string()))?;
        let runtime = Self::parse_type(&name)?;
        registry.decode(input, &runtime)
    }

    fn to_json(
        &self,
        value: &Value,
        _ty: &TypeDesc,
        registry: &CodecRegistry,
    ) -> Result<serde_json::Value, CodecError> {
        if value.is_null() {
            return Ok(serde_json::Value::Null);
        }
        let runtime = Self::runtime_type(value)?;
        let inner = registry.to_json(value, &runtime)?;
        Ok(serde_json::json!({
            "type": runtime.to_string(),
            "value": inner,
        }))
    }

    fn from_json(
        &self,
        json: &serde_json::Value,
        ty: &TypeDesc,
        registry: &CodecRegistry,
    ) -> Result<Value, CodecError> {
        if json.is_null() {
            return Ok(Value::Null);
        }
        let name = json
            .get("type")
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| json_mismatch(ty, json))?;
        let runtime = Self::parse_type(name)?;
        let inner = json.get("value").unwrap_or(&serde_json::Value::Null);
        registry.from_json(inner, &runtime)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Primitive;

    fn round_trip(value: &Value, ty: &TypeDesc) -> Value {
        let registry = CodecRegistry::new();
        let mut out = BytesMut::new();
        registry.encode(value, ty, &mut out).unwrap();
        registry.decode(&mut out.freeze(), ty).unwrap()
    }

    #[test]
    fn test_exception_stack_trace_stripped() {
        let exception = Exception::new("IoError", "disk gone")
            .with_frame("store.rs:10")
            .with_cause(Exception::new("Errno", "5").with_frame("sys.rs:1"));

        let decoded = round_trip(&Value::Exception(exception.clone()), &TypeDesc::Exception);

        assert_eq!(decoded, Value::Exception(exception.without_stack_trace()));
    }

    #[test]
    fn test_polymorphic_carries_runtime_type() {
        let values = [
            Value::Int(-1),
            Value::String("hi".to_string()),
            Value::List {
                element: TypeDesc::Primitive(Primitive::Long),
                items: vec![Value::Long(i64::MAX)],
            },
            Value::record("geo.Point", &serde_json::json!({"x": 1, "y": 2})).unwrap(),
            Value::Exception(Exception::new("E", "boom")),
        ];

        for value in values {
            assert_eq!(round_trip(&value, &TypeDesc::Object), value);
        }
    }

    #[test]
    fn test_abstract_runtime_type_rejected() {
        let registry = CodecRegistry::new();
        let value = Value::Record {
            type_name: "object".to_string(),
            data: serde_json::json!({}),
        };

        let err = registry
            .encode(&value, &TypeDesc::Object, &mut BytesMut::new())
            .unwrap_err();

        assert_eq!(err, CodecError::AbstractType);
    }

    #[test]
    fn test_unknown_runtime_type_is_hard_error() {
        let mut registry = CodecRegistry::empty();
        registry.register(crate::protocol::precedence::POLYMORPHIC, PolymorphicCodec);

        let err = registry
            .encode(&Value::Int(1), &TypeDesc::Object, &mut BytesMut::new())
            .unwrap_err();

        assert_eq!(err, CodecError::Unsupported("i32?".to_string()));
    }

    #[test]
    fn test_unparsable_type_name_rejected() {
        let registry = CodecRegistry::new();
        let mut out = BytesMut::new();
        out.put_u8(PRESENT);
        write_str(&mut out, "not a type").unwrap();

        let err = registry
            .decode(&mut out.freeze(), &TypeDesc::Object)
            .unwrap_err();

        assert_eq!(err, CodecError::InvalidTypeName("not a type".to_string()));
    }

    #[test]
    fn test_void_element_count_rejected() {
        let registry = CodecRegistry::new();
        for name in ["[void]", "list<void>"] {
            let mut out = BytesMut::new();
            out.put_u8(PRESENT);
            write_str(&mut out, name).unwrap();
            out.put_i32(20_000_000);

            let err = registry
                .decode(&mut out.freeze(), &TypeDesc::Object)
                .unwrap_err();

            assert_eq!(err, CodecError::InvalidTypeName(name.to_string()));
        }

        let json = serde_json::json!({ "type": "[void]", "value": [] });
        assert!(registry.from_json(&json, &TypeDesc::Object).is_err());
    }

    #[test]
    fn test_deeply_nested_type_name_rejected() {
        let registry = CodecRegistry::new();
        let name = format!("{}i32{}", "[".repeat(30_000), "]".repeat(30_000));
        let mut out = BytesMut::new();
        out.put_u8(PRESENT);
        write_str(&mut out, &name).unwrap();

        let err = registry
            .decode(&mut out.freeze(), &TypeDesc::Object)
            .unwrap_err();

        assert!(matches!(err, CodecError::InvalidTypeName(_)));
    }

    #[test]
    fn test_polymorphic_json_form() {
        let registry = CodecRegistry::new();

        let json = registry.to_json(&Value::Double(0.5), &TypeDesc::Object).unwrap();

        assert_eq!(json, serde_json::json!({"type": "f64?", "value": 0.5}));
        assert_eq!(
            registry.from_json(&json, &TypeDesc::Object).unwrap(),
            Value::Double(0.5)
        );
    }
}
