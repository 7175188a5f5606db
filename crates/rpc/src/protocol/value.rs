//! Dynamic values carried by requests and responses.

use crate::error::CodecError;
use crate::protocol::{Exception, Primitive, TypeDesc};

use std::net::{IpAddr, SocketAddr};

use serde::Serialize;
use serde::de::DeserializeOwned;

/// A value in transit.
///
/// Every non-null value knows its own runtime type, which is what lets the
/// polymorphic codec carry values declared as [`TypeDesc::Object`].
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    /// Absent value.
    Null,
    /// The single value of `void`.
    Unit,
    /// Boolean.
    Bool(bool),
    /// 8-bit integer.
    Byte(i8),
    /// 16-bit integer.
    Short(i16),
    /// 32-bit integer.
    Int(i32),
    /// 64-bit integer.
    Long(i64),
    /// 32-bit float.
    Float(f32),
    /// 64-bit float.
    Double(f64),
    /// Unicode scalar value.
    Char(char),
    /// UTF-8 string.
    String(String),
    /// Array of values of one component type.
    Array {
        /// Component type.
        element: TypeDesc,
        /// Elements.
        items: Vec<Value>,
    },
    /// Homogeneous collection.
    List {
        /// Element type.
        element: TypeDesc,
        /// Elements.
        items: Vec<Value>,
    },
    /// IP address.
    IpAddr(IpAddr),
    /// Socket address.
    SocketAddr(SocketAddr),
    /// Exception.
    Exception(Exception),
    /// Instance of a named serializable type.
    Record {
        /// Name of the type.
        type_name: String,
        /// Serialized form of the instance.
        data: serde_json::Value,
    },
}

impl Value {
    /// Captures a serde value as a record of `type_name`.
    ///
    /// # Errors
    ///
    /// Returns an error if `value` cannot be serialized.
    pub fn record<T: Serialize>(type_name: impl Into<String>, value: &T) -> Result<Self, CodecError> {
        let data = serde_json::to_value(value)
            .map_err(|e| CodecError::SerializationFailed(e.to_string()))?;
        Ok(Self::Record {
            type_name: type_name.into(),
            data,
        })
    }

    /// Converts a record back into a serde value.
    ///
    /// # Errors
    ///
    /// Returns an error if this is not a record or its data does not fit `T`.
    pub fn into_record<T: DeserializeOwned>(self) -> Result<T, CodecError> {
        match self {
            Self::Record { data, .. } => serde_json::from_value(data)
                .map_err(|e| CodecError::DeserializationFailed(e.to_string())),
            other => Err(CodecError::TypeMismatch {
                expected: "record".to_string(),
                actual: other.describe(),
            }),
        }
    }

    /// The runtime type of this value, or `None` for null.
    #[must_use]
    pub fn runtime_type(&self) -> Option<TypeDesc> {
        Some(match self {
            Self::Null => return None,
            Self::Unit => TypeDesc::Void,
            Self::Bool(_) => TypeDesc::Boxed(Primitive::Bool),
            Self::Byte(_) => TypeDesc::Boxed(Primitive::Byte),
            Self::Short(_) => TypeDesc::Boxed(Primitive::Short),
            Self::Int(_) => TypeDesc::Boxed(Primitive::Int),
            Self::Long(_) => TypeDesc::Boxed(Primitive::Long),
            Self::Float(_) => TypeDesc::Boxed(Primitive::Float),
            Self::Double(_) => TypeDesc::Boxed(Primitive::Double),
            Self::Char(_) => TypeDesc::Boxed(Primitive::Char),
            Self::String(_) => TypeDesc::String,
            Self::Array { element, .. } => TypeDesc::array(element.clone()),
            Self::List { element, .. } => TypeDesc::list(element.clone()),
            Self::IpAddr(_) => TypeDesc::IpAddr,
            Self::SocketAddr(_) => TypeDesc::SocketAddr,
            Self::Exception(_) => TypeDesc::Exception,
            Self::Record { type_name, .. } if type_name == "object" => TypeDesc::Object,
            Self::Record { type_name, .. } => TypeDesc::Named(type_name.clone()),
        })
    }

    /// Short description used in error messages.
    #[must_use]
    pub fn describe(&self) -> String {
        self.runtime_type()
            .map_or_else(|| "null".to_string(), |ty| ty.to_string())
    }

    /// Whether this is [`Value::Null`].
    #[must_use]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub(crate) fn mismatch(&self, expected: &TypeDesc) -> CodecError {
        CodecError::TypeMismatch {
            expected: expected.to_string(),
            actual: self.describe(),
        }
    }
}

/// Conversion between a Rust type and [`Value`], with its declared type.
///
/// Hand-written stubs use this to keep call sites typed.
pub trait WireValue: Sized {
    /// Declared type of `Self`.
    fn type_desc() -> TypeDesc;

    /// Converts into a dynamic value.
    fn into_value(self) -> Value;

    /// Converts from a dynamic value.
    ///
    /// # Errors
    ///
    /// Returns an error if the value does not hold a `Self`.
    fn from_value(value: Value) -> Result<Self, CodecError>;
}

macro_rules! primitive_wire_value {
    ($($ty:ty => $primitive:ident, $variant:ident;)*) => {
        $(
            impl WireValue for $ty {
                fn type_desc() -> TypeDesc {
                    TypeDesc::Primitive(Primitive::$primitive)
                }

                fn into_value(self) -> Value {
                    Value::$variant(self)
                }

                fn from_value(value: Value) -> Result<Self, CodecError> {
                    match value {
                        Value::$variant(v) => Ok(v),
                        Value::Null => Err(CodecError::UnexpectedNull(
                            Primitive::$primitive.name().to_string(),
                        )),
                        other => Err(other.mismatch(&Self::type_desc())),
                    }
                }
            }
        )*
    };
}

primitive_wire_value! {
    bool => Bool, Bool;
    i8 => Byte, Byte;
    i16 => Short, Short;
    i32 => Int, Int;
    i64 => Long, Long;
    f32 => Float, Float;
    f64 => Double, Double;
    char => Char, Char;
}

macro_rules! reference_wire_value {
    ($($ty:ty => $desc:expr, $variant:ident;)*) => {
        $(
            impl WireValue for $ty {
                fn type_desc() -> TypeDesc {
                    $desc
                }

                fn into_value(self) -> Value {
                    Value::$variant(self)
                }

                fn from_value(value: Value) -> Result<Self, CodecError> {
                    match value {
                        Value::$variant(v) => Ok(v),
                        Value::Null => Err(CodecError::UnexpectedNull(Self::type_desc().to_string())),
                        other => Err(other.mismatch(&Self::type_desc())),
                    }
                }
            }
        )*
    };
}

reference_wire_value! {
    String => TypeDesc::String, String;
    IpAddr => TypeDesc::IpAddr, IpAddr;
    SocketAddr => TypeDesc::SocketAddr, SocketAddr;
    Exception => TypeDesc::Exception, Exception;
}

impl WireValue for () {
    fn type_desc() -> TypeDesc {
        TypeDesc::Void
    }

    fn into_value(self) -> Value {
        Value::Unit
    }

    fn from_value(value: Value) -> Result<Self, CodecError> {
        match value {
            Value::Unit | Value::Null => Ok(()),
            other => Err(other.mismatch(&TypeDesc::Void)),
        }
    }
}

impl<T: WireValue> WireValue for Option<T> {
    fn type_desc() -> TypeDesc {
        match T::type_desc() {
            TypeDesc::Primitive(p) => TypeDesc::Boxed(p),
            other => other,
        }
    }

    fn into_value(self) -> Value {
        self.map_or(Value::Null, WireValue::into_value)
    }

    fn from_value(value: Value) -> Result<Self, CodecError> {
        match value {
            Value::Null => Ok(None),
            other => T::from_value(other).map(Some),
        }
    }
}

impl<T: WireValue> WireValue for Vec<T> {
    fn type_desc() -> TypeDesc {
        TypeDesc::list(T::type_desc())
    }

    fn into_value(self) -> Value {
        Value::List {
            element: T::type_desc(),
            items: self.into_iter().map(WireValue::into_value).collect(),
        }
    }

    fn from_value(value: Value) -> Result<Self, CodecError> {
        match value {
            Value::List { items, .. } | Value::Array { items, .. } => {
                items.into_iter().map(T::from_value).collect()
            }
            Value::Null => Err(CodecError::UnexpectedNull(Self::type_desc().to_string())),
            other => Err(other.mismatch(&Self::type_desc())),
        }
    }
}
