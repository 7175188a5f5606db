//! Declared types.
//!
//! A [`TypeDesc`] stands in for the static type of a parameter, return value or
//! field. Codecs are selected by declared type, and the canonical text form of
//! a type is what the polymorphic codec writes ahead of a value.

use crate::error::CodecError;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Fixed-width primitive types.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub enum Primitive {
    /// Boolean.
    Bool,
    /// Signed 8-bit integer.
    Byte,
    /// Signed 16-bit integer.
    Short,
    /// Signed 32-bit integer.
    Int,
    /// Signed 64-bit integer.
    Long,
    /// 32-bit float.
    Float,
    /// 64-bit float.
    Double,
    /// Unicode scalar value.
    Char,
}

impl Primitive {
    /// All primitives, in codec precedence order.
    pub const ALL: [Self; 8] = [
        Self::Bool,
        Self::Byte,
        Self::Short,
        Self::Int,
        Self::Long,
        Self::Float,
        Self::Double,
        Self::Char,
    ];

    /// Canonical name of the primitive.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Bool => "bool",
            Self::Byte => "i8",
            Self::Short => "i16",
            Self::Int => "i32",
            Self::Long => "i64",
            Self::Float => "f32",
            Self::Double => "f64",
            Self::Char => "char",
        }
    }

    /// Encoded width in bytes.
    #[must_use]
    pub const fn width(self) -> usize {
        match self {
            Self::Bool | Self::Byte => 1,
            Self::Short => 2,
            Self::Int | Self::Float | Self::Char => 4,
            Self::Long | Self::Double => 8,
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|p| p.name() == name)
    }
}

/// The declared type of a value.
#[derive(Clone, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub enum TypeDesc {
    /// No value.
    Void,
    /// A primitive that can never be null.
    Primitive(Primitive),
    /// A nullable (boxed) primitive.
    Boxed(Primitive),
    /// A nullable UTF-8 string.
    String,
    /// A nullable array with the given component type.
    Array(Box<TypeDesc>),
    /// A nullable homogeneous collection with the given element type.
    List(Box<TypeDesc>),
    /// An IP address.
    IpAddr,
    /// An IP address and port.
    SocketAddr,
    /// An exception.
    Exception,
    /// An arbitrary serializable type, identified by name.
    Named(String),
    /// Any value; the runtime type travels with it.
    Object,
}

impl TypeDesc {
    /// Array of `component`.
    #[must_use]
    pub fn array(component: Self) -> Self {
        Self::Array(Box::new(component))
    }

    /// Collection of `element`.
    #[must_use]
    pub fn list(element: Self) -> Self {
        Self::List(Box::new(element))
    }

    /// Named serializable type.
    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        Self::Named(name.into())
    }

    /// Whether `void` appears as an array component or list element, at any
    /// depth. Such types have no wire form.
    #[must_use]
    pub fn has_void_element(&self) -> bool {
        match self {
            Self::Array(inner) | Self::List(inner) => {
                matches!(**inner, Self::Void) || inner.has_void_element()
            }
            _ => false,
        }
    }

    /// Whether a null value is representable under this type.
    #[must_use]
    pub const fn is_nullable(&self) -> bool {
        !matches!(self, Self::Void | Self::Primitive(_))
    }
}

impl fmt::Display for TypeDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Void => f.write_str("void"),
            Self::Primitive(p) => f.write_str(p.name()),
            Self::Boxed(p) => write!(f, "{}?", p.name()),
            Self::String => f.write_str("string"),
            Self::Array(component) => write!(f, "[{component}]"),
            Self::List(element) => write!(f, "list<{element}>"),
            Self::IpAddr => f.write_str("ip_addr"),
            Self::SocketAddr => f.write_str("socket_addr"),
            Self::Exception => f.write_str("exception"),
            Self::Named(name) => f.write_str(name),
            Self::Object => f.write_str("object"),
        }
    }
}

impl FromStr for TypeDesc {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parser = Parser {
            input: s,
            pos: 0,
            depth: 0,
        };
        let ty = parser.parse_type()?;
        if parser.pos != s.len() {
            return Err(CodecError::InvalidTypeName(s.to_string()));
        }
        Ok(ty)
    }
}

/// Deepest array or list nesting a type name may have.
pub const MAX_TYPE_DEPTH: usize = 32;

struct Parser<'a> {
    input: &'a str,
    pos: usize,
    depth: usize,
}

impl<'a> Parser<'a> {
    fn rest(&self) -> &str {
        &self.input[self.pos..]
    }

    fn invalid(&self) -> CodecError {
        CodecError::InvalidTypeName(self.input.to_string())
    }

    fn eat(&mut self, token: &str) -> bool {
        if self.rest().starts_with(token) {
            self.pos += token.len();
            true
        } else {
            false
        }
    }

    fn parse_type(&mut self) -> Result<TypeDesc, CodecError> {
        if self.eat("[") {
            let component = self.parse_element()?;
            if !self.eat("]") {
                return Err(self.invalid());
            }
            return Ok(TypeDesc::array(component));
        }

        let ident = self.identifier()?;
        if ident == "list" {
            if !self.eat("<") {
                return Err(self.invalid());
            }
            let element = self.parse_element()?;
            if !self.eat(">") {
                return Err(self.invalid());
            }
            return Ok(TypeDesc::list(element));
        }

        if let Some(primitive) = Primitive::from_name(ident) {
            return Ok(if self.eat("?") {
                TypeDesc::Boxed(primitive)
            } else {
                TypeDesc::Primitive(primitive)
            });
        }

        Ok(match ident {
            "void" => TypeDesc::Void,
            "string" => TypeDesc::String,
            "ip_addr" => TypeDesc::IpAddr,
            "socket_addr" => TypeDesc::SocketAddr,
            "exception" => TypeDesc::Exception,
            "object" => TypeDesc::Object,
            name => TypeDesc::Named(name.to_string()),
        })
    }

    fn parse_element(&mut self) -> Result<TypeDesc, CodecError> {
        if self.depth >= MAX_TYPE_DEPTH {
            return Err(self.invalid());
        }
        self.depth += 1;
        let element = self.parse_type()?;
        self.depth -= 1;
        if element == TypeDesc::Void {
            return Err(self.invalid());
        }
        Ok(element)
    }

    fn identifier(&mut self) -> Result<&'a str, CodecError> {
        let input = self.input;
        let rest = &input[self.pos..];
        let mut chars = rest.char_indices();
        match chars.next() {
            Some((_, c)) if c.is_ascii_alphabetic() || c == '_' => {}
            _ => return Err(self.invalid()),
        }
        let len = chars
            .find(|(_, c)| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | ':')))
            .map_or(rest.len(), |(i, _)| i);
        let start = self.pos;
        self.pos += len;
        Ok(&input[start..start + len])
    }
}
