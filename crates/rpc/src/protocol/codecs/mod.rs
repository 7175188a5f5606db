//! Built-in codec strategies.
//!
//! Binary conventions shared by every strategy: integers are big-endian,
//! nullable reference types carry either a one-byte presence flag or an
//! `i32` length where `-1` means null, and serde-backed payloads are CBOR
//! behind a `u32` length.

mod network;
mod object;
mod scalar;
mod sequence;

pub use network::NetworkAddressCodec;
pub use object::{ExceptionCodec, PolymorphicCodec, SerializableCodec};
pub use scalar::{PrimitiveCodec, StringCodec, VoidCodec};
pub use sequence::{ArrayCodec, ListCodec};

use crate::error::CodecError;
use crate::protocol::TypeDesc;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::Serialize;
use serde::de::DeserializeOwned;

/// Length value meaning null.
pub(crate) const NULL_LENGTH: i32 = -1;

pub(crate) fn ensure(input: &Bytes, needed: usize) -> Result<(), CodecError> {
    if input.remaining() < needed {
        return Err(CodecError::Truncated {
            needed,
            remaining: input.remaining(),
        });
    }
    Ok(())
}

pub(crate) fn read_u8(input: &mut Bytes) -> Result<u8, CodecError> {
    ensure(input, 1)?;
    Ok(input.get_u8())
}

pub(crate) fn read_u16(input: &mut Bytes) -> Result<u16, CodecError> {
    ensure(input, 2)?;
    Ok(input.get_u16())
}

pub(crate) fn read_i32(input: &mut Bytes) -> Result<i32, CodecError> {
    ensure(input, 4)?;
    Ok(input.get_i32())
}

pub(crate) fn read_u32(input: &mut Bytes) -> Result<u32, CodecError> {
    ensure(input, 4)?;
    Ok(input.get_u32())
}

pub(crate) fn read_u64(input: &mut Bytes) -> Result<u64, CodecError> {
    ensure(input, 8)?;
    Ok(input.get_u64())
}

pub(crate) fn read_flag(input: &mut Bytes) -> Result<bool, CodecError> {
    match read_u8(input)? {
        0 => Ok(false),
        1 => Ok(true),
        other => Err(CodecError::InvalidFlag(other)),
    }
}

fn too_long(len: usize) -> CodecError {
    CodecError::InvalidLength(i64::try_from(len).unwrap_or(i64::MAX))
}

pub(crate) fn write_length(out: &mut BytesMut, len: Option<usize>) -> Result<(), CodecError> {
    match len {
        None => out.put_i32(NULL_LENGTH),
        Some(len) => {
            let len = i32::try_from(len).map_err(|_| too_long(len))?;
            out.put_i32(len);
        }
    }
    Ok(())
}

/// Reads an `i32` length; `None` is the null marker.
pub(crate) fn read_length(input: &mut Bytes) -> Result<Option<usize>, CodecError> {
    match read_i32(input)? {
        NULL_LENGTH => Ok(None),
        len if len < 0 => Err(CodecError::InvalidLength(i64::from(len))),
        #[allow(clippy::cast_sign_loss)]
        len => Ok(Some(len as usize)),
    }
}

pub(crate) fn write_str(out: &mut BytesMut, s: &str) -> Result<(), CodecError> {
    write_length(out, Some(s.len()))?;
    out.put_slice(s.as_bytes());
    Ok(())
}

pub(crate) fn read_string(input: &mut Bytes) -> Result<Option<String>, CodecError> {
    let Some(len) = read_length(input)? else {
        return Ok(None);
    };
    ensure(input, len)?;
    let raw = input.split_to(len);
    String::from_utf8(raw.to_vec())
        .map(Some)
        .map_err(|_| CodecError::InvalidUtf8)
}

/// Writes `value` as length-prefixed CBOR.
pub(crate) fn write_cbor<T: Serialize>(out: &mut BytesMut, value: &T) -> Result<(), CodecError> {
    let mut buf = Vec::new();
    ciborium::ser::into_writer(value, &mut buf)?;
    let len = u32::try_from(buf.len()).map_err(|_| too_long(buf.len()))?;
    out.put_u32(len);
    out.put_slice(&buf);
    Ok(())
}

pub(crate) fn read_cbor<T: DeserializeOwned>(input: &mut Bytes) -> Result<T, CodecError> {
    let len = read_u32(input)? as usize;
    ensure(input, len)?;
    let raw = input.split_to(len);
    Ok(ciborium::de::from_reader(raw.as_ref())?)
}

pub(crate) fn json_mismatch(expected: &TypeDesc, json: &serde_json::Value) -> CodecError {
    let actual = match json {
        serde_json::Value::Null => "json null",
        serde_json::Value::Bool(_) => "json bool",
        serde_json::Value::Number(_) => "json number",
        serde_json::Value::String(_) => "json string",
        serde_json::Value::Array(_) => "json array",
        serde_json::Value::Object(_) => "json object",
    };
    CodecError::TypeMismatch {
        expected: expected.to_string(),
        actual: actual.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_length_prefix_null_marker() {
        let mut out = BytesMut::new();
        write_length(&mut out, None).unwrap();
        write_length(&mut out, Some(0)).unwrap();

        let mut input = out.freeze();
        assert_eq!(read_length(&mut input).unwrap(), None);
        assert_eq!(read_length(&mut input).unwrap(), Some(0));
    }

    #[test]
    fn test_negative_length_rejected() {
        let mut input = Bytes::from_static(&[0xFF, 0xFF, 0xFF, 0xFE]);
        assert_eq!(read_length(&mut input), Err(CodecError::InvalidLength(-2)));
    }

    #[test]
    fn test_truncated_string() {
        let mut input = Bytes::from_static(&[0, 0, 0, 5, b'a', b'b']);
        assert_eq!(
            read_string(&mut input),
            Err(CodecError::Truncated {
                needed: 5,
                remaining: 2
            })
        );
    }
}
