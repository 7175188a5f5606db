//! IP and socket addresses.
//!
//! Binary form is a family byte (`0` null, `4` or `6`), the address octets
//! and, for socket addresses, a `u16` port. The JSON form is the usual text
//! notation.

use super::{ensure, json_mismatch, read_u16, read_u8};
use crate::error::CodecError;
use crate::protocol::{CodecRegistry, TypeCodec, TypeDesc, Value};

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::{Buf, BufMut, Bytes, BytesMut};

const FAMILY_NULL: u8 = 0;
const FAMILY_V4: u8 = 4;
const FAMILY_V6: u8 = 6;

fn write_ip(out: &mut BytesMut, ip: IpAddr) {
    match ip {
        IpAddr::V4(v4) => {
            out.put_u8(FAMILY_V4);
            out.put_slice(&v4.octets());
        }
        IpAddr::V6(v6) => {
            out.put_u8(FAMILY_V6);
            out.put_slice(&v6.octets());
        }
    }
}

fn read_ip(input: &mut Bytes, family: u8) -> Result<IpAddr, CodecError> {
    match family {
        FAMILY_V4 => {
            ensure(input, 4)?;
            let mut octets = [0_u8; 4];
            input.copy_to_slice(&mut octets);
            Ok(IpAddr::V4(Ipv4Addr::from(octets)))
        }
        FAMILY_V6 => {
            ensure(input, 16)?;
            let mut octets = [0_u8; 16];
            input.copy_to_slice(&mut octets);
            Ok(IpAddr::V6(Ipv6Addr::from(octets)))
        }
        other => Err(CodecError::InvalidAddressFamily(other)),
    }
}

/// [`TypeDesc::IpAddr`] and [`TypeDesc::SocketAddr`].
pub struct NetworkAddressCodec;

impl TypeCodec for NetworkAddressCodec {
    fn name(&self) -> &'static str {
        "network_address"
    }

    fn supports(&self, ty: &TypeDesc) -> bool {
        matches!(ty, TypeDesc::IpAddr | TypeDesc::SocketAddr)
    }

    fn encode(
        &self,
        value: &Value,
        ty: &TypeDesc,
        out: &mut BytesMut,
        _registry: &CodecRegistry,
    ) -> Result<(), CodecError> {
        match (ty, value) {
            (_, Value::Null) => out.put_u8(FAMILY_NULL),
            (TypeDesc::IpAddr, Value::IpAddr(ip)) => write_ip(out, *ip),
            (TypeDesc::SocketAddr, Value::SocketAddr(addr)) => {
                write_ip(out, addr.ip());
                out.put_u16(addr.port());
            }
            (_, other) => return Err(other.mismatch(ty)),
        }
        Ok(())
    }

    fn decode(
        &self,
        input: &mut Bytes,
        ty: &TypeDesc,
        _registry: &CodecRegistry,
    ) -> Result<Value, CodecError> {
        let family = read_u8(input)?;
        if family == FAMILY_NULL {
            return Ok(Value::Null);
        }
        let ip = read_ip(input, family)?;
        if matches!(ty, TypeDesc::SocketAddr) {
            let port = read_u16(input)?;
            return Ok(Value::SocketAddr(SocketAddr::new(ip, port)));
        }
        Ok(Value::IpAddr(ip))
    }

    fn to_json(
        &self,
        value: &Value,
        ty: &TypeDesc,
        _registry: &CodecRegistry,
    ) -> Result<serde_json::Value, CodecError> {
        match (ty, value) {
            (_, Value::Null) => Ok(serde_json::Value::Null),
            (TypeDesc::IpAddr, Value::IpAddr(ip)) => Ok(serde_json::Value::String(ip.to_string())),
            (TypeDesc::SocketAddr, Value::SocketAddr(addr)) => {
                Ok(serde_json::Value::String(addr.to_string()))
            }
            (_, other) => Err(other.mismatch(ty)),
        }
    }

    fn from_json(
        &self,
        json: &serde_json::Value,
        ty: &TypeDesc,
        _registry: &CodecRegistry,
    ) -> Result<Value, CodecError> {
        let text = match json {
            serde_json::Value::Null => return Ok(Value::Null),
            serde_json::Value::String(text) => text,
            other => return Err(json_mismatch(ty, other)),
        };
        let parsed = if matches!(ty, TypeDesc::SocketAddr) {
            text.parse().map(Value::SocketAddr).ok()
        } else {
            text.parse().map(Value::IpAddr).ok()
        };
        parsed.ok_or_else(|| json_mismatch(ty, json))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_socket_addresses_keep_port() {
        let registry = CodecRegistry::new();
        for text in ["127.0.0.1:8080", "[::1]:65535"] {
            let value = Value::SocketAddr(text.parse().unwrap());

            let mut out = BytesMut::new();
            registry.encode(&value, &TypeDesc::SocketAddr, &mut out).unwrap();
            let decoded = registry
                .decode(&mut out.freeze(), &TypeDesc::SocketAddr)
                .unwrap();

            assert_eq!(decoded, value);
        }
    }

    #[test]
    fn test_unknown_family_rejected() {
        let registry = CodecRegistry::new();
        let mut input = Bytes::from_static(&[5, 1, 2, 3, 4]);

        let err = registry.decode(&mut input, &TypeDesc::IpAddr).unwrap_err();

        assert_eq!(err, CodecError::InvalidAddressFamily(5));
    }

    #[test]
    fn test_json_text_form() {
        let registry = CodecRegistry::new();
        let value = Value::IpAddr("10.0.0.1".parse().unwrap());

        let json = registry.to_json(&value, &TypeDesc::IpAddr).unwrap();

        assert_eq!(json, serde_json::json!("10.0.0.1"));
        assert_eq!(registry.from_json(&json, &TypeDesc::IpAddr).unwrap(), value);
    }
}
