//! Compact binary wire format.
//!
//! No field names travel on the wire: both ends must build the same
//! [`DispatchTable`] and agree on declared types out of band.
//!
//! ```text
//! request:  version:u8 kind:u8=1 id:u64 ordinal:u16 argc:u16 args...
//! response: version:u8 kind:u8=2 has_id:u8 [id:u64] status:u8
//!           status 0: result
//!           status 1: code:i32 message:string payload:object
//! ```

use crate::dispatch::DispatchTable;
use crate::error::{CodecError, ProtocolError, Result};
use crate::protocol::codecs::{read_flag, read_i32, read_string, read_u8, read_u16, read_u64, write_str};
use crate::protocol::message::{ErrorDescriptor, Request, Response, codes};
use crate::protocol::wire::{
    MalformedRequest, ResponseDecodeError, WireCodec, check_arity, missing_return_type,
};
use crate::protocol::{CodecRegistry, TypeDesc, Value};

use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Protocol version byte.
pub const VERSION: u8 = 0x01;

const KIND_REQUEST: u8 = 0x01;
const KIND_RESPONSE: u8 = 0x02;
const STATUS_OK: u8 = 0x00;
const STATUS_ERROR: u8 = 0x01;

// version + kind + id
const REQUEST_HEADER_LEN: usize = 10;

/// Binary [`WireCodec`].
pub struct BinaryWireCodec {
    registry: Arc<CodecRegistry>,
}

impl BinaryWireCodec {
    /// Codec encoding values with `registry`.
    #[must_use]
    pub const fn new(registry: Arc<CodecRegistry>) -> Self {
        Self { registry }
    }

    fn decode_body(
        &self,
        input: &mut Bytes,
        returns: Option<&TypeDesc>,
    ) -> Result<std::result::Result<Value, ErrorDescriptor>> {
        let outcome = match read_u8(input)? {
            STATUS_OK => {
                let ty = returns.ok_or_else(missing_return_type)?;
                Ok(self.registry.decode(input, ty)?)
            }
            STATUS_ERROR => {
                let code = read_i32(input)?;
                let message = read_string(input)?.unwrap_or_default();
                let payload = self.registry.decode(input, &TypeDesc::Object)?;
                Err(ErrorDescriptor {
                    code,
                    message,
                    payload: (!payload.is_null()).then_some(payload),
                })
            }
            other => {
                return Err(ProtocolError::Malformed(format!("unknown status {other:#04x}")).into());
            }
        };
        if input.has_remaining() {
            return Err(trailing(input).into());
        }
        Ok(outcome)
    }
}

fn trailing(input: &Bytes) -> ProtocolError {
    ProtocolError::Malformed(format!("{} trailing bytes", input.remaining()))
}

impl WireCodec for BinaryWireCodec {
    fn name(&self) -> &'static str {
        "binary"
    }

    fn encode_request(&self, request: &Request) -> Result<Bytes> {
        check_arity(request)?;
        let argc = u16::try_from(request.args.len())
            .map_err(|_| CodecError::InvalidLength(i64::from(u16::MAX) + 1))?;

        let mut out = BytesMut::with_capacity(64);
        out.put_u8(VERSION);
        out.put_u8(KIND_REQUEST);
        out.put_u64(request.id);
        out.put_u16(request.method.ordinal());
        out.put_u16(argc);
        for (arg, ty) in request.args.iter().zip(request.method.signature().params()) {
            self.registry.encode(arg, ty, &mut out)?;
        }
        Ok(out.freeze())
    }

    fn decode_request(
        &self,
        frame: Bytes,
        table: &DispatchTable,
    ) -> std::result::Result<Request, MalformedRequest> {
        let mut input = frame;
        if input.remaining() < REQUEST_HEADER_LEN {
            return Err(MalformedRequest::new(
                None,
                codes::PARSE_ERROR,
                "truncated request header",
            ));
        }
        let version = input.get_u8();
        if version != VERSION {
            return Err(MalformedRequest::new(
                None,
                codes::INVALID_REQUEST,
                format!("unsupported protocol version {version:#04x}"),
            ));
        }
        let kind = input.get_u8();
        let id = input.get_u64();
        if kind != KIND_REQUEST {
            return Err(MalformedRequest::new(
                Some(id),
                codes::INVALID_REQUEST,
                format!("expected a request, got kind {kind:#04x}"),
            ));
        }

        let ordinal = read_u16(&mut input)
            .map_err(|e| MalformedRequest::new(Some(id), codes::INVALID_REQUEST, e.to_string()))?;
        let entry = table
            .by_ordinal(ordinal)
            .map_err(|e| MalformedRequest::new(Some(id), codes::METHOD_NOT_FOUND, e.to_string()))?;
        let argc = read_u16(&mut input)
            .map_err(|e| MalformedRequest::new(Some(id), codes::INVALID_REQUEST, e.to_string()))?;

        let params = entry.signature().params();
        if usize::from(argc) != params.len() {
            return Err(MalformedRequest::invalid_argument(
                id,
                format!(
                    "{} takes {} arguments, got {argc}",
                    entry.wire_name(),
                    params.len()
                ),
            ));
        }

        let args = params
            .iter()
            .map(|ty| self.registry.decode(&mut input, ty))
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| MalformedRequest::invalid_argument(id, e))?;
        if input.has_remaining() {
            return Err(MalformedRequest::invalid_argument(id, trailing(&input)));
        }

        Ok(Request {
            id,
            method: Arc::clone(entry),
            args,
        })
    }

    fn encode_response(&self, response: &Response, returns: Option<&TypeDesc>) -> Result<Bytes> {
        let mut out = BytesMut::with_capacity(32);
        out.put_u8(VERSION);
        out.put_u8(KIND_RESPONSE);
        match response.id {
            Some(id) => {
                out.put_u8(1);
                out.put_u64(id);
            }
            None => out.put_u8(0),
        }

        match &response.outcome {
            Ok(value) => {
                let ty = returns.ok_or_else(missing_return_type)?;
                out.put_u8(STATUS_OK);
                self.registry.encode(value, ty, &mut out)?;
            }
            Err(error) => {
                out.put_u8(STATUS_ERROR);
                out.put_i32(error.code);
                write_str(&mut out, &error.message)?;
                let payload = error.payload.as_ref().unwrap_or(&Value::Null);
                self.registry.encode(payload, &TypeDesc::Object, &mut out)?;
            }
        }
        Ok(out.freeze())
    }

    fn decode_response(
        &self,
        frame: Bytes,
        returns: &dyn Fn(u64) -> Option<TypeDesc>,
    ) -> std::result::Result<Response, ResponseDecodeError> {
        let connection = |err: CodecError| {
            ResponseDecodeError::Connection(ProtocolError::Malformed(err.to_string()))
        };

        let mut input = frame;
        let version = read_u8(&mut input).map_err(connection)?;
        if version != VERSION {
            return Err(ResponseDecodeError::Connection(
                ProtocolError::UnsupportedVersion(format!("{version:#04x}")),
            ));
        }
        let kind = read_u8(&mut input).map_err(connection)?;
        if kind != KIND_RESPONSE {
            return Err(ResponseDecodeError::Connection(ProtocolError::UnexpectedKind(
                kind,
            )));
        }

        if !read_flag(&mut input).map_err(connection)? {
            // Without an id the failure cannot be pinned on one request.
            return match self.decode_body(&mut input, None) {
                Ok(Err(error)) => Ok(Response::failure(None, error)),
                Ok(Ok(_)) => Err(ResponseDecodeError::Connection(ProtocolError::Malformed(
                    "result without request id".to_string(),
                ))),
                Err(err) => Err(ResponseDecodeError::Connection(ProtocolError::Malformed(
                    err.to_string(),
                ))),
            };
        }

        let id = read_u64(&mut input).map_err(connection)?;
        let Some(ty) = returns(id) else {
            return Err(ResponseDecodeError::UnknownId(id));
        };
        match self.decode_body(&mut input, Some(&ty)) {
            Ok(outcome) => Ok(Response { id: Some(id), outcome }),
            Err(error) => Err(ResponseDecodeError::Message { id, error }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{InterfaceDef, MethodSignature};
    use crate::protocol::{Exception, Primitive};

    const INT: TypeDesc = TypeDesc::Primitive(Primitive::Int);

    fn table() -> DispatchTable {
        DispatchTable::for_interface(
            &InterfaceDef::new("Calculator")
                .method(MethodSignature::new("add").param(INT).param(INT).returns(INT))
                .method(MethodSignature::new("fail").throws("E")),
        )
        .unwrap()
    }

    fn codec() -> BinaryWireCodec {
        BinaryWireCodec::new(Arc::new(CodecRegistry::new()))
    }

    #[test]
    fn test_request_layout() {
        let table = table();
        let request = Request {
            id: 7,
            method: Arc::clone(table.by_name("add").unwrap()),
            args: vec![Value::Int(1), Value::Int(2)],
        };

        let bytes = codec().encode_request(&request).unwrap();

        assert_eq!(
            bytes.as_ref(),
            &[1, 1, 0, 0, 0, 0, 0, 0, 0, 7, 0, 0, 0, 2, 0, 0, 0, 1, 0, 0, 0, 2]
        );
        let decoded = codec().decode_request(bytes, &table).unwrap();
        assert_eq!(decoded.id, 7);
        assert_eq!(decoded.method.wire_name(), "add");
        assert_eq!(decoded.args, request.args);
    }

    #[test]
    fn test_wrong_arity_rejected_on_encode() {
        let table = table();
        let request = Request {
            id: 1,
            method: Arc::clone(table.by_name("add").unwrap()),
            args: vec![Value::Int(1)],
        };

        assert!(matches!(
            codec().encode_request(&request),
            Err(crate::Error::Dispatch(_))
        ));
    }

    #[test]
    fn test_malformed_requests_answered() {
        let table = table();

        let short = codec().decode_request(Bytes::from_static(&[1, 1, 0]), &table);
        assert_eq!(short.unwrap_err().error.code, codes::PARSE_ERROR);

        let unknown = codec().decode_request(
            Bytes::from_static(&[1, 1, 0, 0, 0, 0, 0, 0, 0, 9, 0, 5, 0, 0]),
            &table,
        );
        let unknown = unknown.unwrap_err();
        assert_eq!(unknown.id, Some(9));
        assert_eq!(unknown.error.code, codes::METHOD_NOT_FOUND);

        let bad_argc = codec().decode_request(
            Bytes::from_static(&[1, 1, 0, 0, 0, 0, 0, 0, 0, 9, 0, 0, 0, 1, 0, 0, 0, 1]),
            &table,
        );
        assert_eq!(bad_argc.unwrap_err().error.code, codes::INVALID_ARGUMENT);
    }

    #[test]
    fn test_error_response_round_trip() {
        let error = ErrorDescriptor::new(codes::APPLICATION, "E: boom")
            .with_payload(Value::Exception(Exception::new("E", "boom")));
        let response = Response::failure(Some(3), error);

        let bytes = codec().encode_response(&response, None).unwrap();
        let decoded = codec()
            .decode_response(bytes, &|_| Some(TypeDesc::Void))
            .unwrap();

        assert_eq!(decoded, response);
    }

    #[test]
    fn test_unknown_id_reported() {
        let response = Response::success(42, Value::Int(1));
        let bytes = codec().encode_response(&response, Some(&INT)).unwrap();

        let err = codec().decode_response(bytes, &|_| None).unwrap_err();

        assert!(matches!(err, ResponseDecodeError::UnknownId(42)));
    }

    #[test]
    fn test_corrupt_body_fails_only_its_request() {
        let mut bytes = BytesMut::new();
        bytes.put_slice(&[VERSION, KIND_RESPONSE, 1]);
        bytes.put_u64(5);
        bytes.put_slice(&[STATUS_OK, 0, 0]);

        let err = codec()
            .decode_response(bytes.freeze(), &|_| Some(INT))
            .unwrap_err();

        assert!(matches!(err, ResponseDecodeError::Message { id: 5, .. }));
    }

    #[test]
    fn test_bad_header_is_connection_wide() {
        let err = codec()
            .decode_response(Bytes::from_static(&[9, 2, 0]), &|_| None)
            .unwrap_err();

        assert!(matches!(
            err,
            ResponseDecodeError::Connection(ProtocolError::UnsupportedVersion(_))
        ));
    }
}
