//! JSON-RPC 2.0 wire format.

use crate::dispatch::DispatchTable;
use crate::error::{CodecError, Error, ProtocolError, Result};
use crate::protocol::message::{ErrorDescriptor, Request, Response, codes};
use crate::protocol::wire::{
    MalformedRequest, ResponseDecodeError, WireCodec, check_arity, missing_return_type,
};
use crate::protocol::{CodecRegistry, TypeDesc, Value};

use std::sync::Arc;

use bytes::Bytes;
use serde_json::{Map, json};

/// Value of the `jsonrpc` field.
pub const VERSION: &str = "2.0";

/// Text [`WireCodec`].
pub struct JsonWireCodec {
    registry: Arc<CodecRegistry>,
}

fn to_bytes(json: &serde_json::Value) -> Result<Bytes> {
    serde_json::to_vec(json)
        .map(Bytes::from)
        .map_err(|e| CodecError::SerializationFailed(e.to_string()).into())
}

fn parse_object(frame: &[u8]) -> std::result::Result<Map<String, serde_json::Value>, String> {
    match serde_json::from_slice::<serde_json::Value>(frame) {
        Ok(serde_json::Value::Object(map)) => Ok(map),
        Ok(_) => Err("message is not a JSON object".to_string()),
        Err(e) => Err(e.to_string()),
    }
}

fn check_version(map: &Map<String, serde_json::Value>) -> std::result::Result<(), String> {
    match map.get("jsonrpc") {
        Some(serde_json::Value::String(v)) if v == VERSION => Ok(()),
        Some(other) => Err(format!("unsupported jsonrpc version {other}")),
        None => Err("missing jsonrpc field".to_string()),
    }
}

impl JsonWireCodec {
    /// Codec encoding values with `registry`.
    #[must_use]
    pub const fn new(registry: Arc<CodecRegistry>) -> Self {
        Self { registry }
    }

    fn decode_error(&self, json: &serde_json::Value) -> Result<ErrorDescriptor> {
        let malformed = |what: &str| Error::from(ProtocolError::Malformed(format!("error {what}")));
        let code = json
            .get("code")
            .and_then(serde_json::Value::as_i64)
            .and_then(|c| i32::try_from(c).ok())
            .ok_or_else(|| malformed("code missing or not an integer"))?;
        let message = json
            .get("message")
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| malformed("message missing"))?
            .to_string();
        let payload = match json.get("data") {
            None | Some(serde_json::Value::Null) => None,
            Some(data) => Some(self.registry.from_json(data, &TypeDesc::Object)?),
        };
        Ok(ErrorDescriptor {
            code,
            message,
            payload,
        })
    }

    fn decode_body(
        &self,
        map: &Map<String, serde_json::Value>,
        returns: Option<&TypeDesc>,
    ) -> Result<std::result::Result<Value, ErrorDescriptor>> {
        match (map.get("result"), map.get("error")) {
            (Some(result), None) => {
                let ty = returns.ok_or_else(missing_return_type)?;
                Ok(Ok(self.registry.from_json(result, ty)?))
            }
            (None, Some(error)) => Ok(Err(self.decode_error(error)?)),
            _ => Err(ProtocolError::Malformed(
                "response must carry exactly one of result and error".to_string(),
            )
            .into()),
        }
    }
}

impl WireCodec for JsonWireCodec {
    fn name(&self) -> &'static str {
        "json"
    }

    fn encode_request(&self, request: &Request) -> Result<Bytes> {
        check_arity(request)?;
        let params = request
            .args
            .iter()
            .zip(request.method.signature().params())
            .map(|(arg, ty)| self.registry.to_json(arg, ty))
            .collect::<std::result::Result<Vec<_>, _>>()?;

        to_bytes(&json!({
            "jsonrpc": VERSION,
            "method": request.method.wire_name(),
            "params": params,
            "id": request.id,
        }))
    }

    fn decode_request(
        &self,
        frame: Bytes,
        table: &DispatchTable,
    ) -> std::result::Result<Request, MalformedRequest> {
        let map = parse_object(&frame)
            .map_err(|e| MalformedRequest::new(None, codes::PARSE_ERROR, e))?;

        let id = map.get("id").and_then(serde_json::Value::as_u64);
        check_version(&map).map_err(|e| MalformedRequest::new(id, codes::INVALID_REQUEST, e))?;
        let Some(id) = id else {
            return Err(MalformedRequest::new(
                None,
                codes::INVALID_REQUEST,
                "id missing or not an unsigned integer",
            ));
        };

        let name = map
            .get("method")
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| {
                MalformedRequest::new(Some(id), codes::INVALID_REQUEST, "method missing")
            })?;
        let entry = table
            .by_name(name)
            .map_err(|e| MalformedRequest::new(Some(id), codes::METHOD_NOT_FOUND, e.to_string()))?;

        let empty = Vec::new();
        let params = match map.get("params") {
            None | Some(serde_json::Value::Null) => &empty,
            Some(serde_json::Value::Array(params)) => params,
            Some(_) => {
                return Err(MalformedRequest::invalid_argument(id, "params must be an array"));
            }
        };

        let declared = entry.signature().params();
        if params.len() != declared.len() {
            return Err(MalformedRequest::invalid_argument(
                id,
                format!(
                    "{} takes {} arguments, got {}",
                    entry.wire_name(),
                    declared.len(),
                    params.len()
                ),
            ));
        }

        let args = params
            .iter()
            .zip(declared)
            .map(|(param, ty)| self.registry.from_json(param, ty))
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| MalformedRequest::invalid_argument(id, e))?;

        Ok(Request {
            id,
            method: Arc::clone(entry),
            args,
        })
    }

    fn encode_response(&self, response: &Response, returns: Option<&TypeDesc>) -> Result<Bytes> {
        let mut map = Map::new();
        map.insert("jsonrpc".to_string(), json!(VERSION));
        map.insert("id".to_string(), json!(response.id));
        match &response.outcome {
            Ok(value) => {
                let ty = returns.ok_or_else(missing_return_type)?;
                map.insert("result".to_string(), self.registry.to_json(value, ty)?);
            }
            Err(error) => {
                let data = match &error.payload {
                    Some(payload) => self.registry.to_json(payload, &TypeDesc::Object)?,
                    None => serde_json::Value::Null,
                };
                map.insert(
                    "error".to_string(),
                    json!({
                        "code": error.code,
                        "message": error.message,
                        "data": data,
                    }),
                );
            }
        }
        to_bytes(&serde_json::Value::Object(map))
    }

    fn decode_response(
        &self,
        frame: Bytes,
        returns: &dyn Fn(u64) -> Option<TypeDesc>,
    ) -> std::result::Result<Response, ResponseDecodeError> {
        let connection = |reason: String| ResponseDecodeError::Connection(ProtocolError::Malformed(reason));

        let map = parse_object(&frame).map_err(connection)?;
        check_version(&map).map_err(|e| {
            ResponseDecodeError::Connection(ProtocolError::UnsupportedVersion(e))
        })?;

        let id = match map.get("id") {
            None | Some(serde_json::Value::Null) => None,
            Some(id) => Some(
                id.as_u64()
                    .ok_or_else(|| connection(format!("invalid response id {id}")))?,
            ),
        };

        let Some(id) = id else {
            return match self.decode_body(&map, None) {
                Ok(Err(error)) => Ok(Response::failure(None, error)),
                Ok(Ok(_)) => Err(connection("result without request id".to_string())),
                Err(err) => Err(connection(err.to_string())),
            };
        };

        let Some(ty) = returns(id) else {
            return Err(ResponseDecodeError::UnknownId(id));
        };
        match self.decode_body(&map, Some(&ty)) {
            Ok(outcome) => Ok(Response {
                id: Some(id),
                outcome,
            }),
            Err(error) => Err(ResponseDecodeError::Message { id, error }),
        }
    }
}
