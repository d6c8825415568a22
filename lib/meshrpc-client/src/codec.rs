//! Message envelope codecs and the content-type lookup tables

use crate::error::{ClientError, Result};
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Content type used when neither the request nor the client names one
pub const DEFAULT_CONTENT_TYPE: &str = "application/json";

/// Role of a message within an exchange
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Error,
    #[default]
    Request,
    Response,
    Event,
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageType::Error => write!(f, "error"),
            MessageType::Request => write!(f, "request"),
            MessageType::Response => write!(f, "response"),
            MessageType::Event => write!(f, "event"),
        }
    }
}

/// The envelope handed to a codec
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Message {
    pub id: String,
    pub target: String,
    pub method: String,
    pub endpoint: String,
    pub error: String,
    pub header: HashMap<String, String>,
    pub body: Vec<u8>,
    pub message_type: MessageType,
}

/// Encodes and decodes envelopes for one wire format
pub trait Codec: Send + Sync {
    fn marshal(&self, message: &Message) -> Result<Vec<u8>>;

    /// Decode `data` into `message`. The caller sets `message_type` first.
    fn unmarshal(&self, data: &[u8], message: &mut Message) -> Result<()>;

    fn name(&self) -> &'static str;
}

/// Plain JSON: the body is the payload
#[derive(Debug, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn marshal(&self, message: &Message) -> Result<Vec<u8>> {
        Ok(message.body.clone())
    }

    fn unmarshal(&self, data: &[u8], message: &mut Message) -> Result<()> {
        message.body = data.to_vec();
        Ok(())
    }

    fn name(&self) -> &'static str {
        "json"
    }
}

#[derive(Serialize, Deserialize)]
struct JsonRpcRequest<'a> {
    #[serde(default)]
    id: String,
    #[serde(default)]
    method: String,
    #[serde(borrow)]
    params: Vec<&'a RawValue>,
}

#[derive(Serialize, Deserialize)]
struct JsonRpcResponse<'a> {
    #[serde(default)]
    id: String,
    #[serde(borrow)]
    result: Option<&'a RawValue>,
    #[serde(default)]
    error: Option<String>,
}

/// JSON-RPC 1.0 style envelope: `{"id","method","params":[body]}` for
/// requests and `{"id","result","error"}` for responses
#[derive(Debug, Default)]
pub struct JsonRpcCodec;

impl JsonRpcCodec {
    fn raw_body(body: &[u8]) -> Result<Box<RawValue>> {
        let text = if body.is_empty() {
            "null".to_string()
        } else {
            String::from_utf8(body.to_vec()).map_err(|e| ClientError::Codec(e.to_string()))?
        };
        RawValue::from_string(text).map_err(|e| ClientError::Codec(e.to_string()))
    }
}

impl Codec for JsonRpcCodec {
    fn marshal(&self, message: &Message) -> Result<Vec<u8>> {
        let encoded = match message.message_type {
            MessageType::Request | MessageType::Event => {
                let body = Self::raw_body(&message.body)?;
                serde_json::to_vec(&JsonRpcRequest {
                    id: message.id.clone(),
                    method: message.method.clone(),
                    params: vec![&*body],
                })
            }
            MessageType::Response | MessageType::Error => {
                let body = Self::raw_body(&message.body)?;
                let error = (!message.error.is_empty()).then(|| message.error.clone());
                serde_json::to_vec(&JsonRpcResponse {
                    id: message.id.clone(),
                    result: error.is_none().then_some(&*body),
                    error,
                })
            }
        };
        encoded.map_err(|e| ClientError::Codec(e.to_string()))
    }

    fn unmarshal(&self, data: &[u8], message: &mut Message) -> Result<()> {
        match message.message_type {
            MessageType::Request | MessageType::Event => {
                let request: JsonRpcRequest<'_> =
                    serde_json::from_slice(data).map_err(|e| ClientError::Codec(e.to_string()))?;
                message.id = request.id;
                message.method = request.method;
                message.body = request
                    .params
                    .first()
                    .map(|raw| raw.get().as_bytes().to_vec())
                    .unwrap_or_default();
            }
            MessageType::Response | MessageType::Error => {
                let response: JsonRpcResponse<'_> =
                    serde_json::from_slice(data).map_err(|e| ClientError::Codec(e.to_string()))?;
                message.id = response.id;
                message.error = response.error.unwrap_or_default();
                message.body = response
                    .result
                    .map(|raw| raw.get().as_bytes().to_vec())
                    .unwrap_or_default();
            }
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "json-rpc"
    }
}

/// Binary RPC envelope: length-prefixed id, method and error, then the body
#[derive(Debug, Default)]
pub struct ProtoRpcCodec;

impl ProtoRpcCodec {
    fn put(buf: &mut Vec<u8>, field: &str) {
        buf.extend_from_slice(&(field.len() as u32).to_be_bytes());
        buf.extend_from_slice(field.as_bytes());
    }

    fn take<'a>(data: &mut &'a [u8]) -> Result<&'a str> {
        let buf: &'a [u8] = *data;
        if buf.len() < 4 {
            return Err(ClientError::Codec("truncated proto-rpc envelope".to_string()));
        }
        let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        let rest = &buf[4..];
        if rest.len() < len {
            return Err(ClientError::Codec("truncated proto-rpc envelope".to_string()));
        }
        let field =
            std::str::from_utf8(&rest[..len]).map_err(|e| ClientError::Codec(e.to_string()))?;
        *data = &rest[len..];
        Ok(field)
    }
}

impl Codec for ProtoRpcCodec {
    fn marshal(&self, message: &Message) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(message.body.len() + 32);
        Self::put(&mut buf, &message.id);
        Self::put(&mut buf, &message.method);
        Self::put(&mut buf, &message.error);
        buf.extend_from_slice(&message.body);
        Ok(buf)
    }

    fn unmarshal(&self, mut data: &[u8], message: &mut Message) -> Result<()> {
        message.id = Self::take(&mut data)?.to_string();
        message.method = Self::take(&mut data)?.to_string();
        message.error = Self::take(&mut data)?.to_string();
        message.body = data.to_vec();
        Ok(())
    }

    fn name(&self) -> &'static str {
        "proto-rpc"
    }
}

/// gRPC length-prefixed message: one flag byte, a `u32` length, the body
#[derive(Debug, Default)]
pub struct GrpcCodec;

impl Codec for GrpcCodec {
    fn marshal(&self, message: &Message) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(message.body.len() + 5);
        buf.push(0);
        buf.extend_from_slice(&(message.body.len() as u32).to_be_bytes());
        buf.extend_from_slice(&message.body);
        Ok(buf)
    }

    fn unmarshal(&self, data: &[u8], message: &mut Message) -> Result<()> {
        if data.len() < 5 {
            return Err(ClientError::Codec("grpc message shorter than prefix".to_string()));
        }
        if data[0] != 0 {
            return Err(ClientError::Codec("compressed grpc messages are not supported".to_string()));
        }
        let len = u32::from_be_bytes([data[1], data[2], data[3], data[4]]) as usize;
        let body = data
            .get(5..5 + len)
            .ok_or_else(|| ClientError::Codec("truncated grpc message".to_string()))?;
        message.body = body.to_vec();
        Ok(())
    }

    fn name(&self) -> &'static str {
        "grpc"
    }
}

/// Protobuf payloads, already encoded by the caller
#[derive(Debug, Default)]
pub struct ProtoCodec;

impl Codec for ProtoCodec {
    fn marshal(&self, message: &Message) -> Result<Vec<u8>> {
        Ok(message.body.clone())
    }

    fn unmarshal(&self, data: &[u8], message: &mut Message) -> Result<()> {
        message.body = data.to_vec();
        Ok(())
    }

    fn name(&self) -> &'static str {
        "proto"
    }
}

/// Opaque bytes
#[derive(Debug, Default)]
pub struct BytesCodec;

impl Codec for BytesCodec {
    fn marshal(&self, message: &Message) -> Result<Vec<u8>> {
        Ok(message.body.clone())
    }

    fn unmarshal(&self, data: &[u8], message: &mut Message) -> Result<()> {
        message.body = data.to_vec();
        Ok(())
    }

    fn name(&self) -> &'static str {
        "bytes"
    }
}

/// Map of content type to codec
#[derive(Clone, Default)]
pub struct CodecTable {
    codecs: HashMap<String, Arc<dyn Codec>>,
}

impl CodecTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Table used for nodes that advertise a protocol
    pub fn modern() -> Self {
        let grpc: Arc<dyn Codec> = Arc::new(GrpcCodec);
        let mut table = Self::new();
        table.register("application/grpc", grpc.clone());
        table.register("application/grpc+json", grpc.clone());
        table.register("application/grpc+proto", grpc);
        table.register("application/protobuf", Arc::new(ProtoCodec));
        table.register("application/json", Arc::new(JsonCodec));
        table.register("application/json-rpc", Arc::new(JsonRpcCodec));
        table.register("application/proto-rpc", Arc::new(ProtoRpcCodec));
        table.register("application/octet-stream", Arc::new(BytesCodec));
        table
    }

    /// Table used for nodes without protocol metadata
    pub fn legacy() -> Self {
        let json_rpc: Arc<dyn Codec> = Arc::new(JsonRpcCodec);
        let proto_rpc: Arc<dyn Codec> = Arc::new(ProtoRpcCodec);
        let mut table = Self::new();
        table.register("application/json", json_rpc.clone());
        table.register("application/json-rpc", json_rpc);
        table.register("application/protobuf", proto_rpc.clone());
        table.register("application/proto-rpc", proto_rpc.clone());
        table.register("application/octet-stream", proto_rpc);
        table
    }

    pub fn register(&mut self, content_type: impl Into<String>, codec: Arc<dyn Codec>) {
        self.codecs.insert(content_type.into(), codec);
    }

    pub fn get(&self, content_type: &str) -> Option<Arc<dyn Codec>> {
        self.codecs.get(content_type).cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.codecs.is_empty()
    }
}

impl fmt::Debug for CodecTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut entries: Vec<_> = self
            .codecs
            .iter()
            .map(|(content_type, codec)| (content_type.as_str(), codec.name()))
            .collect();
        entries.sort();
        f.debug_map().entries(entries).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(body: &str) -> Message {
        Message {
            id: "7".to_string(),
            method: "Greeter.Hello".to_string(),
            body: body.as_bytes().to_vec(),
            message_type: MessageType::Request,
            ..Default::default()
        }
    }

    #[test]
    fn test_json_rpc_request_wraps_params() {
        let data = JsonRpcCodec.marshal(&request(r#"{"name":"John"}"#)).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&data).unwrap();
        assert_eq!(value["method"], "Greeter.Hello");
        assert_eq!(value["params"][0]["name"], "John");

        let mut decoded = Message::default();
        JsonRpcCodec.unmarshal(&data, &mut decoded).unwrap();
        assert_eq!(decoded.body, br#"{"name":"John"}"#);
        assert_eq!(decoded.id, "7");
    }

    #[test]
    fn test_json_rpc_error_response_drops_result() {
        let message = Message {
            error: "boom".to_string(),
            message_type: MessageType::Response,
            ..Default::default()
        };
        let data = JsonRpcCodec.marshal(&message).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&data).unwrap();
        assert_eq!(value["error"], "boom");
        assert!(value["result"].is_null());

        let mut decoded = Message {
            message_type: MessageType::Response,
            ..Default::default()
        };
        JsonRpcCodec.unmarshal(&data, &mut decoded).unwrap();
        assert_eq!(decoded.error, "boom");
        assert!(decoded.body.is_empty());
    }

    #[test]
    fn test_json_rpc_rejects_non_json_body() {
        assert!(matches!(
            JsonRpcCodec.marshal(&request("not json")),
            Err(ClientError::Codec(_))
        ));
    }

    #[test]
    fn test_grpc_prefix() {
        let data = GrpcCodec.marshal(&request("abc")).unwrap();
        assert_eq!(data, vec![0, 0, 0, 0, 3, b'a', b'b', b'c']);

        let mut decoded = Message::default();
        assert!(GrpcCodec.unmarshal(&data[..6], &mut decoded).is_err());
        GrpcCodec.unmarshal(&data, &mut decoded).unwrap();
        assert_eq!(decoded.body, b"abc");
    }

    #[test]
    fn test_proto_rpc_envelope() {
        let mut message = request("\x08\x01");
        message.error = "partial".to_string();
        let data = ProtoRpcCodec.marshal(&message).unwrap();

        let mut decoded = Message::default();
        ProtoRpcCodec.unmarshal(&data, &mut decoded).unwrap();
        assert_eq!(decoded.method, "Greeter.Hello");
        assert_eq!(decoded.error, "partial");
        assert_eq!(decoded.body, b"\x08\x01");

        assert!(ProtoRpcCodec.unmarshal(&data[..3], &mut decoded).is_err());
    }

    #[test]
    fn test_tables_back_same_content_types_differently() {
        let modern = CodecTable::modern();
        let legacy = CodecTable::legacy();

        assert_eq!(modern.get("application/json").unwrap().name(), "json");
        assert_eq!(legacy.get("application/json").unwrap().name(), "json-rpc");
        assert_eq!(modern.get("application/octet-stream").unwrap().name(), "bytes");
        assert_eq!(legacy.get("application/octet-stream").unwrap().name(), "proto-rpc");
        assert_eq!(modern.get("application/grpc+json").unwrap().name(), "grpc");
        assert!(legacy.get("application/grpc").is_none());
    }
}
