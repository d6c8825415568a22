//! Envelope framing over transport messages and content-type negotiation

use crate::codec::{Codec, CodecTable, Message, MessageType, DEFAULT_CONTENT_TYPE};
use crate::error::{ClientError, Result};
use crate::transport::TransportMessage;
use meshrpc_core::Node;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Header names carried on every transport message
pub mod headers {
    pub const ID: &str = "Micro-Id";
    pub const SERVICE: &str = "Micro-Service";
    pub const METHOD: &str = "Micro-Method";
    pub const ENDPOINT: &str = "Micro-Endpoint";
    pub const ERROR: &str = "Micro-Error";
    pub const STREAM: &str = "Micro-Stream";
    pub const CONTENT_TYPE: &str = "Content-Type";
    pub const TIMEOUT: &str = "Timeout";
}

/// Node metadata key advertising the node's wire protocol
pub const PROTOCOL_METADATA: &str = "protocol";

/// Error text that marks the end of a stream
pub const END_OF_STREAM: &str = "EOS";

/// Converts between envelopes and transport messages with one codec
#[derive(Clone)]
pub struct RpcCodec {
    codec: Arc<dyn Codec>,
    stream: Option<String>,
}

impl RpcCodec {
    pub fn new(codec: Arc<dyn Codec>) -> Self {
        Self {
            codec,
            stream: None,
        }
    }

    /// Tag every written message with a stream id
    pub fn with_stream(mut self, id: impl Into<String>) -> Self {
        self.stream = Some(id.into());
        self
    }

    pub fn name(&self) -> &'static str {
        self.codec.name()
    }

    pub fn write(&self, message: &Message) -> Result<TransportMessage> {
        let mut header = message.header.clone();
        set_header(&mut header, headers::ID, &message.id);
        set_header(&mut header, headers::SERVICE, &message.target);
        set_header(&mut header, headers::METHOD, &message.method);
        set_header(&mut header, headers::ENDPOINT, &message.endpoint);
        set_header(&mut header, headers::ERROR, &message.error);
        if let Some(stream) = &self.stream {
            set_header(&mut header, headers::STREAM, stream);
        }

        let body = self.codec.marshal(message)?;
        Ok(TransportMessage { header, body })
    }

    pub fn read(&self, transport: TransportMessage, message_type: MessageType) -> Result<Message> {
        let mut message = Message {
            message_type,
            ..Default::default()
        };
        self.codec.unmarshal(&transport.body, &mut message)?;

        fill(&mut message.id, &transport.header, headers::ID);
        fill(&mut message.target, &transport.header, headers::SERVICE);
        fill(&mut message.method, &transport.header, headers::METHOD);
        fill(&mut message.endpoint, &transport.header, headers::ENDPOINT);
        fill(&mut message.error, &transport.header, headers::ERROR);
        if message.endpoint.is_empty() {
            message.endpoint = message.method.clone();
        }
        message.header = transport.header;
        Ok(message)
    }
}

fn set_header(header: &mut HashMap<String, String>, key: &str, value: &str) {
    if !value.is_empty() {
        header.insert(key.to_string(), value.to_string());
    }
}

fn fill(field: &mut String, header: &HashMap<String, String>, key: &str) {
    if field.is_empty() {
        if let Some(value) = header.get(key) {
            *field = value.clone();
        }
    }
}

/// The codec tables a client consults, in precedence order
#[derive(Clone, Debug)]
pub struct CodecSet {
    custom: CodecTable,
    modern: CodecTable,
    legacy: CodecTable,
}

impl Default for CodecSet {
    fn default() -> Self {
        Self {
            custom: CodecTable::new(),
            modern: CodecTable::modern(),
            legacy: CodecTable::legacy(),
        }
    }
}

impl CodecSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a codec that overrides the built-in table
    pub fn register(&mut self, content_type: impl Into<String>, codec: Arc<dyn Codec>) {
        self.custom.register(content_type, codec);
    }

    /// Codec for a content type, ignoring node protocol
    pub fn codec_for(&self, content_type: &str) -> Result<Arc<dyn Codec>> {
        self.custom
            .get(content_type)
            .or_else(|| self.modern.get(content_type))
            .ok_or_else(|| ClientError::UnsupportedContentType(content_type.to_string()))
    }

    /// Pick the codec for sending to `node`.
    ///
    /// Nodes without protocol metadata speak the legacy RPC formats, so the
    /// request content type is rewritten in `header` to its RPC variant and
    /// resolved against the legacy table.
    pub fn negotiate(
        &self,
        header: &mut HashMap<String, String>,
        node: &Node,
    ) -> Result<Arc<dyn Codec>> {
        let content_type = header
            .get(headers::CONTENT_TYPE)
            .cloned()
            .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string());
        let codec = self.codec_for(&content_type)?;

        let has_protocol = node
            .metadata
            .get(PROTOCOL_METADATA)
            .is_some_and(|protocol| !protocol.is_empty());
        if has_protocol {
            header.insert(headers::CONTENT_TYPE.to_string(), content_type);
            return Ok(codec);
        }

        let legacy_type = match content_type.as_str() {
            "application/json" => "application/json-rpc".to_string(),
            "application/protobuf" => "application/proto-rpc".to_string(),
            _ => content_type,
        };
        let legacy = self.legacy.get(&legacy_type);
        header.insert(headers::CONTENT_TYPE.to_string(), legacy_type);

        match legacy {
            Some(legacy) => {
                debug!(node = %node.id, codec = legacy.name(), "Using legacy codec");
                Ok(legacy)
            }
            None => Ok(codec),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::JsonCodec;

    fn json_header() -> HashMap<String, String> {
        HashMap::from([(headers::CONTENT_TYPE.to_string(), "application/json".to_string())])
    }

    #[test]
    fn test_negotiate_modern_node() {
        let node = Node::new("n1", "a:1").with_metadata("protocol", "mucp");
        let mut header = json_header();
        let codec = CodecSet::new().negotiate(&mut header, &node).unwrap();
        assert_eq!(codec.name(), "json");
        assert_eq!(header[headers::CONTENT_TYPE], "application/json");
    }

    #[test]
    fn test_negotiate_legacy_node_rewrites_content_type() {
        let node = Node::new("n1", "a:1");
        let mut header = json_header();
        let codec = CodecSet::new().negotiate(&mut header, &node).unwrap();
        assert_eq!(codec.name(), "json-rpc");
        assert_eq!(header[headers::CONTENT_TYPE], "application/json-rpc");
    }

    #[test]
    fn test_negotiate_legacy_node_falls_back_to_modern() {
        let node = Node::new("n1", "a:1");
        let mut header =
            HashMap::from([(headers::CONTENT_TYPE.to_string(), "application/grpc".to_string())]);
        let codec = CodecSet::new().negotiate(&mut header, &node).unwrap();
        assert_eq!(codec.name(), "grpc");
    }

    #[test]
    fn test_negotiate_unsupported() {
        let node = Node::new("n1", "a:1").with_metadata("protocol", "mucp");
        let mut header =
            HashMap::from([(headers::CONTENT_TYPE.to_string(), "text/plain".to_string())]);
        let err = CodecSet::new().negotiate(&mut header, &node).err().unwrap();
        assert_eq!(err, ClientError::UnsupportedContentType("text/plain".to_string()));
    }

    #[test]
    fn test_custom_codec_overrides_modern() {
        struct Upper;
        impl Codec for Upper {
            fn marshal(&self, message: &Message) -> Result<Vec<u8>> {
                Ok(message.body.to_ascii_uppercase())
            }
            fn unmarshal(&self, data: &[u8], message: &mut Message) -> Result<()> {
                message.body = data.to_vec();
                Ok(())
            }
            fn name(&self) -> &'static str {
                "upper"
            }
        }

        let mut codecs = CodecSet::new();
        codecs.register("application/json", Arc::new(Upper));
        let node = Node::new("n1", "a:1").with_metadata("protocol", "mucp");
        let codec = codecs.negotiate(&mut json_header(), &node).unwrap();
        assert_eq!(codec.name(), "upper");
    }

    #[test]
    fn test_write_then_read_restores_headers() {
        let codec = RpcCodec::new(Arc::new(JsonCodec)).with_stream("s-1");
        let message = Message {
            id: "1".to_string(),
            target: "greeter".to_string(),
            method: "Greeter.Hello".to_string(),
            endpoint: "Greeter.Hello".to_string(),
            body: b"{}".to_vec(),
            ..Default::default()
        };

        let frame = codec.write(&message).unwrap();
        assert_eq!(frame.header[headers::SERVICE], "greeter");
        assert_eq!(frame.header[headers::STREAM], "s-1");
        assert!(!frame.header.contains_key(headers::ERROR));

        let decoded = codec.read(frame, MessageType::Request).unwrap();
        assert_eq!(decoded.target, "greeter");
        assert_eq!(decoded.endpoint, "Greeter.Hello");
        assert_eq!(decoded.body, b"{}");
    }
}
