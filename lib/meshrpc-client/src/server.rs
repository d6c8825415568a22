//! Answering side of the envelope, for nodes served in-process

use crate::codec::{JsonCodec, Message, MessageType, DEFAULT_CONTENT_TYPE};
use crate::error::RpcError;
use crate::rpc_codec::{headers, CodecSet, RpcCodec, END_OF_STREAM};
use crate::transport::{Connection, TransportError, TransportMessage};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// What a handler answers to one request
#[derive(Clone, Debug, PartialEq)]
pub enum Reply {
    Body(Vec<u8>),
    Error(RpcError),
    /// Ends the stream the request belongs to
    EndOfStream,
}

/// Decode one request frame, run `handler`, encode the reply with the
/// codec the request was sent with
pub fn respond<H>(codecs: &CodecSet, frame: TransportMessage, handler: H) -> TransportMessage
where
    H: FnOnce(&Message) -> Reply,
{
    let content_type = frame
        .header
        .get(headers::CONTENT_TYPE)
        .cloned()
        .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string());
    let stream = frame.header.get(headers::STREAM).cloned();

    let codec = match codecs.codec_for(&content_type) {
        Ok(codec) => codec,
        Err(e) => return error_frame(&content_type, RpcError::bad_request("meshrpc.server", e.to_string())),
    };
    let mut rpc = RpcCodec::new(codec);
    if let Some(stream) = stream {
        rpc = rpc.with_stream(stream);
    }

    let request = match rpc.read(frame, MessageType::Request) {
        Ok(request) => request,
        Err(e) => return error_frame(&content_type, RpcError::bad_request("meshrpc.server", e.to_string())),
    };
    debug!(
        service = %request.target,
        endpoint = %request.endpoint,
        codec = rpc.name(),
        "Handling request"
    );

    let mut response = Message {
        id: request.id.clone(),
        target: request.target.clone(),
        method: request.method.clone(),
        endpoint: request.endpoint.clone(),
        header: HashMap::from([(headers::CONTENT_TYPE.to_string(), content_type.clone())]),
        message_type: MessageType::Response,
        ..Default::default()
    };
    match handler(&request) {
        Reply::Body(body) => response.body = body,
        Reply::Error(err) => {
            response.error = err.to_string();
            response.message_type = MessageType::Error;
        }
        Reply::EndOfStream => {
            response.error = END_OF_STREAM.to_string();
            response.message_type = MessageType::Error;
        }
    }

    match rpc.write(&response) {
        Ok(frame) => frame,
        Err(e) => error_frame(
            &content_type,
            RpcError::internal_server_error("meshrpc.server", e.to_string()),
        ),
    }
}

fn error_frame(content_type: &str, err: RpcError) -> TransportMessage {
    let message = Message {
        error: err.to_string(),
        header: HashMap::from([(headers::CONTENT_TYPE.to_string(), content_type.to_string())]),
        message_type: MessageType::Error,
        ..Default::default()
    };
    RpcCodec::new(Arc::new(JsonCodec))
        .write(&message)
        .unwrap_or_else(|_| TransportMessage {
            header: message.header,
            body: Vec::new(),
        })
}

/// Answer requests on `conn` until the peer hangs up
pub async fn serve<C, H>(mut conn: C, codecs: CodecSet, handler: H) -> Result<(), TransportError>
where
    C: Connection,
    H: Fn(&Message) -> Reply,
{
    loop {
        let frame = match conn.recv().await {
            Ok(frame) => frame,
            Err(TransportError::Closed) => return Ok(()),
            Err(e) => return Err(e),
        };
        let reply = respond(&codecs, frame, &handler);
        conn.send(&reply).await?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::JsonRpcCodec;

    fn request_frame(codec: Arc<dyn crate::codec::Codec>, content_type: &str) -> TransportMessage {
        let message = Message {
            id: "1".to_string(),
            target: "greeter".to_string(),
            method: "Greeter.Hello".to_string(),
            endpoint: "Greeter.Hello".to_string(),
            header: HashMap::from([(headers::CONTENT_TYPE.to_string(), content_type.to_string())]),
            body: br#"{"name":"John"}"#.to_vec(),
            message_type: MessageType::Request,
            ..Default::default()
        };
        RpcCodec::new(codec).write(&message).unwrap()
    }

    #[test]
    fn test_respond_uses_request_codec() {
        let frame = request_frame(Arc::new(JsonRpcCodec), "application/json-rpc");
        let reply = respond(&CodecSet::new(), frame, |req| {
            assert_eq!(req.endpoint, "Greeter.Hello");
            Reply::Body(req.body.clone())
        });

        let decoded = RpcCodec::new(Arc::new(JsonRpcCodec))
            .read(reply, MessageType::Response)
            .unwrap();
        assert_eq!(decoded.body, br#"{"name":"John"}"#);
        assert!(decoded.error.is_empty());
    }

    #[test]
    fn test_respond_error_sets_header() {
        let frame = request_frame(Arc::new(JsonCodec), "application/json");
        let reply = respond(&CodecSet::new(), frame, |_| {
            Reply::Error(RpcError::not_found("greeter", "no such user"))
        });
        let err = RpcError::parse(&reply.header[headers::ERROR]);
        assert_eq!(err.code, 404);
    }

    #[test]
    fn test_respond_unsupported_content_type() {
        let frame = request_frame(Arc::new(JsonCodec), "text/plain");
        let reply = respond(&CodecSet::new(), frame, |_| Reply::Body(Vec::new()));
        assert_eq!(RpcError::parse(&reply.header[headers::ERROR]).code, 400);
    }
}
