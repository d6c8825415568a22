use crate::client::{connection_error, PACKAGE_ID};
use crate::codec::{Message, MessageType};
use crate::context::CallContext;
use crate::error::{ClientError, Result, RpcError};
use crate::request::{Request, Response};
use crate::rpc_codec::{RpcCodec, END_OF_STREAM};
use crate::transport::{Connection, TransportMessage};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

/// A bidirectional stream on its own connection
///
/// Nothing is retried once the stream is open: the first failure is kept
/// and returned from every later `send` or `recv`.
pub struct RpcStream {
    id: String,
    ctx: CallContext,
    service: String,
    endpoint: String,
    header: HashMap<String, String>,
    codec: RpcCodec,
    conn: Box<dyn Connection>,
    timeout: Duration,
    seq: u64,
    err: Option<ClientError>,
}

impl RpcStream {
    pub(crate) fn new(
        ctx: CallContext,
        request: &Request,
        header: HashMap<String, String>,
        codec: RpcCodec,
        conn: Box<dyn Connection>,
        timeout: Duration,
    ) -> Self {
        let id = Uuid::new_v4().to_string();
        Self {
            codec: codec.with_stream(id.clone()),
            id,
            ctx,
            service: request.service.clone(),
            endpoint: request.endpoint.clone(),
            header,
            conn,
            timeout,
            seq: 0,
            err: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn remote_address(&self) -> &str {
        self.conn.remote_address()
    }

    /// The error that ended the stream, if any
    pub fn error(&self) -> Option<&ClientError> {
        self.err.as_ref()
    }

    fn fail(&mut self, err: ClientError) -> ClientError {
        debug!(stream = %self.id, error = %err, "Stream failed");
        self.err = Some(err.clone());
        err
    }

    pub async fn send(&mut self, body: Vec<u8>) -> Result<()> {
        if let Some(err) = &self.err {
            return Err(err.clone());
        }
        if let Err(e) = self.ctx.check() {
            return Err(self.fail(e));
        }

        self.seq += 1;
        let message = Message {
            id: self.seq.to_string(),
            target: self.service.clone(),
            method: self.endpoint.clone(),
            endpoint: self.endpoint.clone(),
            header: self.header.clone(),
            body,
            message_type: MessageType::Request,
            ..Default::default()
        };
        let frame = match self.codec.write(&message) {
            Ok(frame) => frame,
            Err(e) => return Err(self.fail(e)),
        };
        if let Err(e) = self.conn.send(&frame).await {
            return Err(self.fail(connection_error(e)));
        }
        Ok(())
    }

    /// Next message from the remote side, bounded by the stream timeout
    pub async fn recv(&mut self) -> Result<Response> {
        if let Some(err) = &self.err {
            return Err(err.clone());
        }

        let timeout = self.timeout;
        let received: Result<TransportMessage> = tokio::select! {
            err = self.ctx.done() => Err(err),
            received = tokio::time::timeout(timeout, self.conn.recv()) => match received {
                Ok(Ok(frame)) => Ok(frame),
                Ok(Err(e)) => Err(connection_error(e)),
                Err(_) => Err(ClientError::from(RpcError::timeout(
                    PACKAGE_ID,
                    format!("stream receive timeout after {}ms", timeout.as_millis()),
                ))),
            },
        };
        let frame = match received {
            Ok(frame) => frame,
            Err(e) => return Err(self.fail(e)),
        };

        let reply = match self.codec.read(frame, MessageType::Response) {
            Ok(reply) => reply,
            Err(e) => return Err(self.fail(e)),
        };
        match reply.error.as_str() {
            "" => Ok(Response {
                header: reply.header,
                body: reply.body,
            }),
            END_OF_STREAM => Err(self.fail(ClientError::StreamClosed)),
            err => Err(self.fail(RpcError::parse(err).into())),
        }
    }

    /// Close the connection. Later sends and receives fail.
    pub async fn close(&mut self) -> Result<()> {
        if self.err.is_none() {
            self.err = Some(ClientError::StreamClosed);
        }
        self.ctx.cancel();
        self.conn.close().await.map_err(connection_error)
    }
}

impl fmt::Debug for RpcStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcStream")
            .field("id", &self.id)
            .field("service", &self.service)
            .field("endpoint", &self.endpoint)
            .field("remote", &self.conn.remote_address())
            .field("err", &self.err)
            .finish()
    }
}
