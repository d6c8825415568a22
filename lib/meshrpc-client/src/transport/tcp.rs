//! TCP transport with length-prefixed frames
//!
//! Each frame is a `u32` big-endian length followed by the JSON-encoded
//! header map, then a `u32` length followed by the raw body.

use super::{Connection, DialOptions, Transport, TransportError, TransportMessage};
use std::collections::HashMap;
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::debug;

/// Frames larger than this are rejected
const MAX_FRAME_SIZE: u32 = 64 * 1024 * 1024;

/// TcpTransport dials plain TCP connections
#[derive(Clone, Debug, Default)]
pub struct TcpTransport;

impl TcpTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait::async_trait]
impl Transport for TcpTransport {
    async fn dial(
        &self,
        address: &str,
        options: DialOptions,
    ) -> Result<Box<dyn Connection>, TransportError> {
        let stream = TcpStream::connect(address)
            .await
            .map_err(|e| TransportError::Dial {
                address: address.to_string(),
                reason: e.to_string(),
            })?;
        stream.set_nodelay(true)?;

        debug!(address = %address, stream = options.stream, "Dialed TCP connection");
        Ok(Box::new(TcpConnection::new(stream, address.to_string())))
    }

    fn name(&self) -> &'static str {
        "tcp"
    }
}

/// A framed TCP connection, used on both the dialing and accepting side
pub struct TcpConnection {
    stream: TcpStream,
    remote: String,
}

impl TcpConnection {
    fn new(stream: TcpStream, remote: String) -> Self {
        Self { stream, remote }
    }
}

#[async_trait::async_trait]
impl Connection for TcpConnection {
    async fn send(&mut self, message: &TransportMessage) -> Result<(), TransportError> {
        let header = serde_json::to_vec(&message.header)
            .map_err(|e| TransportError::Frame(e.to_string()))?;

        write_block(&mut self.stream, &header).await?;
        write_block(&mut self.stream, &message.body).await?;
        self.stream.flush().await?;
        Ok(())
    }

    async fn recv(&mut self) -> Result<TransportMessage, TransportError> {
        let header = read_block(&mut self.stream).await?;
        let header: HashMap<String, String> = serde_json::from_slice(&header)
            .map_err(|e| TransportError::Frame(e.to_string()))?;
        let body = read_block(&mut self.stream).await?;
        Ok(TransportMessage { header, body })
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.stream.shutdown().await?;
        Ok(())
    }

    fn remote_address(&self) -> &str {
        &self.remote
    }
}

async fn write_block(stream: &mut TcpStream, block: &[u8]) -> Result<(), TransportError> {
    let len = u32::try_from(block.len())
        .ok()
        .filter(|len| *len <= MAX_FRAME_SIZE)
        .ok_or_else(|| TransportError::Frame(format!("block of {} bytes too large", block.len())))?;
    stream.write_u32(len).await?;
    stream.write_all(block).await?;
    Ok(())
}

async fn read_block(stream: &mut TcpStream) -> Result<Vec<u8>, TransportError> {
    let len = stream.read_u32().await?;
    if len > MAX_FRAME_SIZE {
        return Err(TransportError::Frame(format!("block of {} bytes too large", len)));
    }
    let mut block = vec![0u8; len as usize];
    stream.read_exact(&mut block).await?;
    Ok(block)
}

/// Accepting side of the TCP transport
pub struct TcpTransportListener {
    listener: TcpListener,
}

impl TcpTransportListener {
    pub async fn bind(address: &str) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(address).await?;
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn accept(&self) -> Result<TcpConnection, TransportError> {
        let (stream, peer) = self.listener.accept().await?;
        stream.set_nodelay(true)?;
        Ok(TcpConnection::new(stream, peer.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frames_survive_tcp_round_trip() {
        let listener = TcpTransportListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();

        tokio::spawn(async move {
            let mut conn = listener.accept().await.unwrap();
            while let Ok(message) = conn.recv().await {
                conn.send(&message).await.unwrap();
            }
        });

        let mut conn = TcpTransport::new()
            .dial(&address, DialOptions::default())
            .await
            .unwrap();
        let mut message = TransportMessage::default();
        message.header.insert("Content-Type".to_string(), "application/json".to_string());
        message.body = br#"{"name":"John"}"#.to_vec();

        conn.send(&message).await.unwrap();
        assert_eq!(conn.recv().await.unwrap(), message);
        assert_eq!(conn.remote_address(), address);
        conn.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_dial_refused() {
        let listener = TcpTransportListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);

        let result = TcpTransport::new().dial(&address, DialOptions::default()).await;
        assert!(matches!(result, Err(TransportError::Dial { .. })));
    }
}
