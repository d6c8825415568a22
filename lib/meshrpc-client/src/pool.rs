//! Per-address pool of idle connections

use crate::transport::{
    dial_with_timeout, Connection, DialOptions, Transport, TransportError, TransportMessage,
};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

/// Default number of idle connections kept per address
pub const DEFAULT_POOL_SIZE: usize = 100;

/// Default lifetime of a pooled connection, measured from creation
pub const DEFAULT_POOL_TTL: Duration = Duration::from_secs(60);

#[derive(Clone, Debug)]
pub struct PoolOptions {
    pub size: usize,
    pub ttl: Duration,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            size: DEFAULT_POOL_SIZE,
            ttl: DEFAULT_POOL_TTL,
        }
    }
}

/// A connection checked out of the pool
///
/// Owned exclusively by the caller until handed back with
/// [`ConnectionPool::release`].
pub struct PooledConnection {
    id: Uuid,
    address: String,
    created: Instant,
    conn: Box<dyn Connection>,
}

impl PooledConnection {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn created(&self) -> Instant {
        self.created
    }

    pub async fn send(&mut self, message: &TransportMessage) -> Result<(), TransportError> {
        self.conn.send(message).await
    }

    pub async fn recv(&mut self) -> Result<TransportMessage, TransportError> {
        self.conn.recv().await
    }

    pub async fn close(&mut self) -> Result<(), TransportError> {
        self.conn.close().await
    }
}

impl fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.id)
            .field("address", &self.address)
            .field("created", &self.created)
            .finish()
    }
}

pub struct ConnectionPool {
    options: PoolOptions,
    transport: Arc<dyn Transport>,
    idle: Mutex<HashMap<String, Vec<PooledConnection>>>,
}

impl ConnectionPool {
    pub fn new(transport: Arc<dyn Transport>, options: PoolOptions) -> Self {
        Self {
            options,
            transport,
            idle: Mutex::new(HashMap::new()),
        }
    }

    /// Most recently released live connection for `address`, or a new one
    pub async fn get(
        &self,
        address: &str,
        dial: DialOptions,
    ) -> Result<PooledConnection, TransportError> {
        let mut expired = Vec::new();
        let reused = {
            let mut idle = self.idle.lock().await;
            let mut found = None;
            if let Some(conns) = idle.get_mut(address) {
                while let Some(conn) = conns.pop() {
                    if conn.created.elapsed() >= self.options.ttl {
                        expired.push(conn);
                        continue;
                    }
                    found = Some(conn);
                    break;
                }
            }
            found
        };

        for mut conn in expired {
            debug!(address = %address, conn = %conn.id, "Closing expired pooled connection");
            if let Err(e) = conn.close().await {
                debug!("Error closing expired connection: {}", e);
            }
        }

        if let Some(conn) = reused {
            return Ok(conn);
        }

        let conn = dial_with_timeout(self.transport.as_ref(), address, dial).await?;
        let pooled = PooledConnection {
            id: Uuid::new_v4(),
            address: address.to_string(),
            created: Instant::now(),
            conn,
        };
        debug!(address = %address, conn = %pooled.id, "Dialed new pooled connection");
        Ok(pooled)
    }

    /// Hand a connection back. Failed connections and those beyond
    /// capacity are closed instead of kept.
    pub async fn release(&self, mut conn: PooledConnection, failed: bool) {
        if !failed {
            let mut idle = self.idle.lock().await;
            let conns = idle.entry(conn.address.clone()).or_default();
            if conns.len() < self.options.size {
                conns.push(conn);
                return;
            }
        }

        debug!(
            address = %conn.address,
            conn = %conn.id,
            failed = failed,
            "Discarding connection"
        );
        if let Err(e) = conn.close().await {
            debug!("Error closing discarded connection: {}", e);
        }
    }

    /// Close every idle connection, returning the last close error
    pub async fn close(&self) -> Result<(), TransportError> {
        let drained: Vec<PooledConnection> = {
            let mut idle = self.idle.lock().await;
            idle.drain().flat_map(|(_, conns)| conns).collect()
        };

        let mut result = Ok(());
        for mut conn in drained {
            if let Err(e) = conn.close().await {
                warn!(address = %conn.address, error = %e, "Failed to close pooled connection");
                result = Err(e);
            }
        }
        result
    }

    /// Number of idle connections held for `address`
    pub async fn idle_count(&self, address: &str) -> usize {
        let idle = self.idle.lock().await;
        idle.get(address).map_or(0, Vec::len)
    }
}
