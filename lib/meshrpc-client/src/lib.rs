//! RPC client for services discovered through a registry
//!
//! This library provides:
//! - Node selection with filters and pluggable strategies
//! - Per-address connection pooling over a framed TCP transport
//! - Content-type negotiation across modern and legacy codecs
//! - A call loop with retries, backoff, timeouts and cancellation
//! - Bidirectional streams and an opt-in response cache
//! - Call wrappers for logging, trace propagation and Prometheus metrics

pub mod client;
pub mod codec;
pub mod config;
pub mod context;
pub mod error;
pub mod filter;
pub mod metrics;
pub mod middleware;
pub mod options;
pub mod policy;
pub mod pool;
pub mod request;
pub mod response_cache;
pub mod rpc_codec;
pub mod selector;
pub mod server;
pub mod stream;
pub mod tracing;
pub mod transport;

pub use client::{RpcClient, RpcClientBuilder, PACKAGE_ID};
pub use codec::{Codec, CodecTable, Message, MessageType};
pub use config::ClientConfig;
pub use context::CallContext;
pub use error::{ClientError, Result, RpcError};
pub use filter::{EndpointFilter, Filter, LabelFilter, VersionFilter};
pub use metrics::{ClientMetrics, MetricsWrapper};
pub use middleware::{CallWrapper, LoggingWrapper, WrapperChain, WrapperContext};
pub use options::CallOptions;
pub use policy::{exponential_backoff, retry_always, retry_on_error, BackoffFn, RetryFn};
pub use pool::{ConnectionPool, PoolOptions, PooledConnection};
pub use request::{Request, Response};
pub use response_cache::ResponseCache;
pub use rpc_codec::{CodecSet, RpcCodec};
pub use selector::{Next, RegistrySelector, SelectOptions, Selector, Strategy, StrategyKind};
pub use server::Reply;
pub use stream::RpcStream;
pub use self::tracing::TracingWrapper;
pub use transport::{Connection, DialOptions, Transport, TransportError, TransportMessage};
