//! The RPC client: resolve, acquire, negotiate, transmit, retry

use crate::codec::{Codec, Message, MessageType};
use crate::config::ClientConfig;
use crate::context::CallContext;
use crate::error::{ClientError, Result, RpcError};
use crate::middleware::{CallWrapper, WrapperChain, WrapperContext};
use crate::options::CallOptions;
use crate::pool::ConnectionPool;
use crate::request::{Request, Response};
use crate::response_cache::ResponseCache;
use crate::rpc_codec::{headers, CodecSet, RpcCodec, PROTOCOL_METADATA};
use crate::selector::{Next, Random, RegistrySelector, Selector, Strategy};
use crate::stream::RpcStream;
use crate::transport::{dial_with_timeout, DialOptions, TcpTransport, Transport, TransportError};
use meshrpc_core::{Node, Registry, RegistryCache, Service};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Error id used for failures raised by the client itself
pub const PACKAGE_ID: &str = "meshrpc.client";

/// Transport failures surface as retryable internal errors
pub(crate) fn connection_error(err: TransportError) -> ClientError {
    RpcError::internal_server_error(PACKAGE_ID, format!("connection error: {}", err)).into()
}

fn timeout_error(timeout: Duration) -> ClientError {
    RpcError::timeout(
        PACKAGE_ID,
        format!("request timeout after {}ms", timeout.as_millis()),
    )
    .into()
}

pub struct RpcClient {
    content_type: String,
    options: CallOptions,
    selector: Arc<dyn Selector>,
    transport: Arc<dyn Transport>,
    pool: ConnectionPool,
    codecs: CodecSet,
    cache: ResponseCache,
    wrappers: WrapperChain,
    seq: AtomicU64,
}

impl RpcClient {
    pub fn builder() -> RpcClientBuilder {
        RpcClientBuilder::default()
    }

    /// Request using the client's content type
    pub fn new_request(
        &self,
        service: impl Into<String>,
        endpoint: impl Into<String>,
        body: Vec<u8>,
    ) -> Request {
        Request::new(service, endpoint, body).with_content_type(self.content_type.clone())
    }

    /// Default options applied by [`RpcClient::call`]
    pub fn options(&self) -> &CallOptions {
        &self.options
    }

    pub fn response_cache(&self) -> &ResponseCache {
        &self.cache
    }

    pub async fn call(&self, ctx: &CallContext, request: &Request) -> Result<Response> {
        self.call_with(ctx, request, &self.options).await
    }

    pub async fn call_with(
        &self,
        ctx: &CallContext,
        request: &Request,
        options: &CallOptions,
    ) -> Result<Response> {
        if options.cache_expiry.is_some() {
            if let Some(response) = self.cache.get(request) {
                return Ok(response);
            }
        }

        let mut next = self.next(request, options).await?;
        let response = self
            .with_retries(ctx, request, options, &mut next, move |node, attempt| {
                self.call_node(ctx, request, options, node, attempt)
            })
            .await?;

        if let Some(ttl) = options.cache_expiry {
            self.cache.set(request, response.clone(), ttl);
        }
        Ok(response)
    }

    pub async fn stream(&self, ctx: &CallContext, request: &Request) -> Result<RpcStream> {
        self.stream_with(ctx, request, &self.options).await
    }

    /// Open a bidirectional stream. Establishing it is retried like a call;
    /// once open, failures are terminal for the stream.
    ///
    /// The request must be marked with [`Request::streaming`].
    pub async fn stream_with(
        &self,
        ctx: &CallContext,
        request: &Request,
        options: &CallOptions,
    ) -> Result<RpcStream> {
        if !request.stream {
            return Err(ClientError::InvalidConfiguration(format!(
                "{} {} is not a streaming request",
                request.service, request.endpoint
            )));
        }
        let mut next = self.next(request, options).await?;
        self.with_retries(ctx, request, options, &mut next, move |node, attempt| {
            self.open_stream(ctx, request, options, node, attempt)
        })
        .await
    }

    /// Stop registry watchers and close idle connections
    pub async fn close(&self) -> Result<()> {
        info!("Closing RPC client");
        self.selector.close();
        self.pool.close().await.map_err(connection_error)
    }

    async fn next(&self, request: &Request, options: &CallOptions) -> Result<Next> {
        if options.address.is_empty() {
            return self
                .selector
                .select(&request.service, &options.select_options)
                .await;
        }

        let service = options.address.iter().fold(
            Service::new(request.service.clone(), ""),
            |service, address| {
                service.with_node(
                    Node::new(address.clone(), address.clone())
                        .with_metadata(PROTOCOL_METADATA, "mucp"),
                )
            },
        );
        Ok(Random.select(vec![service]))
    }

    async fn with_retries<T, F, Fut>(
        &self,
        ctx: &CallContext,
        request: &Request,
        options: &CallOptions,
        next: &mut Next,
        mut attempt_fn: F,
    ) -> Result<T>
    where
        F: FnMut(Node, u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            ctx.check()?;
            let node = next()?;

            let err = match attempt_fn(node.clone(), attempt).await {
                Ok(value) => {
                    self.selector.mark(&request.service, &node, None);
                    return Ok(value);
                }
                Err(err) => err,
            };
            self.selector.mark(&request.service, &node, Some(&err));

            if matches!(err, ClientError::Cancelled | ClientError::DeadlineExceeded) {
                return Err(err);
            }
            if attempt >= options.retries || !(options.retry)(ctx, request, attempt, &err)? {
                return Err(err);
            }

            let delay = (options.backoff)(attempt);
            debug!(
                service = %request.service,
                endpoint = %request.endpoint,
                attempt = attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Retrying call"
            );
            if !delay.is_zero() {
                tokio::select! {
                    err = ctx.done() => return Err(err),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            attempt += 1;
        }
    }

    fn wrapper_context(
        &self,
        ctx: &CallContext,
        request: &Request,
        node: &Node,
        attempt: u32,
    ) -> WrapperContext {
        let mut context = WrapperContext::new(request.service.clone(), request.endpoint.clone());
        context.address = node.address.clone();
        context.attempt = attempt;
        context.headers = ctx.metadata.clone();
        context.headers.extend(request.header.clone());
        context
    }

    async fn call_node(
        &self,
        ctx: &CallContext,
        request: &Request,
        options: &CallOptions,
        node: Node,
        attempt: u32,
    ) -> Result<Response> {
        let mut context = self.wrapper_context(ctx, request, &node, attempt);
        if let Err(e) = self.wrappers.on_request(&mut context).await {
            self.wrappers.on_error(&context, &e).await;
            return Err(e);
        }

        let result = self
            .transmit(ctx, request, options, &node, context.headers.clone())
            .await;
        match &result {
            Ok(response) => self.wrappers.on_response(&context, response).await,
            Err(e) => self.wrappers.on_error(&context, e).await,
        }
        result
    }

    fn request_timeout(ctx: &CallContext, configured: Duration) -> Duration {
        match ctx.remaining() {
            Some(remaining) => remaining.min(configured),
            None => configured,
        }
    }

    fn request_message(&self, request: &Request, header: HashMap<String, String>) -> Message {
        Message {
            id: self.seq.fetch_add(1, Ordering::Relaxed).to_string(),
            target: request.service.clone(),
            method: request.endpoint.clone(),
            endpoint: request.endpoint.clone(),
            header,
            body: request.body.clone(),
            message_type: MessageType::Request,
            ..Default::default()
        }
    }

    /// Headers plus the codec chosen for `node`
    fn negotiate(
        &self,
        request: &Request,
        node: &Node,
        mut header: HashMap<String, String>,
        timeout: Duration,
    ) -> Result<(HashMap<String, String>, Arc<dyn Codec>)> {
        header.insert(headers::CONTENT_TYPE.to_string(), request.content_type.clone());
        header.insert(headers::TIMEOUT.to_string(), timeout.as_millis().to_string());
        let codec = self.codecs.negotiate(&mut header, node)?;
        Ok((header, codec))
    }

    async fn transmit(
        &self,
        ctx: &CallContext,
        request: &Request,
        options: &CallOptions,
        node: &Node,
        header: HashMap<String, String>,
    ) -> Result<Response> {
        let timeout = Self::request_timeout(ctx, options.request_timeout);
        let (header, codec) = self.negotiate(request, node, header, timeout)?;
        let rpc = RpcCodec::new(codec);
        let frame = rpc.write(&self.request_message(request, header))?;

        let dial = DialOptions {
            timeout: options.dial_timeout,
            stream: false,
        };
        let mut conn = self
            .pool
            .get(&node.address, dial)
            .await
            .map_err(connection_error)?;

        let exchange = async {
            conn.send(&frame).await?;
            conn.recv().await
        };
        let outcome = tokio::time::timeout(timeout, exchange).await;

        let result = match outcome {
            Ok(Ok(reply)) => rpc.read(reply, MessageType::Response),
            Ok(Err(e)) => Err(connection_error(e)),
            Err(_) => Err(timeout_error(timeout)),
        };
        // Application errors arrive in a decoded reply and keep the connection
        self.pool.release(conn, result.is_err()).await;

        let reply = result?;
        if !reply.error.is_empty() {
            return Err(RpcError::parse(&reply.error).into());
        }
        Ok(Response {
            header: reply.header,
            body: reply.body,
        })
    }

    async fn open_stream(
        &self,
        ctx: &CallContext,
        request: &Request,
        options: &CallOptions,
        node: Node,
        attempt: u32,
    ) -> Result<RpcStream> {
        let mut context = self.wrapper_context(ctx, request, &node, attempt);
        let result = async {
            self.wrappers.on_request(&mut context).await?;

            let (header, codec) = self.negotiate(
                request,
                &node,
                context.headers.clone(),
                options.stream_timeout,
            )?;
            let dial = DialOptions {
                timeout: options.dial_timeout,
                stream: true,
            };
            let conn = dial_with_timeout(self.transport.as_ref(), &node.address, dial)
                .await
                .map_err(connection_error)?;

            debug!(service = %request.service, address = %node.address, "Opened stream");
            Ok::<_, ClientError>(RpcStream::new(
                ctx.child(),
                request,
                header,
                RpcCodec::new(codec),
                conn,
                options.stream_timeout,
            ))
        }
        .await;

        if let Err(e) = &result {
            self.wrappers.on_error(&context, e).await;
        }
        result
    }
}

/// Builds an [`RpcClient`] from configuration and collaborators
#[derive(Default)]
pub struct RpcClientBuilder {
    config: ClientConfig,
    registry: Option<Arc<dyn Registry>>,
    selector: Option<Arc<dyn Selector>>,
    transport: Option<Arc<dyn Transport>>,
    codecs: CodecSet,
    wrappers: WrapperChain,
}

impl RpcClientBuilder {
    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    /// Registry consulted through a cache by the default selector
    pub fn registry(mut self, registry: Arc<dyn Registry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn selector(mut self, selector: Arc<dyn Selector>) -> Self {
        self.selector = Some(selector);
        self
    }

    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Override the codec for a content type
    pub fn codec(mut self, content_type: impl Into<String>, codec: Arc<dyn Codec>) -> Self {
        self.codecs.register(content_type, codec);
        self
    }

    pub fn wrap<W: CallWrapper + 'static>(mut self, wrapper: W) -> Self {
        self.wrappers = self.wrappers.add(wrapper);
        self
    }

    pub fn build(self) -> Result<RpcClient> {
        let config = self.config;
        let selector: Arc<dyn Selector> = match (self.selector, self.registry) {
            (Some(selector), _) => selector,
            (None, Some(registry)) => Arc::new(RegistrySelector::new(
                RegistryCache::new(registry, config.cache_options()),
                config.strategy,
            )),
            (None, None) => {
                return Err(ClientError::InvalidConfiguration(
                    "a registry or a selector is required".to_string(),
                ))
            }
        };
        let transport = self
            .transport
            .unwrap_or_else(|| Arc::new(TcpTransport::new()));

        Ok(RpcClient {
            content_type: config.content_type.clone(),
            options: config.call_options(),
            selector,
            pool: ConnectionPool::new(transport.clone(), config.pool_options()),
            transport,
            codecs: self.codecs,
            cache: ResponseCache::new(config.response_cache_capacity),
            wrappers: self.wrappers,
            seq: AtomicU64::new(0),
        })
    }
}
