//! Call wrappers for extensible per-attempt processing

use crate::error::{ClientError, Result};
use crate::request::Response;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, span, warn, Instrument, Level};

/// Context passed through the wrapper chain for one attempt
#[derive(Clone, Debug)]
pub struct WrapperContext {
    pub service: String,
    pub endpoint: String,
    /// Address of the node this attempt goes to
    pub address: String,
    pub attempt: u32,
    /// Outgoing request headers; wrappers may add to them
    pub headers: HashMap<String, String>,
    /// Scratch space shared between a wrapper's hooks
    pub metadata: HashMap<String, String>,
    pub started: Instant,
}

impl WrapperContext {
    pub fn new(service: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            endpoint: endpoint.into(),
            address: String::new(),
            attempt: 0,
            headers: HashMap::new(),
            metadata: HashMap::new(),
            started: Instant::now(),
        }
    }
}

/// Hooks around every call attempt
#[async_trait::async_trait]
pub trait CallWrapper: Send + Sync {
    fn name(&self) -> &'static str {
        "UnnamedWrapper"
    }

    /// Called before the request is sent. An error fails the attempt.
    async fn on_request(&self, _context: &mut WrapperContext) -> Result<()> {
        Ok(())
    }

    async fn on_response(&self, _context: &WrapperContext, _response: &Response) -> Result<()> {
        Ok(())
    }

    async fn on_error(&self, _context: &WrapperContext, _error: &ClientError) -> Result<()> {
        Ok(())
    }
}

/// Chain of wrappers to execute in order
#[derive(Clone, Default)]
pub struct WrapperChain {
    wrappers: Vec<Arc<dyn CallWrapper>>,
}

impl WrapperChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add<W: CallWrapper + 'static>(mut self, wrapper: W) -> Self {
        self.wrappers.push(Arc::new(wrapper));
        self
    }

    pub fn push(&mut self, wrapper: Arc<dyn CallWrapper>) {
        self.wrappers.push(wrapper);
    }

    pub fn len(&self) -> usize {
        self.wrappers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.wrappers.is_empty()
    }

    pub async fn on_request(&self, context: &mut WrapperContext) -> Result<()> {
        for wrapper in &self.wrappers {
            let span = span!(Level::DEBUG, "wrapper", name = wrapper.name());
            async {
                debug!("Processing on_request");
                wrapper.on_request(context).await
            }
            .instrument(span)
            .await?;
        }
        Ok(())
    }

    /// Runs in reverse order. Failures are logged, the response stands.
    pub async fn on_response(&self, context: &WrapperContext, response: &Response) {
        for wrapper in self.wrappers.iter().rev() {
            if let Err(e) = wrapper.on_response(context, response).await {
                warn!(wrapper = wrapper.name(), error = %e, "Wrapper on_response failed");
            }
        }
    }

    pub async fn on_error(&self, context: &WrapperContext, error: &ClientError) {
        for wrapper in &self.wrappers {
            if let Err(e) = wrapper.on_error(context, error).await {
                warn!(wrapper = wrapper.name(), error = %e, "Wrapper on_error failed");
            }
        }
    }
}

/// Logs each attempt and its outcome
pub struct LoggingWrapper;

#[async_trait::async_trait]
impl CallWrapper for LoggingWrapper {
    fn name(&self) -> &'static str {
        "LoggingWrapper"
    }

    async fn on_request(&self, context: &mut WrapperContext) -> Result<()> {
        debug!(
            "Call: {} {} -> {} (attempt: {})",
            context.service, context.endpoint, context.address, context.attempt
        );
        Ok(())
    }

    async fn on_response(&self, context: &WrapperContext, response: &Response) -> Result<()> {
        debug!(
            "Reply: {} {} <- {} ({} bytes, duration: {}ms)",
            context.service,
            context.endpoint,
            context.address,
            response.body.len(),
            context.started.elapsed().as_millis()
        );
        Ok(())
    }

    async fn on_error(&self, context: &WrapperContext, error: &ClientError) -> Result<()> {
        debug!(
            "Error: {} {} @ {} - {}",
            context.service, context.endpoint, context.address, error
        );
        Ok(())
    }
}
