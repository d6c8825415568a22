//! W3C trace-context propagation for outgoing calls

use crate::error::{ClientError, Result};
use crate::middleware::{CallWrapper, WrapperContext};
use crate::request::Response;
use std::collections::HashMap;
use tracing::{error, info};

/// Header carrying the W3C trace context
pub const TRACEPARENT: &str = "traceparent";

/// Propagates a `traceparent` header on every attempt
///
/// A trace already present in the caller's metadata is continued with a
/// fresh span id; otherwise a new trace is started.
pub struct TracingWrapper {
    pub service_name: String,
}

impl TracingWrapper {
    pub fn new() -> Self {
        Self {
            service_name: "meshrpc-client".to_string(),
        }
    }

    pub fn with_service_name(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
        }
    }

    /// Extract W3C Trace Context from headers
    /// Returns (trace_id, span_id, trace_flags) if present
    pub fn extract_w3c_trace_context(
        headers: &HashMap<String, String>,
    ) -> Option<(String, String, String)> {
        // version-trace_id-span_id-trace_flags
        headers.get(TRACEPARENT).and_then(|v| {
            let parts: Vec<&str> = v.split('-').collect();
            if parts.len() >= 4 {
                Some((parts[1].to_string(), parts[2].to_string(), parts[3].to_string()))
            } else {
                None
            }
        })
    }

    pub fn create_w3c_trace_context(trace_id: &str, span_id: &str, trace_flags: &str) -> String {
        format!("00-{}-{}-{}", trace_id, span_id, trace_flags)
    }

    /// Random 16 hex digits
    pub fn generate_span_id() -> String {
        format!("{:016x}", rand::random::<u64>())
    }

    /// Random 32 hex digits
    pub fn generate_trace_id() -> String {
        format!("{:032x}", rand::random::<u128>())
    }
}

impl Default for TracingWrapper {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl CallWrapper for TracingWrapper {
    fn name(&self) -> &'static str {
        "TracingWrapper"
    }

    async fn on_request(&self, context: &mut WrapperContext) -> Result<()> {
        let (trace_id, flags) = match Self::extract_w3c_trace_context(&context.headers) {
            Some((trace_id, _, flags)) => (trace_id, flags),
            None => (Self::generate_trace_id(), "01".to_string()),
        };
        let span_id = Self::generate_span_id();

        context.headers.insert(
            TRACEPARENT.to_string(),
            Self::create_w3c_trace_context(&trace_id, &span_id, &flags),
        );
        context.metadata.insert("trace_id".to_string(), trace_id.clone());
        context.metadata.insert("span_id".to_string(), span_id);

        info!(
            trace_id = %trace_id,
            caller = %self.service_name,
            service = %context.service,
            endpoint = %context.endpoint,
            attempt = context.attempt,
            "Call started"
        );
        Ok(())
    }

    async fn on_response(&self, context: &WrapperContext, _response: &Response) -> Result<()> {
        let trace_id = context.metadata.get("trace_id").cloned().unwrap_or_default();
        info!(
            trace_id = %trace_id,
            service = %context.service,
            endpoint = %context.endpoint,
            "Call completed"
        );
        Ok(())
    }

    async fn on_error(&self, context: &WrapperContext, err: &ClientError) -> Result<()> {
        let trace_id = context.metadata.get("trace_id").cloned().unwrap_or_default();
        error!(
            trace_id = %trace_id,
            error = %err,
            service = %context.service,
            endpoint = %context.endpoint,
            "Call error"
        );
        Ok(())
    }
}
