//! Prometheus metrics for client calls

use crate::error::{ClientError, Result};
use crate::middleware::{CallWrapper, WrapperContext};
use crate::request::Response;
use prometheus::{CounterVec, Encoder, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder};
use std::sync::Arc;
use tracing::debug;

/// Prometheus metrics collector for RPC calls
#[derive(Clone)]
pub struct ClientMetrics {
    /// Successful calls by service and endpoint
    pub rpc_calls_total: CounterVec,
    /// Attempts made, including retries
    pub rpc_call_attempts_total: CounterVec,
    /// Failed attempts by status code
    pub rpc_call_errors_total: CounterVec,
    /// Attempt latency in seconds
    pub rpc_call_duration_seconds: HistogramVec,
    pub registry: Arc<Registry>,
}

impl ClientMetrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let rpc_calls_total = CounterVec::new(
            Opts::new("rpc_calls_total", "Total successful RPC calls"),
            &["service", "endpoint"],
        )?;

        let rpc_call_attempts_total = CounterVec::new(
            Opts::new("rpc_call_attempts_total", "Total RPC call attempts"),
            &["service"],
        )?;

        let rpc_call_errors_total = CounterVec::new(
            Opts::new("rpc_call_errors_total", "Total failed RPC call attempts"),
            &["service", "code"],
        )?;

        let rpc_call_duration_seconds = HistogramVec::new(
            HistogramOpts::new("rpc_call_duration_seconds", "RPC call latency in seconds"),
            &["service", "endpoint"],
        )?;

        registry.register(Box::new(rpc_calls_total.clone()))?;
        registry.register(Box::new(rpc_call_attempts_total.clone()))?;
        registry.register(Box::new(rpc_call_errors_total.clone()))?;
        registry.register(Box::new(rpc_call_duration_seconds.clone()))?;

        Ok(Self {
            rpc_calls_total,
            rpc_call_attempts_total,
            rpc_call_errors_total,
            rpc_call_duration_seconds,
            registry,
        })
    }

    /// Gather all metrics in Prometheus text format
    pub fn gather(&self) -> prometheus::Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = vec![];
        encoder.encode(&metric_families, &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

/// Feeds [`ClientMetrics`] from the wrapper chain
pub struct MetricsWrapper {
    pub metrics: ClientMetrics,
}

impl MetricsWrapper {
    pub fn new(metrics: ClientMetrics) -> Self {
        Self { metrics }
    }
}

#[async_trait::async_trait]
impl CallWrapper for MetricsWrapper {
    fn name(&self) -> &'static str {
        "MetricsWrapper"
    }

    async fn on_request(&self, context: &mut WrapperContext) -> Result<()> {
        self.metrics
            .rpc_call_attempts_total
            .with_label_values(&[&context.service])
            .inc();
        Ok(())
    }

    async fn on_response(&self, context: &WrapperContext, _response: &Response) -> Result<()> {
        debug!("Recording call metrics for {} {}", context.service, context.endpoint);
        self.metrics
            .rpc_calls_total
            .with_label_values(&[&context.service, &context.endpoint])
            .inc();
        self.metrics
            .rpc_call_duration_seconds
            .with_label_values(&[&context.service, &context.endpoint])
            .observe(context.started.elapsed().as_secs_f64());
        Ok(())
    }

    async fn on_error(&self, context: &WrapperContext, error: &ClientError) -> Result<()> {
        let code = error.code().unwrap_or(0).to_string();
        self.metrics
            .rpc_call_errors_total
            .with_label_values(&[&context.service, &code])
            .inc();
        self.metrics
            .rpc_call_duration_seconds
            .with_label_values(&[&context.service, &context.endpoint])
            .observe(context.started.elapsed().as_secs_f64());
        Ok(())
    }
}
