use anyhow::Result;
use meshrpc_client::rpc_codec::PROTOCOL_METADATA;
use meshrpc_client::server::serve;
use meshrpc_client::transport::TcpTransportListener;
use meshrpc_client::{
    CallContext, CallOptions, ClientConfig, ClientError, ClientMetrics, CodecSet, LoggingWrapper,
    MetricsWrapper, Request, RpcClient, TracingWrapper,
};
use meshrpc_core::{Endpoint, MemoryRegistry, Node, RegisterOptions, Registry, Service};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

mod handler;

use handler::{Greeter, HelloRequest, HelloResponse, SERVICE};

const NODE_COUNT: usize = 2;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Starting meshrpc-demo...");

    let config = load_config()?;
    info!("Client configuration loaded");
    info!("  - Content type: {}", config.content_type);
    info!("  - Retries: {}", config.retries);
    info!("  - Selection strategy: {}", config.strategy);

    let registry = Arc::new(MemoryRegistry::new());
    let mut service = Service::new(SERVICE, "1.0.0")
        .with_endpoint(Endpoint::new("Greeter.Hello"))
        .with_endpoint(Endpoint::new("Greeter.Echo"));
    for _ in 0..NODE_COUNT {
        service = service.with_node(start_node().await?);
    }
    registry
        .register(&service, RegisterOptions::default())
        .await?;
    info!("Registered {} nodes for service {}", NODE_COUNT, SERVICE);

    let metrics = ClientMetrics::new()?;
    let client = RpcClient::builder()
        .config(config)
        .registry(registry.clone())
        .wrap(TracingWrapper::with_service_name("meshrpc-demo"))
        .wrap(LoggingWrapper)
        .wrap(MetricsWrapper::new(metrics.clone()))
        .build()?;
    info!("RPC client initialized");

    let ctx = CallContext::new().with_timeout(Duration::from_secs(10));

    for name in ["John", "Jane", "Joe"] {
        let body = serde_json::to_vec(&HelloRequest {
            name: name.to_string(),
        })?;
        let request = client.new_request(SERVICE, "Greeter.Hello", body);
        let response: HelloResponse = client.call(&ctx, &request).await?.json()?;
        info!("{} (served by {})", response.msg, response.node);
    }

    // Same request twice; the second is answered from the response cache
    let cached = CallOptions::default().with_cache(Duration::from_secs(30));
    let request = Request::json(
        SERVICE,
        "Greeter.Hello",
        &HelloRequest {
            name: "Cache".to_string(),
        },
    )?;
    for _ in 0..2 {
        let response: HelloResponse = client.call_with(&ctx, &request, &cached).await?.json()?;
        debug!("Cached call answered by {}", response.node);
    }
    info!("Response cache entries: {}", client.response_cache().list()?);

    let missing = client.new_request(SERVICE, "Greeter.Missing", b"{}".to_vec());
    match client.call(&ctx, &missing).await {
        Ok(_) => warn!("Call to a missing endpoint unexpectedly succeeded"),
        Err(e) => info!("Missing endpoint rejected: {}", e),
    }

    run_stream(&client, &ctx).await?;

    info!("Metrics:\n{}", metrics.gather()?);

    client.close().await?;
    info!("meshrpc-demo finished");
    Ok(())
}

/// Load configuration from the file named by MESHRPC_CONFIG, if set
fn load_config() -> Result<ClientConfig> {
    match std::env::var("MESHRPC_CONFIG") {
        Ok(path) => {
            let config = ClientConfig::load(&path)?;
            info!("Configuration loaded from {}", path);
            Ok(config)
        }
        Err(_) => {
            debug!("MESHRPC_CONFIG not set, using defaults");
            Ok(ClientConfig::default())
        }
    }
}

/// Bind a greeter node on an ephemeral port and accept connections in the background
async fn start_node() -> Result<Node> {
    let listener = TcpTransportListener::bind("127.0.0.1:0").await?;
    let address = listener.local_addr()?.to_string();
    let id = format!("{}-{}", SERVICE, Uuid::new_v4());
    let greeter = Greeter::new(id.clone());
    info!("Greeter node {} listening on {}", id, address);

    tokio::task::spawn(async move {
        loop {
            match listener.accept().await {
                Ok(conn) => {
                    let greeter = greeter.clone();
                    tokio::task::spawn(async move {
                        let result =
                            serve(conn, CodecSet::new(), move |message| greeter.handle(message))
                                .await;
                        if let Err(e) = result {
                            debug!("Error serving connection: {}", e);
                        }
                    });
                }
                Err(e) => {
                    warn!("Error accepting connection: {}", e);
                }
            }
        }
    });

    Ok(Node::new(id, address).with_metadata(PROTOCOL_METADATA, "mucp"))
}

async fn run_stream(client: &RpcClient, ctx: &CallContext) -> Result<()> {
    let request = Request::new(SERVICE, "Greeter.Echo", Vec::new()).streaming();
    let mut stream = client.stream(ctx, &request).await?;
    info!("Stream {} opened to {}", stream.id(), stream.remote_address());

    for word in ["hello", "stream"] {
        stream.send(serde_json::to_vec(word)?).await?;
        let response = stream.recv().await?;
        info!("Stream echoed {}", String::from_utf8_lossy(&response.body));
    }

    stream.send(serde_json::to_vec("bye")?).await?;
    match stream.recv().await {
        Err(ClientError::StreamClosed) => info!("Stream closed by the node"),
        Ok(response) => warn!(
            "Expected end of stream, got {}",
            String::from_utf8_lossy(&response.body)
        ),
        Err(e) => return Err(e.into()),
    }
    if let Err(e) = stream.close().await {
        debug!("Error closing stream: {}", e);
    }
    Ok(())
}
