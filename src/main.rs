use anyhow::Result;
use std::sync::Arc;

use geocache::{CacheNode, Discovery, MdnsDiscovery, NodeConfig};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = NodeConfig::load()?;
    tracing::info!(
        region = %config.region,
        port = config.port,
        test_node = config.test_node,
        "starting geocache node"
    );

    let discovery: Arc<dyn Discovery> = Arc::new(MdnsDiscovery::new()?);
    let node = CacheNode::new(config, discovery);
    node.run().await?;

    tracing::info!("geocache node stopped");
    Ok(())
}
