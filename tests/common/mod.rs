//! Shared harness: real cache nodes on loopback ports, discovering each
//! other through the in-memory hub.

#![allow(dead_code)]

use geocache::{CacheNode, Discovery, DiscoveryHub, NodeConfig};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

pub struct TestNode {
    pub port: u16,
    pub region: String,
    shutdown: Option<oneshot::Sender<()>>,
    handle: tokio::task::JoinHandle<()>,
}

impl TestNode {
    pub async fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        let _ = self.handle.await;
    }
}

/// Bring up a node bound to `127.0.0.1:port` and wait until its transport
/// answers. Registration with the hub follows immediately after the bind.
pub async fn spawn_node(
    hub: &Arc<DiscoveryHub>,
    port: u16,
    region: &str,
    test_node: bool,
) -> TestNode {
    let config = NodeConfig::new("127.0.0.1".parse().unwrap(), port, region)
        .with_test_node(test_node);
    let discovery: Arc<dyn Discovery> = Arc::clone(hub) as Arc<dyn Discovery>;
    let node = CacheNode::new(config, discovery);
    let (tx, rx) = oneshot::channel();
    let handle = tokio::spawn(async move {
        node.serve(async {
            let _ = rx.await;
        })
        .await
        .expect("node serve failed");
    });
    wait_until_responsive(port).await;
    TestNode {
        port,
        region: region.to_string(),
        shutdown: Some(tx),
        handle,
    }
}

pub async fn wait_until_responsive(port: u16) {
    let http = reqwest::Client::new();
    let url = format!("http://127.0.0.1:{}/ping", port);
    for _ in 0..100 {
        if http
            .get(&url)
            .timeout(Duration::from_secs(2))
            .send()
            .await
            .is_ok()
        {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("node on port {} never became responsive", port);
}

/// Slow a test node down, as if its network went bad.
pub async fn inject_extra_latency(port: u16, seconds: f64) {
    let url = format!(
        "http://127.0.0.1:{}/extra_latency?seconds={}",
        port, seconds
    );
    reqwest::Client::new()
        .post(&url)
        .send()
        .await
        .expect("extra_latency request failed");
}

pub fn node_url(port: u16, path: &str) -> String {
    format!("http://127.0.0.1:{}{}", port, path)
}
