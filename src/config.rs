use crate::error::{CacheError, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::net::IpAddr;

pub const DEFAULT_PORT: u16 = 6789;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Address the transport binds to and advertises over discovery.
    pub bind_address: IpAddr,
    pub port: u16,
    /// Region label this node belongs to. Opaque to the system.
    pub region: String,
    /// Synthetic node: advertises a base latency and injects per-request
    /// delays, for exercising the failover policy.
    pub test_node: bool,
}

impl NodeConfig {
    pub fn new(bind_address: IpAddr, port: u16, region: impl Into<String>) -> Self {
        Self {
            bind_address,
            port,
            region: region.into(),
            test_node: false,
        }
    }

    pub fn with_test_node(mut self, test_node: bool) -> Self {
        self.test_node = test_node;
        self
    }

    pub fn load() -> Result<Self> {
        let bind_address = env::var("GEOCACHE_BIND_ADDR")
            .unwrap_or_else(|_| "127.0.0.1".to_string())
            .parse()
            .map_err(|e| CacheError::Config(format!("invalid GEOCACHE_BIND_ADDR: {}", e)))?;

        let port = env::var("GEOCACHE_PORT")
            .unwrap_or_else(|_| DEFAULT_PORT.to_string())
            .parse()
            .unwrap_or(DEFAULT_PORT);

        let region = env::var("GEOCACHE_REGION")
            .map_err(|_| CacheError::Config("GEOCACHE_REGION must be set".to_string()))?;
        if region.is_empty() {
            return Err(CacheError::Config("GEOCACHE_REGION must not be empty".to_string()));
        }

        let test_node = env::var("GEOCACHE_TEST_NODE")
            .unwrap_or_else(|_| "false".to_string())
            .parse()
            .unwrap_or(false);

        Ok(Self {
            bind_address,
            port,
            region,
            test_node,
        })
    }
}
