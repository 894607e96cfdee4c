//! Memoization through the cache.
//!
//! A call is identified by a digest of its arguments; the result travels
//! through the cache as a JSON document, so memoized functions must return
//! values with a serde representation. Unencodable results are rejected
//! rather than silently skipped.

use crate::client::ClientRegistry;
use crate::error::Result;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Display;
use tracing::{debug, warn};

/// Stable digest over a call's arguments.
///
/// Positional arguments fold in order; keyword arguments fold key and value
/// both. 128-bit md5: collision resistance within a reasonable population,
/// nothing cryptographic.
pub struct Fingerprint {
    ctx: md5::Context,
}

impl Default for Fingerprint {
    fn default() -> Self {
        Self::new()
    }
}

impl Fingerprint {
    pub fn new() -> Self {
        Self {
            ctx: md5::Context::new(),
        }
    }

    pub fn arg(mut self, value: impl Display) -> Self {
        self.ctx.consume(value.to_string());
        self
    }

    pub fn kwarg(mut self, key: &str, value: impl Display) -> Self {
        self.ctx.consume(key);
        self.ctx.consume(value.to_string());
        self
    }

    pub fn hex_digest(self) -> String {
        format!("{:x}", self.ctx.compute())
    }
}

/// Memoize pure functions through a region's cache client.
///
/// `call` looks the fingerprinted key up first; on a miss it runs the
/// computation, writes the encoded result with the configured expiry, and
/// returns the original value rather than a decoded copy.
pub struct Memo {
    region: String,
    expiry_seconds: u64,
}

impl Memo {
    pub fn new(region: impl Into<String>, expiry_seconds: u64) -> Self {
        Self {
            region: region.into(),
            expiry_seconds,
        }
    }

    pub fn cache_key(name: &str, fingerprint: Fingerprint) -> String {
        format!("{}--{}", name, fingerprint.hex_digest())
    }

    pub async fn call<T, F, Fut>(&self, name: &str, fingerprint: Fingerprint, compute: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = T>,
    {
        let client = ClientRegistry::global().get_or_create(&self.region)?;
        let key = Self::cache_key(name, fingerprint);

        if let Some(bytes) = client.get(&key).await {
            match serde_json::from_slice(&bytes) {
                Ok(value) => {
                    debug!(%key, "memoized value served from cache");
                    return Ok(value);
                }
                Err(e) => warn!(%key, %e, "cached value failed to decode, recomputing"),
            }
        }

        let value = compute().await;
        let encoded = serde_json::to_vec(&value)?;
        client.put(&key, encoded, self.expiry_seconds).await;
        Ok(value)
    }
}
