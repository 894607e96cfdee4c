//! Latency probing and foreign-region ranking.
//!
//! Each peer is probed exactly once, when its appearance event arrives. A
//! failed or timed-out probe records the 9999 ms sentinel rather than
//! absence, and the sentinel participates in the region mean like any other
//! sample.

use crate::directory::Peer;
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};
use tracing::debug;

/// Sentinel latency recorded for peers that failed their probe.
pub const PROBE_FAILURE_MS: u64 = 9999;

pub const PROBE_TIMEOUT: Duration = Duration::from_millis(500);

/// Round-trip a single health request, wall-clock timed at millisecond
/// resolution. Any response counts as a sample; only transport failure or
/// timeout yields the sentinel.
pub async fn probe_peer(http: &reqwest::Client, peer: &Peer) -> u64 {
    let url = peer.url("/ping");
    let started = Instant::now();
    match http.get(&url).timeout(PROBE_TIMEOUT).send().await {
        Ok(_) => started.elapsed().as_millis() as u64,
        Err(e) => {
            debug!(%url, %e, "probe failed");
            PROBE_FAILURE_MS
        }
    }
}

/// Per-peer latency samples, derived per-region means, and the ranked list
/// of foreign regions (ascending mean, local region excluded).
pub struct LatencyTable {
    local_region: String,
    samples: RwLock<HashMap<String, HashMap<String, u64>>>,
    averages: RwLock<HashMap<String, u64>>,
    ranked: RwLock<Vec<String>>,
}

impl LatencyTable {
    pub fn new(local_region: impl Into<String>) -> Self {
        Self {
            local_region: local_region.into(),
            samples: RwLock::new(HashMap::new()),
            averages: RwLock::new(HashMap::new()),
            ranked: RwLock::new(Vec::new()),
        }
    }

    pub fn record(&self, region: &str, peer_name: &str, latency_ms: u64) {
        {
            let mut samples = self.samples.write().unwrap();
            samples
                .entry(region.to_string())
                .or_default()
                .insert(peer_name.to_string(), latency_ms);
        }
        self.rebuild();
    }

    /// Drop a departed peer's sample; when its region lost the last peer,
    /// drop the region's entries entirely.
    pub fn forget_peer(&self, region: &str, peer_name: &str, region_emptied: bool) {
        {
            let mut samples = self.samples.write().unwrap();
            if let Some(region_samples) = samples.get_mut(region) {
                region_samples.remove(peer_name);
            }
            if region_emptied {
                samples.remove(region);
            } else if samples.get(region).is_some_and(HashMap::is_empty) {
                samples.remove(region);
            }
        }
        self.rebuild();
    }

    /// Arithmetic mean of the region's current samples, rounded to integer
    /// milliseconds.
    pub fn mean(&self, region: &str) -> Option<u64> {
        self.averages.read().unwrap().get(region).copied()
    }

    /// Foreign regions, ascending by mean latency. Ties break by region name
    /// so the order is stable.
    pub fn ranked_neighbours(&self) -> Vec<String> {
        self.ranked.read().unwrap().clone()
    }

    fn rebuild(&self) {
        let samples = self.samples.read().unwrap();
        let mut averages: HashMap<String, u64> = HashMap::new();
        for (region, region_samples) in samples.iter() {
            if region_samples.is_empty() {
                continue;
            }
            let sum: u64 = region_samples.values().sum();
            let mean = (sum as f64 / region_samples.len() as f64).round() as u64;
            averages.insert(region.clone(), mean);
        }
        let mut ranked: Vec<(String, u64)> = averages
            .iter()
            .filter(|(region, _)| **region != self.local_region)
            .map(|(region, mean)| (region.clone(), *mean))
            .collect();
        ranked.sort_by(|a, b| (a.1, &a.0).cmp(&(b.1, &b.0)));

        *self.averages.write().unwrap() = averages;
        *self.ranked.write().unwrap() = ranked.into_iter().map(|(region, _)| region).collect();
    }
}
