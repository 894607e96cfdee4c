//! Peer directory: the `region -> ordered peers` view built from discovery
//! events.
//!
//! Insertion order within a region is the discovery order and is observable;
//! the client failover policy round-robins over it. A peer name occurs in at
//! most one region at a time, and a region disappears with its last peer.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;
use std::sync::RwLock;

/// An immutable record for one discovered cache node.
///
/// Created on a discovery "appeared" event, dropped on "departed". Never
/// mutated in place; a re-announcement replaces the record wholesale.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    /// Stable service instance name, unique across the cluster.
    pub name: String,
    pub address: IpAddr,
    pub port: u16,
    pub region: String,
    /// Attribute bag from the service advertisement (`test_server`,
    /// `test_latency`, ...).
    pub properties: BTreeMap<String, String>,
}

impl Peer {
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.address, self.port)
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url(), path)
    }

    pub fn is_test_server(&self) -> bool {
        self.properties
            .get("test_server")
            .is_some_and(|v| v == "true" || v == "1")
    }

    /// Base artificial delay a synthetic node advertises, if any.
    pub fn test_latency_ms(&self) -> Option<u64> {
        self.properties.get("test_latency")?.parse().ok()
    }
}

/// Outcome of removing a peer, used for latency-table cleanup.
#[derive(Debug)]
pub struct RemovedPeer {
    pub peer: Peer,
    /// True when the peer was the last one in its region.
    pub region_emptied: bool,
}

#[derive(Debug, Default)]
pub struct PeerDirectory {
    regions: RwLock<HashMap<String, Vec<Peer>>>,
}

impl PeerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a peer to its region, creating the region if new.
    ///
    /// A peer already present under the same name (in any region) is removed
    /// first, so re-announcements refresh the record without duplicating it.
    pub fn insert(&self, peer: Peer) {
        let mut regions = self.regions.write().unwrap();
        for (_, peers) in regions.iter_mut() {
            peers.retain(|p| p.name != peer.name);
        }
        regions.retain(|_, peers| !peers.is_empty());
        regions.entry(peer.region.clone()).or_default().push(peer);
    }

    /// Remove a peer by name, wherever it lives.
    pub fn remove(&self, name: &str) -> Option<RemovedPeer> {
        let mut regions = self.regions.write().unwrap();
        let region = regions
            .iter()
            .find(|(_, peers)| peers.iter().any(|p| p.name == name))?
            .0
            .clone();
        let peers = regions.get_mut(&region)?;
        let idx = peers.iter().position(|p| p.name == name)?;
        let peer = peers.remove(idx);
        let region_emptied = peers.is_empty();
        if region_emptied {
            regions.remove(&region);
        }
        Some(RemovedPeer {
            peer,
            region_emptied,
        })
    }

    pub fn find(&self, name: &str) -> Option<Peer> {
        let regions = self.regions.read().unwrap();
        regions
            .values()
            .flat_map(|peers| peers.iter())
            .find(|p| p.name == name)
            .cloned()
    }

    /// Snapshot of a region's peers in discovery order.
    pub fn peers_in(&self, region: &str) -> Vec<Peer> {
        self.regions
            .read()
            .unwrap()
            .get(region)
            .cloned()
            .unwrap_or_default()
    }

    pub fn regions(&self) -> Vec<String> {
        self.regions.read().unwrap().keys().cloned().collect()
    }

    /// Consistent snapshot of the whole directory, for iteration outside the
    /// lock (fan-out must survive concurrent departures).
    pub fn snapshot(&self) -> HashMap<String, Vec<Peer>> {
        self.regions.read().unwrap().clone()
    }

    pub fn peer_count(&self) -> usize {
        self.regions.read().unwrap().values().map(Vec::len).sum()
    }
}
