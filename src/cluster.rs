//! The live cluster topology shared by clients and servers: the peer
//! directory plus the latency ranking, kept current by a discovery event
//! driver task.

use crate::directory::{Peer, PeerDirectory};
use crate::discovery::PeerEvent;
use crate::probe::{probe_peer, LatencyTable};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tracing::{debug, info};

pub struct ClusterView {
    region: String,
    directory: PeerDirectory,
    latency: LatencyTable,
    http: reqwest::Client,
}

impl ClusterView {
    pub fn new(region: impl Into<String>) -> Arc<Self> {
        let region = region.into();
        Arc::new(Self {
            directory: PeerDirectory::new(),
            latency: LatencyTable::new(region.clone()),
            http: reqwest::Client::new(),
            region,
        })
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    pub fn directory(&self) -> &PeerDirectory {
        &self.directory
    }

    pub fn peers_in(&self, region: &str) -> Vec<Peer> {
        self.directory.peers_in(region)
    }

    pub fn local_peers(&self) -> Vec<Peer> {
        self.directory.peers_in(&self.region)
    }

    /// Foreign regions ascending by mean latency; never contains the local
    /// region.
    pub fn ranked_neighbours(&self) -> Vec<String> {
        self.latency.ranked_neighbours()
    }

    pub fn mean_latency(&self, region: &str) -> Option<u64> {
        self.latency.mean(region)
    }

    /// Apply one discovery event. Appearances probe the new peer once and
    /// refresh the ranking; departures clean the latency table with the
    /// directory.
    pub async fn handle_event(&self, event: PeerEvent) {
        match event {
            PeerEvent::Appeared(peer) => {
                info!(name = %peer.name, region = %peer.region, url = %peer.base_url(), "peer appeared");
                self.directory.insert(peer.clone());
                let sample = probe_peer(&self.http, &peer).await;
                self.latency.record(&peer.region, &peer.name, sample);
                debug!(name = %peer.name, latency_ms = sample, "probe complete");
                self.log_summary();
            }
            PeerEvent::Departed { name } => {
                if let Some(removed) = self.directory.remove(&name) {
                    info!(%name, region = %removed.peer.region, "peer departed");
                    self.latency.forget_peer(
                        &removed.peer.region,
                        &name,
                        removed.region_emptied,
                    );
                    self.log_summary();
                }
            }
            PeerEvent::Updated { name } => {
                debug!(%name, "peer updated");
            }
        }
    }

    /// Consume a discovery subscription until its backend goes away.
    pub fn spawn_driver(
        self: &Arc<Self>,
        mut events: UnboundedReceiver<PeerEvent>,
    ) -> JoinHandle<()> {
        let view = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                view.handle_event(event).await;
            }
            debug!(region = %view.region, "discovery stream closed");
        })
    }

    fn log_summary(&self) {
        for (region, peers) in self.directory.snapshot() {
            debug!(
                %region,
                peers = peers.len(),
                mean_latency_ms = self.latency.mean(&region),
                "cluster region"
            );
            for peer in peers.iter().filter(|p| p.is_test_server()) {
                debug!(
                    name = %peer.name,
                    url = %peer.base_url(),
                    base_latency_ms = peer.test_latency_ms(),
                    "synthetic peer"
                );
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn seed_peer(&self, peer: Peer, latency_ms: u64) {
        self.latency.record(&peer.region, &peer.name, latency_ms);
        self.directory.insert(peer);
    }
}
