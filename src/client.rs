//! Client-side failover policy.
//!
//! Every operation walks the same four-stage probe order and returns at the
//! first stage that succeeds:
//!
//! | stage | peer                                   | GET    | PUT/DELETE |
//! |-------|----------------------------------------|--------|------------|
//! | 1     | next local peer (round-robin)          | 500 ms | 500 ms     |
//! | 2     | next local peer, only if distinct      | 500 ms | 500 ms     |
//! | 3     | random peer of nearest foreign region  | 500 ms | 750 ms     |
//! | 4     | random peer of 2nd-nearest foreign     | 500 ms | 1000 ms    |
//!
//! Stage results are explicit values, never exceptions: a miss, a timeout,
//! and an unreachable peer all just advance the walk. A write lands on
//! exactly one target; spreading it further is the server's job.

use crate::cluster::ClusterView;
use crate::directory::Peer;
use crate::discovery::{Discovery, MdnsDiscovery};
use crate::error::Result;
use axum::body::Bytes;
use dashmap::DashMap;
use once_cell::sync::Lazy;
use rand::Rng;
use reqwest::StatusCode;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info};

const LOCAL_TIMEOUT: Duration = Duration::from_millis(500);
const GET_FOREIGN_TIMEOUT: Duration = Duration::from_millis(500);
const WRITE_RANK0_TIMEOUT: Duration = Duration::from_millis(750);
const WRITE_RANK1_TIMEOUT: Duration = Duration::from_millis(1000);

/// What one probe stage produced.
enum StageOutcome {
    /// GET found the key.
    Hit(Bytes),
    /// The transport call completed; good enough for PUT/DELETE.
    Done,
    /// The peer answered but does not have the key.
    Miss,
    /// Timeout or transport failure.
    Unreachable,
}

/// A region-bound cache client.
///
/// Holds its own live view of the cluster and a round-robin cursor over the
/// local region. `latest_action`, `cache_hit`, and `action_counter` expose
/// the most recent attempt for harnesses and the memoization layer.
pub struct CacheClient {
    region: String,
    cluster: Arc<ClusterView>,
    http: reqwest::Client,
    cursor: Mutex<usize>,
    latest_action: Mutex<String>,
    cache_hit: AtomicBool,
    action_counter: AtomicU64,
}

impl CacheClient {
    pub fn new(region: impl Into<String>, discovery: &dyn Discovery) -> Self {
        let region = region.into();
        let cluster = ClusterView::new(region.clone());
        cluster.spawn_driver(discovery.subscribe());
        info!(%region, "cache client initialized");
        Self {
            region,
            cluster,
            http: reqwest::Client::new(),
            cursor: Mutex::new(0),
            latest_action: Mutex::new("n/a".to_string()),
            cache_hit: AtomicBool::new(false),
            action_counter: AtomicU64::new(0),
        }
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    pub fn cluster(&self) -> &Arc<ClusterView> {
        &self.cluster
    }

    /// Human description of the most recently attempted request.
    pub fn latest_action(&self) -> String {
        self.latest_action.lock().unwrap().clone()
    }

    /// Whether the most recent `get` ended in a hit.
    pub fn cache_hit(&self) -> bool {
        self.cache_hit.load(Ordering::Relaxed)
    }

    /// Number of transport calls actually issued.
    pub fn action_counter(&self) -> u64 {
        self.action_counter.load(Ordering::Relaxed)
    }

    /// Advance the round-robin cursor and pick the next local peer.
    /// Stateful across calls; two consecutive picks from a region with two
    /// or more peers are distinct.
    fn next_local_peer(&self) -> Option<Peer> {
        let peers = self.cluster.local_peers();
        if peers.is_empty() {
            return None;
        }
        let mut cursor = self.cursor.lock().unwrap();
        let idx = *cursor % peers.len();
        *cursor = (idx + 1) % peers.len();
        Some(peers[idx].clone())
    }

    /// Uniform-random peer from the foreign region at the given rank
    /// (0 = nearest by mean latency).
    fn random_foreign_peer(&self, rank: usize) -> Option<Peer> {
        let ranked = self.cluster.ranked_neighbours();
        let region = ranked.get(rank)?;
        let peers = self.cluster.peers_in(region);
        if peers.is_empty() {
            return None;
        }
        Some(peers[rand::rng().random_range(0..peers.len())].clone())
    }

    fn set_action(&self, method: &str, url: &str) {
        *self.latest_action.lock().unwrap() = format!("{}: {}", method, url);
        self.action_counter.fetch_add(1, Ordering::Relaxed);
    }

    async fn fetch(&self, peer: &Peer, key: &str, timeout: Duration) -> StageOutcome {
        self.cache_hit.store(false, Ordering::Relaxed);
        let url = peer.url(&format!("/{}/{}", self.region, key));
        self.set_action("GET", &url);
        match self.http.get(&url).timeout(timeout).send().await {
            Ok(response) if response.status() == StatusCode::OK => match response.bytes().await {
                Ok(bytes) => {
                    self.cache_hit.store(true, Ordering::Relaxed);
                    StageOutcome::Hit(bytes)
                }
                Err(e) => {
                    debug!(%url, %e, "body read failed");
                    StageOutcome::Unreachable
                }
            },
            Ok(_) => StageOutcome::Miss,
            Err(e) => {
                debug!(%url, %e, "get stage failed");
                StageOutcome::Unreachable
            }
        }
    }

    async fn write(
        &self,
        peer: &Peer,
        key: &str,
        value: &Bytes,
        expiry_seconds: u64,
        timeout: Duration,
    ) -> StageOutcome {
        let url = peer.url(&format!("/{}/{}?expiry={}", self.region, key, expiry_seconds));
        self.set_action("PUT", &url);
        match self
            .http
            .put(&url)
            .body(value.clone())
            .timeout(timeout)
            .send()
            .await
        {
            // Status is deliberately not inspected; a completed call is a
            // completed write as far as failover is concerned.
            Ok(_) => StageOutcome::Done,
            Err(e) => {
                debug!(%url, %e, "put stage failed");
                StageOutcome::Unreachable
            }
        }
    }

    async fn erase(&self, peer: &Peer, key: &str, timeout: Duration) -> StageOutcome {
        let url = peer.url(&format!("/{}/{}", self.region, key));
        self.set_action("DELETE", &url);
        match self.http.delete(&url).timeout(timeout).send().await {
            Ok(_) => StageOutcome::Done,
            Err(e) => {
                debug!(%url, %e, "delete stage failed");
                StageOutcome::Unreachable
            }
        }
    }

    /// Pick the peer for one stage of the walk.
    ///
    /// Selection is lazy: the round-robin cursor only advances when a stage
    /// is actually reached, so a call that succeeds at stage 1 leaves the
    /// next peer for the next call. Stage 2 yields nothing when the cursor
    /// came straight back to the stage-1 peer.
    fn select_stage_peer(&self, stage: usize, first: &mut Option<Peer>) -> Option<Peer> {
        match stage {
            0 => {
                *first = self.next_local_peer();
                first.clone()
            }
            1 => {
                let second = self.next_local_peer()?;
                if first.as_ref().is_some_and(|f| f.name == second.name) {
                    None
                } else {
                    Some(second)
                }
            }
            _ => self.random_foreign_peer(stage - 2),
        }
    }

    pub async fn get(&self, key: &str) -> Option<Bytes> {
        let timeouts = [
            LOCAL_TIMEOUT,
            LOCAL_TIMEOUT,
            GET_FOREIGN_TIMEOUT,
            GET_FOREIGN_TIMEOUT,
        ];
        let mut first = None;
        for (stage, timeout) in timeouts.into_iter().enumerate() {
            let Some(peer) = self.select_stage_peer(stage, &mut first) else {
                continue;
            };
            if let StageOutcome::Hit(bytes) = self.fetch(&peer, key, timeout).await {
                return Some(bytes);
            }
        }
        None
    }

    pub async fn put(&self, key: &str, value: impl Into<Bytes>, expiry_seconds: u64) -> bool {
        let value = value.into();
        let timeouts = [
            LOCAL_TIMEOUT,
            LOCAL_TIMEOUT,
            WRITE_RANK0_TIMEOUT,
            WRITE_RANK1_TIMEOUT,
        ];
        let mut first = None;
        for (stage, timeout) in timeouts.into_iter().enumerate() {
            let Some(peer) = self.select_stage_peer(stage, &mut first) else {
                continue;
            };
            if let StageOutcome::Done =
                self.write(&peer, key, &value, expiry_seconds, timeout).await
            {
                return true;
            }
        }
        false
    }

    pub async fn delete(&self, key: &str) -> bool {
        let timeouts = [
            LOCAL_TIMEOUT,
            LOCAL_TIMEOUT,
            WRITE_RANK0_TIMEOUT,
            WRITE_RANK1_TIMEOUT,
        ];
        let mut first = None;
        for (stage, timeout) in timeouts.into_iter().enumerate() {
            let Some(peer) = self.select_stage_peer(stage, &mut first) else {
                continue;
            };
            if let StageOutcome::Done = self.erase(&peer, key, timeout).await {
                return true;
            }
        }
        false
    }
}

// ---------------------------------------------------------------------------
// Process-wide client registry
// ---------------------------------------------------------------------------

static GLOBAL_REGISTRY: Lazy<ClientRegistry> = Lazy::new(ClientRegistry::default);

/// One client per region, process-wide, so call sites (and the memoization
/// wrapper in particular) share latency state and the round-robin cursor.
///
/// The discovery backend is installable; when none has been installed the
/// first `get_or_create` brings up the mDNS daemon.
#[derive(Default)]
pub struct ClientRegistry {
    discovery: Mutex<Option<Arc<dyn Discovery>>>,
    clients: DashMap<String, Arc<CacheClient>>,
}

impl ClientRegistry {
    pub fn global() -> &'static ClientRegistry {
        &GLOBAL_REGISTRY
    }

    /// Install the discovery backend new clients will subscribe to. Existing
    /// clients keep their subscription; tests clear their regions first.
    pub fn install_discovery(&self, discovery: Arc<dyn Discovery>) {
        *self.discovery.lock().unwrap() = Some(discovery);
    }

    pub fn get_or_create(&self, region: &str) -> Result<Arc<CacheClient>> {
        if let Some(client) = self.clients.get(region) {
            return Ok(Arc::clone(&client));
        }
        let discovery = {
            let mut guard = self.discovery.lock().unwrap();
            match guard.as_ref() {
                Some(d) => Arc::clone(d),
                None => {
                    let d: Arc<dyn Discovery> = Arc::new(MdnsDiscovery::new()?);
                    *guard = Some(Arc::clone(&d));
                    d
                }
            }
        };
        let client = Arc::new(CacheClient::new(region, discovery.as_ref()));
        Ok(Arc::clone(
            &self
                .clients
                .entry(region.to_string())
                .or_insert(client),
        ))
    }

    pub fn clear(&self, region: &str) {
        self.clients.remove(region);
    }
}
