//! Cache node: the HTTP transport surface, the server-side replication
//! fan-out, and the discovery registration lifecycle.
//!
//! A mutating request with `recurse=1` (the default) is echoed to every
//! other peer of this node's region with `recurse=0`. When the request
//! addresses this node's own region it is also sent to one random peer per
//! foreign region with `recurse` left at its default, so the receiving node
//! re-broadcasts inside its own region. One hop in-region, one hop out, no
//! storms.

use crate::cluster::ClusterView;
use crate::config::NodeConfig;
use crate::discovery::{random_service_name, Discovery, ServiceAdvert};
use crate::error::Result;
use crate::store::{clamp_expiry, CacheInfo, RegionStores};
use axum::body::Bytes;
use axum::extract::{Path, Query, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use futures::future::join_all;
use rand::Rng;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

/// Per-hop deadline for every replication call.
const REPLICATION_TIMEOUT: Duration = Duration::from_millis(500);

/// Registration retry backoff: starts immediate, grows linearly, capped.
const REGISTRATION_BACKOFF_STEP: Duration = Duration::from_millis(250);
const REGISTRATION_BACKOFF_CEILING: Duration = Duration::from_secs(5);

/// Synthetic latency profile for test nodes.
///
/// The base delay is derived from the region name so that all nodes of one
/// region share a latency bracket: `(md5(region)[0..4] % 5) * 100` ms plus a
/// per-node 30-60 ms offset, fixed at construction. `extra_latency` can be
/// raised at runtime through `POST /extra_latency` to simulate a node going
/// bad.
pub struct TestProfile {
    base_latency_ms: u64,
    extra_latency_ms: AtomicU64,
}

impl TestProfile {
    pub fn for_region(region: &str) -> Self {
        let digest = format!("{:x}", md5::compute(region.as_bytes()));
        let bracket = u64::from(u16::from_str_radix(&digest[0..4], 16).unwrap_or(0)) % 5;
        let base_latency_ms = bracket * 100 + rand::rng().random_range(3u64..=6) * 10;
        info!(%region, bracket, base_latency_ms, "synthetic latency profile");
        Self {
            base_latency_ms,
            extra_latency_ms: AtomicU64::new(0),
        }
    }

    pub fn base_latency_ms(&self) -> u64 {
        self.base_latency_ms
    }

    pub fn set_extra_latency(&self, seconds: f64) {
        let ms = (seconds.max(0.0) * 1000.0) as u64;
        self.extra_latency_ms.store(ms, Ordering::Relaxed);
    }

    async fn delay(&self) {
        let jitter = rand::rng().random_range(0u64..=10);
        let total =
            self.base_latency_ms + jitter + self.extra_latency_ms.load(Ordering::Relaxed);
        sleep(Duration::from_millis(total)).await;
    }
}

struct NodeState {
    config: NodeConfig,
    service_name: String,
    stores: RegionStores,
    cluster: Arc<ClusterView>,
    http: reqwest::Client,
    transport_running: AtomicBool,
    registered: AtomicBool,
    test_profile: Option<TestProfile>,
}

/// A serving cache node. Construction wires the discovery event driver;
/// `serve`/`run` bind the transport and keep the registration lifecycle.
pub struct CacheNode {
    state: Arc<NodeState>,
    discovery: Arc<dyn Discovery>,
}

impl CacheNode {
    pub fn new(config: NodeConfig, discovery: Arc<dyn Discovery>) -> Self {
        let service_name = random_service_name();
        let cluster = ClusterView::new(config.region.clone());
        cluster.spawn_driver(discovery.subscribe());
        let test_profile = config
            .test_node
            .then(|| TestProfile::for_region(&config.region));
        let stores = RegionStores::new(config.region.clone());
        let state = Arc::new(NodeState {
            config,
            service_name,
            stores,
            cluster,
            http: reqwest::Client::new(),
            transport_running: AtomicBool::new(false),
            registered: AtomicBool::new(false),
            test_profile,
        });
        Self { state, discovery }
    }

    pub fn service_name(&self) -> &str {
        &self.state.service_name
    }

    pub fn region(&self) -> &str {
        &self.state.config.region
    }

    pub fn cluster(&self) -> &Arc<ClusterView> {
        &self.state.cluster
    }

    /// The advertisement this node publishes. Test nodes expose their
    /// synthetic base latency so harnesses can reason about expected
    /// rankings.
    pub fn advert(&self) -> ServiceAdvert {
        let config = &self.state.config;
        let mut advert = ServiceAdvert::new(
            &self.state.service_name,
            config.bind_address,
            config.port,
            &config.region,
        );
        if let Some(profile) = &self.state.test_profile {
            advert = advert
                .with_property("test_server", "true")
                .with_property("test_latency", profile.base_latency_ms());
        }
        advert
    }

    /// Serve until `shutdown` resolves. The advertisement is withdrawn on
    /// the way out regardless of how the serve loop ended.
    pub async fn serve(&self, shutdown: impl std::future::Future<Output = ()> + Send + 'static) -> Result<()> {
        let config = &self.state.config;
        let addr = SocketAddr::new(config.bind_address, config.port);
        let listener = tokio::net::TcpListener::bind(addr).await?;
        info!(
            %addr,
            region = %config.region,
            name = %self.state.service_name,
            "cache node listening"
        );
        self.state.transport_running.store(true, Ordering::SeqCst);
        self.spawn_registration();

        let app = build_router(Arc::clone(&self.state));
        let result = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await;
        self.state.transport_running.store(false, Ordering::SeqCst);
        unregister(&self.state, self.discovery.as_ref());
        result.map_err(Into::into)
    }

    /// Serve until SIGTERM, SIGQUIT, SIGHUP, or ctrl-c, unregistering from
    /// discovery before the transport loop winds down.
    pub async fn run(&self) -> Result<()> {
        let state = Arc::clone(&self.state);
        let discovery = Arc::clone(&self.discovery);
        let shutdown = async move {
            wait_for_shutdown_signal().await;
            info!("shutdown signal received");
            unregister(&state, discovery.as_ref());
        };
        self.serve(shutdown).await
    }

    /// Retry registering with discovery until the transport is up: initial
    /// delay 0, +250 ms per retry, 5 s ceiling.
    fn spawn_registration(&self) {
        let state = Arc::clone(&self.state);
        let discovery = Arc::clone(&self.discovery);
        let advert = self.advert();
        tokio::spawn(async move {
            let mut delay = Duration::ZERO;
            loop {
                if state.transport_running.load(Ordering::SeqCst) {
                    match discovery.advertise(&advert) {
                        Ok(()) => {
                            state.registered.store(true, Ordering::SeqCst);
                            info!(name = %advert.name, "registered with service discovery");
                            break;
                        }
                        Err(e) => warn!(%e, "service registration failed, retrying"),
                    }
                }
                sleep(delay).await;
                delay = (delay + REGISTRATION_BACKOFF_STEP).min(REGISTRATION_BACKOFF_CEILING);
            }
        });
    }
}

fn unregister(state: &NodeState, discovery: &dyn Discovery) {
    if state.registered.swap(false, Ordering::SeqCst) {
        if let Err(e) = discovery.withdraw(&state.service_name) {
            warn!(%e, "failed to withdraw service advertisement");
        } else {
            info!(name = %state.service_name, "withdrew service advertisement");
        }
    }
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        async fn recv_or_pending(sig: Option<tokio::signal::unix::Signal>) {
            match sig {
                Some(mut sig) => {
                    sig.recv().await;
                }
                None => std::future::pending().await,
            }
        }

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = recv_or_pending(signal(SignalKind::terminate()).ok()) => {}
            _ = recv_or_pending(signal(SignalKind::quit()).ok()) => {}
            _ = recv_or_pending(signal(SignalKind::hangup()).ok()) => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

// ---------------------------------------------------------------------------
// Transport surface
// ---------------------------------------------------------------------------

fn build_router(state: Arc<NodeState>) -> Router {
    let mut router = Router::new()
        .route("/ping", get(handle_ping))
        .route("/local_cache_info", get(handle_local_cache_info))
        .route("/remote_cache_info", get(handle_remote_cache_info))
        .route(
            "/{region}/{key}",
            get(handle_get).put(handle_put).delete(handle_delete),
        );
    if state.test_profile.is_some() {
        router = router.route("/extra_latency", post(handle_extra_latency));
    }
    router
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            synthetic_delay,
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn synthetic_delay(
    State(state): State<Arc<NodeState>>,
    request: Request,
    next: Next,
) -> Response {
    if let Some(profile) = &state.test_profile {
        profile.delay().await;
    }
    next.run(request).await
}

async fn handle_ping() -> &'static str {
    "pong"
}

async fn handle_get(
    State(state): State<Arc<NodeState>>,
    Path((region, key)): Path<(String, String)>,
) -> Response {
    match state.stores.lookup(&region, &key).await {
        Some(bytes) => (StatusCode::OK, bytes).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn handle_put(
    State(state): State<Arc<NodeState>>,
    Path((region, key)): Path<(String, String)>,
    Query(params): Query<HashMap<String, String>>,
    body: Bytes,
) -> StatusCode {
    let expiry = clamp_expiry(params.get("expiry").map(String::as_str));
    debug!(%region, %key, expiry, "put");
    state.stores.store(&region, &key, body.clone(), expiry).await;
    if fan_out_enabled(&params) {
        fan_out(&state, &region, &key, FanOut::Put { body, expiry }).await;
    }
    StatusCode::OK
}

async fn handle_delete(
    State(state): State<Arc<NodeState>>,
    Path((region, key)): Path<(String, String)>,
    Query(params): Query<HashMap<String, String>>,
) -> StatusCode {
    let found = state.stores.remove(&region, &key).await;
    debug!(%region, %key, found, "delete");
    if fan_out_enabled(&params) {
        fan_out(&state, &region, &key, FanOut::Delete).await;
    }
    if found {
        StatusCode::OK
    } else {
        StatusCode::NOT_FOUND
    }
}

async fn handle_local_cache_info(State(state): State<Arc<NodeState>>) -> Json<CacheInfo> {
    Json(state.stores.local_info())
}

async fn handle_remote_cache_info(State(state): State<Arc<NodeState>>) -> Json<CacheInfo> {
    Json(state.stores.foreign_info())
}

async fn handle_extra_latency(
    State(state): State<Arc<NodeState>>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let seconds = params
        .get("seconds")
        .and_then(|s| s.parse::<f64>().ok())
        .unwrap_or(0.0);
    match &state.test_profile {
        Some(profile) => {
            profile.set_extra_latency(seconds);
            info!(seconds, "extra latency set");
            (StatusCode::OK, "ok\n").into_response()
        }
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// Fan-out runs unless the request carries `recurse` with a value other
/// than `1`. `recurse=0` is the replica marker.
fn fan_out_enabled(params: &HashMap<String, String>) -> bool {
    params.get("recurse").map_or(true, |v| v == "1")
}

// ---------------------------------------------------------------------------
// Replication engine
// ---------------------------------------------------------------------------

#[derive(Clone)]
enum FanOut {
    Put { body: Bytes, expiry: u64 },
    Delete,
}

/// Echo a mutation to the rest of the cluster, best effort.
///
/// Same-region siblings get the mutation with `recurse=0`. When the request
/// addresses this node's own region, one random peer per foreign region gets
/// it with `recurse` left at default so it replicates within its region.
/// Every call runs under the per-hop deadline; failures are logged and
/// swallowed.
async fn fan_out(state: &NodeState, region: &str, key: &str, mutation: FanOut) {
    let own_region = &state.config.region;
    let expiry_param = match &mutation {
        FanOut::Put { expiry, .. } => format!("&expiry={}", expiry),
        FanOut::Delete => String::new(),
    };

    let mut urls = Vec::new();
    for peer in state.cluster.local_peers() {
        if peer.name == state.service_name {
            continue;
        }
        urls.push(peer.url(&format!("/{}/{}?recurse=0{}", region, key, expiry_param)));
    }

    if region == own_region {
        let cross_param = match &mutation {
            FanOut::Put { expiry, .. } => format!("?expiry={}", expiry),
            FanOut::Delete => String::new(),
        };
        for (other_region, peers) in state.cluster.directory().snapshot() {
            if other_region == *own_region || peers.is_empty() {
                continue;
            }
            let peer = &peers[rand::rng().random_range(0..peers.len())];
            urls.push(peer.url(&format!("/{}/{}{}", region, key, cross_param)));
        }
    }

    let calls = urls.into_iter().map(|url| {
        let http = state.http.clone();
        let mutation = mutation.clone();
        async move {
            let request = match mutation {
                FanOut::Put { body, .. } => http.put(&url).body(body),
                FanOut::Delete => http.delete(&url),
            };
            match request.timeout(REPLICATION_TIMEOUT).send().await {
                Ok(_) => debug!(%url, "fan-out delivered"),
                Err(e) => debug!(%url, %e, "fan-out failed"),
            }
        }
    });
    join_all(calls).await;
}
