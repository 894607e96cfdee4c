//! Service-discovery integration.
//!
//! The core consumes discovery as an event stream: `PeerEvent::Appeared`,
//! `Departed`, and `Updated`, delivered over an mpsc channel and applied to a
//! `ClusterView` by one driver task per consumer. Two backends implement the
//! `Discovery` trait:
//! - `MdnsDiscovery`: production, an mDNS daemon browsing and registering
//!   `_server._geocache._tcp.local.` services with TXT properties
//! - `DiscoveryHub`: in-memory, for tests and single-host setups

use crate::directory::Peer;
use crate::error::{CacheError, Result};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::IpAddr;
use std::sync::Mutex;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, error, warn};

/// mDNS service type all cache nodes advertise under.
pub const SERVICE_TYPE: &str = "_server._geocache._tcp.local.";

/// A node's self-description, as published to discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceAdvert {
    /// Full service instance name, e.g. `c0ffee42._server._geocache._tcp.local.`
    pub name: String,
    pub address: IpAddr,
    pub port: u16,
    pub properties: BTreeMap<String, String>,
}

impl ServiceAdvert {
    pub fn new(name: impl Into<String>, address: IpAddr, port: u16, region: &str) -> Self {
        let mut properties = BTreeMap::new();
        properties.insert("region".to_string(), region.to_string());
        Self {
            name: name.into(),
            address,
            port,
            properties,
        }
    }

    pub fn with_property(mut self, key: &str, value: impl ToString) -> Self {
        self.properties.insert(key.to_string(), value.to_string());
        self
    }

    /// The `region` property is required; an advert without it never becomes
    /// a peer.
    pub fn to_peer(&self) -> Option<Peer> {
        let region = self.properties.get("region")?.clone();
        Some(Peer {
            name: self.name.clone(),
            address: self.address,
            port: self.port,
            region,
            properties: self.properties.clone(),
        })
    }
}

/// Generate a fresh service instance name.
pub fn random_service_name() -> String {
    format!("{}.{}", hex::encode(rand::random::<[u8; 4]>()), SERVICE_TYPE)
}

/// One membership change, as seen by the discovery layer.
#[derive(Debug, Clone)]
pub enum PeerEvent {
    Appeared(Peer),
    Departed { name: String },
    /// Advisory; carries no state change.
    Updated { name: String },
}

/// The discovery transport, reduced to what the core needs: an event stream
/// plus advertise/withdraw for the serving side.
///
/// `subscribe` replays all currently-known peers to late subscribers, so a
/// consumer can attach at any time and still converge on the same view.
pub trait Discovery: Send + Sync {
    fn subscribe(&self) -> UnboundedReceiver<PeerEvent>;
    fn advertise(&self, advert: &ServiceAdvert) -> Result<()>;
    fn withdraw(&self, name: &str) -> Result<()>;
}

// ---------------------------------------------------------------------------
// In-memory hub
// ---------------------------------------------------------------------------

/// In-memory discovery: a shared hub through which adverts are broadcast to
/// every subscriber. Stands in for the mDNS daemon in tests.
#[derive(Default)]
pub struct DiscoveryHub {
    inner: Mutex<HubInner>,
}

#[derive(Default)]
struct HubInner {
    adverts: Vec<ServiceAdvert>,
    subscribers: Vec<UnboundedSender<PeerEvent>>,
}

impl DiscoveryHub {
    pub fn new() -> std::sync::Arc<Self> {
        std::sync::Arc::new(Self::default())
    }
}

impl HubInner {
    fn broadcast(&mut self, event: PeerEvent) {
        self.subscribers
            .retain(|tx| tx.send(event.clone()).is_ok());
    }
}

impl Discovery for DiscoveryHub {
    fn subscribe(&self) -> UnboundedReceiver<PeerEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock().unwrap();
        for advert in &inner.adverts {
            if let Some(peer) = advert.to_peer() {
                let _ = tx.send(PeerEvent::Appeared(peer));
            }
        }
        inner.subscribers.push(tx);
        rx
    }

    fn advertise(&self, advert: &ServiceAdvert) -> Result<()> {
        let peer = advert
            .to_peer()
            .ok_or_else(|| CacheError::Discovery("advert is missing the region property".into()))?;
        let mut inner = self.inner.lock().unwrap();
        inner.adverts.retain(|a| a.name != advert.name);
        inner.adverts.push(advert.clone());
        inner.broadcast(PeerEvent::Appeared(peer));
        Ok(())
    }

    fn withdraw(&self, name: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.adverts.retain(|a| a.name != name);
        inner.broadcast(PeerEvent::Departed {
            name: name.to_string(),
        });
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// mDNS backend
// ---------------------------------------------------------------------------

/// Production discovery over mDNS (`mdns-sd` daemon).
///
/// The daemon delivers browse events on its own thread via a flume channel; a
/// bridge task converts them into `PeerEvent`s. A repeat resolution of an
/// already-known instance maps to `Updated`.
pub struct MdnsDiscovery {
    daemon: mdns_sd::ServiceDaemon,
}

impl MdnsDiscovery {
    pub fn new() -> Result<Self> {
        Ok(Self {
            daemon: mdns_sd::ServiceDaemon::new()?,
        })
    }

    fn peer_from_info(info: &mdns_sd::ServiceInfo) -> Option<Peer> {
        let address = info.get_addresses().iter().next().copied()?;
        let mut properties = BTreeMap::new();
        for prop in info.get_properties().iter() {
            properties.insert(prop.key().to_string(), prop.val_str().to_string());
        }
        if !properties.contains_key("region") {
            warn!(name = %info.get_fullname(), "ignoring service without a region property");
            return None;
        }
        ServiceAdvert {
            name: info.get_fullname().to_string(),
            address,
            port: info.get_port(),
            properties,
        }
        .to_peer()
    }
}

impl Discovery for MdnsDiscovery {
    fn subscribe(&self) -> UnboundedReceiver<PeerEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let events = match self.daemon.browse(SERVICE_TYPE) {
            Ok(events) => events,
            Err(e) => {
                error!(%e, "mDNS browse failed; discovery stream will be empty");
                return rx;
            }
        };
        tokio::spawn(async move {
            let mut seen: HashSet<String> = HashSet::new();
            while let Ok(event) = events.recv_async().await {
                let mapped = match event {
                    mdns_sd::ServiceEvent::ServiceResolved(info) => {
                        let Some(peer) = Self::peer_from_info(&info) else {
                            continue;
                        };
                        if seen.insert(peer.name.clone()) {
                            PeerEvent::Appeared(peer)
                        } else {
                            PeerEvent::Updated { name: peer.name }
                        }
                    }
                    mdns_sd::ServiceEvent::ServiceRemoved(_, fullname) => {
                        seen.remove(&fullname);
                        PeerEvent::Departed { name: fullname }
                    }
                    other => {
                        debug!(?other, "ignoring mDNS browse event");
                        continue;
                    }
                };
                if tx.send(mapped).is_err() {
                    break;
                }
            }
        });
        rx
    }

    fn advertise(&self, advert: &ServiceAdvert) -> Result<()> {
        let instance = advert
            .name
            .strip_suffix(&format!(".{}", SERVICE_TYPE))
            .unwrap_or(&advert.name);
        let host_name = format!("{}.local.", instance);
        let properties: HashMap<String, String> = advert
            .properties
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let info = mdns_sd::ServiceInfo::new(
            SERVICE_TYPE,
            instance,
            &host_name,
            advert.address.to_string().as_str(),
            advert.port,
            properties,
        )?;
        self.daemon.register(info)?;
        Ok(())
    }

    fn withdraw(&self, name: &str) -> Result<()> {
        self.daemon.unregister(name)?;
        Ok(())
    }
}
