//! Staged failover under synthetic latency: two local nodes, two foreign
//! regions of two nodes each. Nodes are broken one region at a time by
//! injecting extra per-request latency, and the client is expected to walk
//! local round-robin -> nearest foreign -> second foreign -> exhaustion.
//!
//! With these region names the synthetic brackets come out as `local` ~100 ms,
//! `elsewhere` ~100 ms, and `somewhere` ~300 ms, so `elsewhere` (ports 1502x)
//! ranks ahead of `somewhere` (ports 1501x).

mod common;

use geocache::ClientRegistry;
use serial_test::serial;
use std::time::Duration;

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn network_fallback_scenarios() {
    let hub = geocache::DiscoveryHub::new();
    let registry = ClientRegistry::global();
    registry.clear("local");
    registry.install_discovery(hub.clone());
    let client = registry.get_or_create("local").unwrap();

    let mut nodes = Vec::new();
    for (port, region) in [
        (15001, "local"),
        (15002, "local"),
        (15011, "somewhere"),
        (15012, "somewhere"),
        (15021, "elsewhere"),
        (15022, "elsewhere"),
    ] {
        nodes.push(common::spawn_node(&hub, port, region, true).await);
    }
    // let discovery and the per-peer probes settle
    tokio::time::sleep(Duration::from_secs(3)).await;

    // principal item of interest
    assert!(client.put("foo", &b"bar"[..], 60).await);

    // fodder for deletion
    for key in ["a", "b", "c", "d", "e"] {
        assert!(client.put(key, key.as_bytes(), 60).await);
    }
    tokio::time::sleep(Duration::from_secs(1)).await;

    // both local servers take turns answering
    client.get("foo").await;
    let first_action = client.latest_action();
    assert!(first_action.contains(":1500"), "{}", first_action);
    client.get("foo").await;
    let second_action = client.latest_action();
    assert!(second_action.contains(":1500"), "{}", second_action);
    assert_ne!(first_action, second_action);

    assert!(client.delete("a").await);

    // break the first local server; the second keeps answering
    common::inject_extra_latency(15001, 3.0).await;
    tokio::time::sleep(Duration::from_millis(500)).await;
    client.get("foo").await;
    assert!(client.latest_action().contains(":15002"), "{}", client.latest_action());
    client.get("foo").await;
    assert!(client.latest_action().contains(":15002"), "{}", client.latest_action());

    assert!(client.delete("b").await);

    // break the second local server; the nearest foreign region takes over
    common::inject_extra_latency(15002, 3.0).await;
    tokio::time::sleep(Duration::from_millis(500)).await;
    let counted_before = client.action_counter();
    let value = client.get("foo").await;
    assert!(client.action_counter() > counted_before);
    assert_eq!(value.as_deref(), Some(&b"bar"[..]));
    assert!(client.latest_action().contains(":1502"), "{}", client.latest_action());
    client.get("foo").await;
    assert!(client.latest_action().contains(":1502"), "{}", client.latest_action());

    assert!(client.delete("c").await);

    // break the nearest foreign region; the second-nearest takes over
    common::inject_extra_latency(15021, 3.0).await;
    common::inject_extra_latency(15022, 3.0).await;
    tokio::time::sleep(Duration::from_millis(500)).await;
    client.get("foo").await;
    assert!(client.latest_action().contains(":1501"), "{}", client.latest_action());
    client.get("foo").await;
    assert!(client.latest_action().contains(":1501"), "{}", client.latest_action());

    assert!(client.delete("d").await);

    // break everything; operations exhaust all four stages
    common::inject_extra_latency(15011, 3.0).await;
    common::inject_extra_latency(15012, 3.0).await;
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(client.get("foo").await, None);
    assert!(!client.cache_hit());
    assert!(!client.delete("e").await);

    registry.clear("local");
    for node in nodes {
        node.stop().await;
    }
}
