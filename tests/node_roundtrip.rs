//! Single-node end-to-end behavior: the transport surface, PUT/GET/DELETE
//! round trips through the client, and entry expiry.

mod common;

use geocache::{CacheInfo, ClientRegistry, DiscoveryHub};
use serial_test::serial;
use std::time::Duration;

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn put_then_get_roundtrip_expiry_and_delete() {
    let hub = DiscoveryHub::new();
    let registry = ClientRegistry::global();
    registry.clear("local");
    registry.install_discovery(hub.clone());

    let node = common::spawn_node(&hub, 15001, "local", true).await;
    let client = registry.get_or_create("local").unwrap();
    tokio::time::sleep(Duration::from_secs(2)).await;

    // happy path
    assert!(client.put("foo", &b"bar"[..], 60).await);
    let value = client.get("foo").await;
    assert_eq!(value.as_deref(), Some(&b"bar"[..]));
    assert!(client.cache_hit());

    // entries vanish after their expiry
    assert!(client.put("fleeting", &b"soon gone"[..], 1).await);
    tokio::time::sleep(Duration::from_millis(1100)).await;
    assert_eq!(client.get("fleeting").await, None);
    assert!(!client.cache_hit());

    // put; delete; get is a miss
    assert!(client.put("doomed", &b"x"[..], 60).await);
    assert!(client.delete("doomed").await);
    assert_eq!(client.get("doomed").await, None);

    registry.clear("local");
    node.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn transport_surface_speaks_the_wire_format() {
    let hub = DiscoveryHub::new();
    let node = common::spawn_node(&hub, 15031, "local", false).await;
    let http = reqwest::Client::new();

    let pong = http
        .get(common::node_url(15031, "/ping"))
        .send()
        .await
        .unwrap();
    assert_eq!(pong.status(), 200);
    assert_eq!(pong.text().await.unwrap(), "pong");

    // raw PUT lands in the own-region store
    let put = http
        .put(common::node_url(15031, "/local/foo?expiry=60&recurse=0"))
        .body("bar")
        .send()
        .await
        .unwrap();
    assert_eq!(put.status(), 200);

    let get = http
        .get(common::node_url(15031, "/local/foo"))
        .send()
        .await
        .unwrap();
    assert_eq!(get.status(), 200);
    assert_eq!(get.bytes().await.unwrap().as_ref(), b"bar");

    // an unknown key under a foreign region label is a foreign-store miss
    let miss = http
        .get(common::node_url(15031, "/elsewhere/foo"))
        .send()
        .await
        .unwrap();
    assert_eq!(miss.status(), 404);

    // a DELETE on a missing key reports not-found
    let missing_delete = http
        .delete(common::node_url(15031, "/local/nothing?recurse=0"))
        .send()
        .await
        .unwrap();
    assert_eq!(missing_delete.status(), 404);

    let local: CacheInfo = http
        .get(common::node_url(15031, "/local_cache_info"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(local.maxsize, 1024);
    assert_eq!(local.hits, 1);
    // only lookups touch the counters; the not-found DELETE does not
    assert_eq!(local.misses, 0);

    let foreign: CacheInfo = http
        .get(common::node_url(15031, "/remote_cache_info"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(foreign.maxsize, 4096);
    assert_eq!(foreign.hits, 0);
    assert_eq!(foreign.misses, 1);

    // malformed expiry falls back to the default instead of failing
    let put = http
        .put(common::node_url(15031, "/local/odd?expiry=abc&recurse=0"))
        .body("v")
        .send()
        .await
        .unwrap();
    assert_eq!(put.status(), 200);
    let get = http
        .get(common::node_url(15031, "/local/odd"))
        .send()
        .await
        .unwrap();
    assert_eq!(get.status(), 200);

    node.stop().await;
}
