//! Server-side fan-out: a mutation addressed to a region converges to every
//! peer of that region and one peer per foreign region, while `recurse=0`
//! pins it to a single node.

mod common;

use serial_test::serial;
use std::time::Duration;

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn writes_converge_across_the_region_and_one_hop_beyond() {
    let hub = geocache::DiscoveryHub::new();
    let local_a = common::spawn_node(&hub, 15061, "local", false).await;
    let local_b = common::spawn_node(&hub, 15062, "local", false).await;
    let east = common::spawn_node(&hub, 15071, "east", false).await;
    let west = common::spawn_node(&hub, 15072, "west", false).await;
    tokio::time::sleep(Duration::from_millis(1500)).await;

    let http = reqwest::Client::new();

    // write to one local node; the fan-out happens before the response
    let put = http
        .put(common::node_url(15061, "/local/foo?expiry=60"))
        .body("bar")
        .send()
        .await
        .unwrap();
    assert_eq!(put.status(), 200);

    // sibling holds it in its own-region store
    let at_sibling = http
        .get(common::node_url(15062, "/local/foo"))
        .send()
        .await
        .unwrap();
    assert_eq!(at_sibling.status(), 200);
    assert_eq!(at_sibling.bytes().await.unwrap().as_ref(), b"bar");

    // each single-peer foreign region holds it in its foreign store
    for port in [15071, 15072] {
        let at_foreign = http
            .get(common::node_url(port, "/local/foo"))
            .send()
            .await
            .unwrap();
        assert_eq!(at_foreign.status(), 200, "port {}", port);
        assert_eq!(at_foreign.bytes().await.unwrap().as_ref(), b"bar");
    }

    // a delete issued at the sibling clears the whole constellation
    let del = http
        .delete(common::node_url(15062, "/local/foo"))
        .send()
        .await
        .unwrap();
    assert_eq!(del.status(), 200);
    for port in [15061, 15062, 15071, 15072] {
        let gone = http
            .get(common::node_url(port, "/local/foo"))
            .send()
            .await
            .unwrap();
        assert_eq!(gone.status(), 404, "port {}", port);
    }

    for node in [local_a, local_b, east, west] {
        node.stop().await;
    }
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn recurse_zero_affects_exactly_one_node() {
    let hub = geocache::DiscoveryHub::new();
    let local_a = common::spawn_node(&hub, 15063, "local", false).await;
    let local_b = common::spawn_node(&hub, 15064, "local", false).await;
    tokio::time::sleep(Duration::from_millis(1000)).await;

    let http = reqwest::Client::new();

    // replica-marked write stays on its node
    http.put(common::node_url(15063, "/local/solo?expiry=60&recurse=0"))
        .body("v")
        .send()
        .await
        .unwrap();
    let here = http
        .get(common::node_url(15063, "/local/solo"))
        .send()
        .await
        .unwrap();
    assert_eq!(here.status(), 200);
    let there = http
        .get(common::node_url(15064, "/local/solo"))
        .send()
        .await
        .unwrap();
    assert_eq!(there.status(), 404);

    // replica-marked delete removes from one node only
    http.put(common::node_url(15063, "/local/both?expiry=60"))
        .body("v")
        .send()
        .await
        .unwrap();
    http.delete(common::node_url(15063, "/local/both?recurse=0"))
        .send()
        .await
        .unwrap();
    let gone = http
        .get(common::node_url(15063, "/local/both"))
        .send()
        .await
        .unwrap();
    assert_eq!(gone.status(), 404);
    let kept = http
        .get(common::node_url(15064, "/local/both"))
        .send()
        .await
        .unwrap();
    assert_eq!(kept.status(), 200);

    local_a.stop().await;
    local_b.stop().await;
}
