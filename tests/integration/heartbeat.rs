use std::time::{Duration, Instant};

use gatemesh_services::{select_peer, PeerState, Selection};

use crate::{api_json, http_get, spawn_node, NodeSpec, GRACE, WINDOW};

#[tokio::test]
async fn heartbeat_exchanges_metrics_both_ways() {
    let a = spawn_node(NodeSpec::new("hb-a").cpu(20.0)).await.unwrap();
    let b = spawn_node(NodeSpec::new("hb-b").cpu(80.0)).await.unwrap();
    b.core.join(&a.overlay_addr).await;

    let report = a.core.heartbeat_once().await;
    assert_eq!((report.reached, report.failed), (1, 0));

    let seen_by_a = a.core.collector().metrics_for(&b.id()).unwrap();
    assert_eq!(seen_by_a.cpu_usage, 80.0);
    assert_eq!(seen_by_a.address, b.http_addr);
    assert!(a.core.collector().latency_for(&b.id()).is_some());

    let seen_by_b = b.core.collector().metrics_for(&a.id()).unwrap();
    assert_eq!(seen_by_b.cpu_usage, 20.0);
    assert_eq!(
        select_peer(b.core.directory(), b.core.collector()),
        Selection::Peer(a.id())
    );
}

#[tokio::test]
async fn metrics_are_visible_over_http() {
    let a = spawn_node(NodeSpec::new("hb-http-a")).await.unwrap();
    let b = spawn_node(NodeSpec::new("hb-http-b").cpu(55.0)).await.unwrap();
    b.core.join(&a.overlay_addr).await;
    a.core.heartbeat_once().await;

    let metrics = api_json(&a, "/metrics").await.unwrap();
    assert_eq!(metrics["local"]["node_id"], "hb-http-a");
    assert_eq!(metrics["peers"][0]["node_id"], "hb-http-b");
    assert_eq!(metrics["peers"][0]["cpu_usage"], 55.0);

    let peers = api_json(&a, "/peers").await.unwrap();
    assert_eq!(peers["peers"][0]["state"], "connected");
    assert_eq!(peers["peers"][0]["http_addr"], b.http_addr.as_str());
}

#[tokio::test]
async fn silent_peer_goes_stale_and_is_not_selected() {
    let a = spawn_node(NodeSpec::new("stale-a")).await.unwrap();
    let b = spawn_node(NodeSpec::new("stale-b")).await.unwrap();
    b.core.join(&a.overlay_addr).await;
    assert_eq!(b.core.heartbeat_once().await.reached, 1);
    assert_eq!(
        select_peer(b.core.directory(), b.core.collector()),
        Selection::Peer(a.id())
    );

    a.stop();
    tokio::time::sleep(Duration::from_millis(50)).await;
    let report = b.core.heartbeat_once().await;
    assert_eq!((report.reached, report.failed), (0, 1));

    let later = Instant::now() + WINDOW;
    b.core.directory().sweep_at(later, WINDOW, GRACE);
    assert_eq!(b.state_of(&a), Some(PeerState::Stale));
    assert_eq!(select_peer(b.core.directory(), b.core.collector()), Selection::Local);

    let status = api_json(&b, "/status").await.unwrap();
    assert_eq!(status["peers"]["stale"], 1);
    assert_eq!(status["peers"]["connected"], 0);

    b.core.directory().sweep_at(later + GRACE, WINDOW, GRACE);
    assert!(!b.knows(&a));
}

#[tokio::test]
async fn stale_peer_recovers_on_next_heartbeat() {
    let a = spawn_node(NodeSpec::new("revive-a")).await.unwrap();
    let b = spawn_node(NodeSpec::new("revive-b")).await.unwrap();
    b.core.join(&a.overlay_addr).await;

    b.core
        .directory()
        .sweep_at(Instant::now() + WINDOW, WINDOW, GRACE);
    assert_eq!(b.state_of(&a), Some(PeerState::Stale));

    // Stale peers are still pinged.
    assert_eq!(b.core.heartbeat_once().await.reached, 1);
    assert_eq!(b.state_of(&a), Some(PeerState::Connected));
}

#[tokio::test]
async fn unspecified_advertised_host_is_reachable_by_its_peers() {
    let a = spawn_node(NodeSpec::new("wild-a").cpu(100.0).backend("served-by-a"))
        .await
        .unwrap();
    let b = spawn_node(
        NodeSpec::new("wild-b")
            .cpu(0.0)
            .backend("served-by-b")
            .unspecified_host(),
    )
    .await
    .unwrap();
    assert!(b.core.local_addr().starts_with("0.0.0.0:"));

    assert!(b.core.join(&a.overlay_addr).await.is_joined());
    let stored = a.core.directory().get(&b.id()).unwrap();
    assert_eq!(stored.info.address, b.overlay_addr);

    let report = a.core.heartbeat_once().await;
    assert_eq!((report.reached, report.failed), (1, 0));
    let metrics = a.core.collector().metrics_for(&b.id()).unwrap();
    assert_eq!(metrics.address, b.http_addr);

    // The busy node relays to b through the observed address.
    let (status, body) = http_get(&a, "/hello").await.unwrap();
    assert_eq!(status, 200);
    assert_eq!(body, "served-by-b");
}
