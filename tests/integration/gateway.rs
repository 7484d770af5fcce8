use std::time::Duration;

use crate::{api_json, http_get, spawn_node, NodeSpec};

#[tokio::test]
async fn busy_node_relays_to_idle_peer() {
    let busy = spawn_node(NodeSpec::new("gw-busy").cpu(100.0).backend("served-by-busy"))
        .await
        .unwrap();
    let idle = spawn_node(NodeSpec::new("gw-idle").cpu(0.0).backend("served-by-idle"))
        .await
        .unwrap();
    idle.core.join(&busy.overlay_addr).await;
    busy.core.heartbeat_once().await;

    let (status, body) = http_get(&busy, "/hello").await.unwrap();
    assert_eq!(status, 200);
    assert_eq!(body, "served-by-idle");

    // The idle node knows the busy one is worse and serves its own traffic.
    let (status, body) = http_get(&idle, "/hello").await.unwrap();
    assert_eq!(status, 200);
    assert_eq!(body, "served-by-idle");

    let select = api_json(&busy, "/select").await.unwrap();
    assert_eq!(select["selection"]["node_id"], "gw-idle");
}

#[tokio::test]
async fn failed_relay_falls_back_to_local_backend() {
    let busy = spawn_node(NodeSpec::new("fb-busy").cpu(100.0).backend("served-by-busy"))
        .await
        .unwrap();
    let idle = spawn_node(NodeSpec::new("fb-idle").cpu(0.0).backend("served-by-idle"))
        .await
        .unwrap();
    idle.core.join(&busy.overlay_addr).await;
    busy.core.heartbeat_once().await;

    idle.stop();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let (status, body) = http_get(&busy, "/hello").await.unwrap();
    assert_eq!(status, 200);
    assert_eq!(body, "served-by-busy");
}

#[tokio::test]
async fn relay_only_node_forwards_or_reports_unavailable() {
    let relay = spawn_node(NodeSpec::new("ro-relay")).await.unwrap();

    let (status, _) = http_get(&relay, "/hello").await.unwrap();
    assert_eq!(status, 503);

    let worker = spawn_node(NodeSpec::new("ro-worker").cpu(90.0).backend("served-by-worker"))
        .await
        .unwrap();
    worker.core.join(&relay.overlay_addr).await;
    relay.core.heartbeat_once().await;

    // No local backend: any Connected peer beats 503, whatever its load.
    let (status, body) = http_get(&relay, "/hello").await.unwrap();
    assert_eq!(status, 200);
    assert_eq!(body, "served-by-worker");
}

#[tokio::test]
async fn api_routes_are_never_relayed() {
    let busy = spawn_node(NodeSpec::new("api-busy").cpu(100.0).backend("served-by-busy"))
        .await
        .unwrap();
    let idle = spawn_node(NodeSpec::new("api-idle").cpu(0.0)).await.unwrap();
    idle.core.join(&busy.overlay_addr).await;
    busy.core.heartbeat_once().await;

    let status = api_json(&busy, "/status").await.unwrap();
    assert_eq!(status["node_id"], "api-busy");
    assert_eq!(status["peers"]["connected"], 1);
    assert_eq!(status["local_backend"], true);
}
