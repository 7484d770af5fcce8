use std::time::Duration;

use gatemesh_services::PeerState;

use crate::{spawn_node, wait_until, NodeSpec};

#[tokio::test]
async fn joiner_fans_out_to_the_whole_mesh() {
    let a = spawn_node(NodeSpec::new("node-a")).await.unwrap();
    let b = spawn_node(NodeSpec::new("node-b")).await.unwrap();
    let c = spawn_node(NodeSpec::new("node-c")).await.unwrap();

    assert!(b.core.join(&a.overlay_addr).await.is_joined());
    let outcome = c.core.join(&a.overlay_addr).await;
    assert_eq!(outcome.connected.len(), 2, "{outcome:?}");

    for (x, y) in [(&a, &b), (&a, &c), (&b, &c)] {
        assert_eq!(x.state_of(y), Some(PeerState::Connected), "{} -> {}", x.id(), y.id());
        assert_eq!(y.state_of(x), Some(PeerState::Connected), "{} -> {}", y.id(), x.id());
    }
}

#[tokio::test]
async fn full_seed_redirects_to_alternatives() {
    let a = spawn_node(NodeSpec::new("full-a").max_peers(1)).await.unwrap();
    let b = spawn_node(NodeSpec::new("full-b")).await.unwrap();
    let c = spawn_node(NodeSpec::new("full-c")).await.unwrap();

    assert!(b.core.join(&a.overlay_addr).await.is_joined());
    let outcome = c.core.join(&a.overlay_addr).await;

    assert_eq!(outcome.connected, vec![b.id()]);
    assert!(!a.knows(&c));
    assert!(c.knows(&b));
    assert!(!c.knows(&a));
    assert_eq!(b.state_of(&c), Some(PeerState::Connected));
}

#[tokio::test]
async fn second_join_through_known_peers_terminates() {
    let a = spawn_node(NodeSpec::new("loop-a")).await.unwrap();
    let b = spawn_node(NodeSpec::new("loop-b")).await.unwrap();

    assert!(b.core.join(&a.overlay_addr).await.is_joined());
    // Rejoining walks a -> b again; both are already known.
    let again = tokio::time::timeout(Duration::from_secs(5), b.core.join(&a.overlay_addr))
        .await
        .expect("join walk must terminate");
    assert!(again.failures.is_empty(), "{again:?}");
    assert_eq!(a.core.directory().len(), 1);
    assert_eq!(b.core.directory().len(), 1);
}

#[tokio::test]
async fn joining_a_dead_seed_reports_failure() {
    let a = spawn_node(NodeSpec::new("dead-a")).await.unwrap();
    let seed = a.overlay_addr.clone();
    a.stop();
    drop(a);
    tokio::time::sleep(Duration::from_millis(50)).await;

    let b = spawn_node(NodeSpec::new("dead-b")).await.unwrap();
    let outcome = b.core.join(&seed).await;
    assert!(!outcome.is_joined());
    assert_eq!(outcome.failures.len(), 1);
    assert!(b.core.directory().is_empty());
}

#[tokio::test]
async fn leave_removes_node_everywhere() {
    let a = spawn_node(NodeSpec::new("leave-a")).await.unwrap();
    let b = spawn_node(NodeSpec::new("leave-b")).await.unwrap();
    let c = spawn_node(NodeSpec::new("leave-c")).await.unwrap();
    b.core.join(&a.overlay_addr).await;
    c.core.join(&a.overlay_addr).await;

    c.core.leave().await;

    assert!(wait_until(Duration::from_secs(2), || !a.knows(&c) && !b.knows(&c)).await);
    assert!(a.knows(&b));
}
