//! gatemesh integration test harness.
//!
//! Every test builds a small in-process cluster on loopback: each node
//! gets a real overlay listener, a real TCP transport and, when asked, a
//! real HTTP server. Nodes bind port 0, so tests can run in parallel.

mod gateway;
mod heartbeat;
mod join;

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::broadcast;

use gatemesh_api::ApiState;
use gatemesh_core::NodeId;
use gatemesh_services::host::FixedHost;
use gatemesh_services::{
    Balancer, Collector, NetworkCore, NetworkSettings, PeerDirectory, PeerState, TcpTransport,
    Weights,
};

// ── Harness ───────────────────────────────────────────────────────────────────

pub const WINDOW: Duration = Duration::from_secs(60);
pub const GRACE: Duration = Duration::from_secs(120);

pub struct NodeSpec {
    pub id: &'static str,
    pub max_peers: usize,
    pub cpu: f64,
    /// Local backend body. `None` = relay only.
    pub backend: Option<&'static str>,
    /// Advertise `0.0.0.0` instead of the bound loopback host.
    pub unspecified_host: bool,
}

impl NodeSpec {
    pub fn new(id: &'static str) -> Self {
        Self {
            id,
            max_peers: 8,
            cpu: 10.0,
            backend: None,
            unspecified_host: false,
        }
    }

    pub fn max_peers(mut self, n: usize) -> Self {
        self.max_peers = n;
        self
    }

    pub fn cpu(mut self, cpu: f64) -> Self {
        self.cpu = cpu;
        self
    }

    pub fn backend(mut self, body: &'static str) -> Self {
        self.backend = Some(body);
        self
    }

    pub fn unspecified_host(mut self) -> Self {
        self.unspecified_host = true;
        self
    }
}

pub struct Node {
    pub core: Arc<NetworkCore>,
    /// Dialable overlay address.
    pub overlay_addr: String,
    /// Dialable HTTP address.
    pub http_addr: String,
    shutdown: broadcast::Sender<()>,
}

impl Node {
    pub fn id(&self) -> NodeId {
        self.core.local_id().clone()
    }

    pub fn state_of(&self, other: &Node) -> Option<PeerState> {
        self.core.directory().state_of(&other.id())
    }

    pub fn knows(&self, other: &Node) -> bool {
        self.core.directory().contains(&other.id())
    }

    /// Stop the overlay listener, its connections and the HTTP server.
    pub fn stop(&self) {
        let _ = self.shutdown.send(());
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.stop();
    }
}

pub async fn spawn_node(spec: NodeSpec) -> Result<Node> {
    let overlay = TcpListener::bind("127.0.0.1:0").await?;
    let overlay_addr = overlay.local_addr()?.to_string();
    let http = TcpListener::bind("127.0.0.1:0").await?;
    let http_addr = http.local_addr()?.to_string();

    let advertise = |addr: &str| match addr.rsplit_once(':') {
        Some((_, port)) if spec.unspecified_host => format!("0.0.0.0:{port}"),
        _ => addr.to_string(),
    };

    let id = NodeId::from(spec.id);
    let collector = Arc::new(
        Collector::new(id.clone(), advertise(&http_addr), WINDOW, Weights::default()).with_host(
            FixedHost {
                cpu: spec.cpu,
                memory: 0.0,
            },
        ),
    );
    let directory = Arc::new(PeerDirectory::new(id, advertise(&overlay_addr), spec.max_peers));
    let core = Arc::new(NetworkCore::new(
        collector.clone(),
        directory.clone(),
        Arc::new(TcpTransport::new(Duration::from_secs(2))),
        NetworkSettings {
            window: WINDOW,
            stale_grace: GRACE,
            behind_nat: false,
            punch_timeout: Duration::from_secs(1),
        },
    ));

    let (shutdown, _) = broadcast::channel(1);
    tokio::spawn(gatemesh_services::serve(overlay, core.clone(), shutdown.subscribe()));

    let mut state = ApiState::new(collector, directory, Balancer::new(0.1))
        .with_relay_timeout(Duration::from_secs(2));
    if let Some(body) = spec.backend {
        state = state.with_local(Router::new().fallback(move || async move { body }));
    }
    let app = gatemesh_api::router(state);
    let mut stop = shutdown.subscribe();
    tokio::spawn(async move {
        let _ = axum::serve(http, app)
            .with_graceful_shutdown(async move {
                let _ = stop.recv().await;
            })
            .await;
    });

    Ok(Node {
        core,
        overlay_addr,
        http_addr,
        shutdown,
    })
}

/// Poll `check` until it holds or `timeout` passes.
pub async fn wait_until(timeout: Duration, check: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

pub async fn http_get(node: &Node, path: &str) -> Result<(u16, String)> {
    let resp = reqwest::get(format!("http://{}{}", node.http_addr, path)).await?;
    let status = resp.status().as_u16();
    Ok((status, resp.text().await?))
}

pub async fn api_json(node: &Node, path: &str) -> Result<serde_json::Value> {
    let (_, body) = http_get(node, &format!("/api{path}")).await?;
    Ok(serde_json::from_str(&body)?)
}
