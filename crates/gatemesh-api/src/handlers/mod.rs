//! HTTP API handlers: exposes overlay state as JSON.

pub mod peers;
pub mod status;

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::Router;

use gatemesh_services::{Balancer, Collector, PeerDirectory};

#[derive(Clone)]
pub struct ApiState {
    pub collector: Arc<Collector>,
    pub directory: Arc<PeerDirectory>,
    pub balancer: Balancer,
    /// Client used to relay requests to peers.
    pub http: reqwest::Client,
    pub relay_timeout: Duration,
    /// Serves requests that stay on this node. `None` = relay only.
    pub local: Option<Router>,
    pub started: Instant,
}

impl ApiState {
    pub fn new(collector: Arc<Collector>, directory: Arc<PeerDirectory>, balancer: Balancer) -> Self {
        Self {
            collector,
            directory,
            balancer,
            http: reqwest::Client::new(),
            relay_timeout: Duration::from_secs(10),
            local: None,
            started: Instant::now(),
        }
    }

    pub fn with_local(mut self, local: Router) -> Self {
        self.local = Some(local);
        self
    }

    pub fn with_relay_timeout(mut self, timeout: Duration) -> Self {
        self.relay_timeout = timeout;
        self
    }
}
