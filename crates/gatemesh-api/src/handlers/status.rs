//! /status and /metrics handlers.

use axum::extract::State;
use axum::Json;
use serde::Serialize;

use gatemesh_core::NodeMetrics;
use gatemesh_services::{PeerState, Score};

use super::ApiState;

// ── /status ──────────────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct StatusResponse {
    pub node_id: String,
    pub overlay_addr: String,
    pub http_addr: String,
    pub uptime_secs: u64,
    pub peers: PeerCounts,
    pub active_requests: usize,
    pub local_score: Score,
    pub score_threshold: f64,
    pub local_backend: bool,
}

#[derive(Serialize)]
pub struct PeerCounts {
    pub connected: usize,
    pub stale: usize,
    pub joining: usize,
    pub max: usize,
}

pub async fn handle_status(State(state): State<ApiState>) -> Json<StatusResponse> {
    let mut peers = PeerCounts {
        connected: 0,
        stale: 0,
        joining: 0,
        max: state.directory.max_peers(),
    };
    for entry in state.directory.snapshot() {
        match entry.state {
            PeerState::Connected => peers.connected += 1,
            PeerState::Stale => peers.stale += 1,
            PeerState::Joining => peers.joining += 1,
        }
    }

    Json(StatusResponse {
        node_id: state.collector.node_id().to_string(),
        overlay_addr: state.directory.local_addr().to_string(),
        http_addr: state.collector.address().to_string(),
        uptime_secs: state.started.elapsed().as_secs(),
        peers,
        active_requests: state.collector.active_count(),
        local_score: state.collector.local_score(),
        score_threshold: state.balancer.threshold(),
        local_backend: state.local.is_some(),
    })
}

// ── /metrics ─────────────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct MetricsResponse {
    pub local: NodeMetrics,
    pub peers: Vec<NodeMetrics>,
}

pub async fn handle_metrics(State(state): State<ApiState>) -> Json<MetricsResponse> {
    let mut peers = state.collector.peer_metrics();
    peers.sort_by(|a, b| a.node_id.cmp(&b.node_id));
    Json(MetricsResponse {
        local: state.collector.collect_local_metrics(),
        peers,
    })
}
