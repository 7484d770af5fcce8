//! /peers, /scores and /select handlers.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;

use gatemesh_core::NodeId;
use gatemesh_services::balancer::{ranked_peers, select_peer, RouteDecision, Selection};
use gatemesh_services::{PeerEntry, PeerState, Score};

use super::ApiState;

#[derive(Serialize)]
pub struct PeerView {
    pub node_id: String,
    pub address: String,
    pub state: PeerState,
    pub last_seen_secs: u64,
    pub stale_secs: Option<u64>,
    /// Relay target from the peer's latest metrics.
    pub http_addr: Option<String>,
    pub rtt_ms: Option<f64>,
    pub score: f64,
}

fn view(state: &ApiState, entry: PeerEntry) -> PeerView {
    let id = &entry.info.node_id;
    PeerView {
        node_id: id.to_string(),
        address: entry.info.address.clone(),
        state: entry.state,
        last_seen_secs: entry.last_seen.elapsed().as_secs(),
        stale_secs: entry.stale_since.map(|t| t.elapsed().as_secs()),
        http_addr: state.collector.metrics_for(id).map(|m| m.address),
        rtt_ms: state
            .collector
            .latency_for(id)
            .map(|d| d.as_secs_f64() * 1000.0),
        score: state.collector.calculate_score(id).total,
    }
}

// ── /peers ────────────────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct PeersResponse {
    pub peers: Vec<PeerView>,
}

pub async fn handle_peers(State(state): State<ApiState>) -> Json<PeersResponse> {
    let peers = state
        .directory
        .snapshot()
        .into_iter()
        .map(|entry| view(&state, entry))
        .collect();
    Json(PeersResponse { peers })
}

// ── /peers/{id} (GET) ─────────────────────────────────────────────────────────

pub async fn handle_peer_inspect(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Json<PeerView>, (StatusCode, String)> {
    let entry = state
        .directory
        .get(&NodeId::from(id))
        .ok_or((StatusCode::NOT_FOUND, "peer not found".to_string()))?;
    Ok(Json(view(&state, entry)))
}

// ── /peers/{id} (DELETE) ──────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct PeerDropResponse {
    pub node_id: String,
    pub address: String,
}

pub async fn handle_peer_drop(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Json<PeerDropResponse>, (StatusCode, String)> {
    let removed = state
        .directory
        .remove(&NodeId::from(id))
        .map_err(|kind| (StatusCode::NOT_FOUND, kind.to_string()))?;
    tracing::info!(peer = %removed.node_id, "peer dropped via API");
    Ok(Json(PeerDropResponse {
        node_id: removed.node_id.to_string(),
        address: removed.address,
    }))
}

// ── /scores ───────────────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct ScoredPeer {
    pub node_id: String,
    pub score: Score,
}

#[derive(Serialize)]
pub struct ScoresResponse {
    pub local: Score,
    /// Connected peers, best first.
    pub peers: Vec<ScoredPeer>,
}

pub async fn handle_scores(State(state): State<ApiState>) -> Json<ScoresResponse> {
    let peers = ranked_peers(&state.directory, &state.collector)
        .into_iter()
        .map(|(id, score)| ScoredPeer {
            node_id: id.to_string(),
            score,
        })
        .collect();
    Json(ScoresResponse {
        local: state.collector.local_score(),
        peers,
    })
}

// ── /select ───────────────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct SelectResponse {
    /// Best Connected peer, regardless of threshold.
    pub selection: Selection,
    /// Where a request arriving now would run.
    pub route: String,
}

pub async fn handle_select(State(state): State<ApiState>) -> Json<SelectResponse> {
    let selection = select_peer(&state.directory, &state.collector);
    let route = match state.balancer.route(&state.directory, &state.collector, false) {
        RouteDecision::Local => "local".to_string(),
        RouteDecision::Forward { node_id, .. } => node_id.to_string(),
    };
    Json(SelectResponse { selection, route })
}
