//! Peer selection and the local-vs-forward routing decision.

use serde::Serialize;

use gatemesh_core::NodeId;

use crate::directory::PeerDirectory;
use crate::metrics::{Collector, Score};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "target", content = "node_id", rename_all = "lowercase")]
pub enum Selection {
    /// No Connected peer; serve here.
    Local,
    Peer(NodeId),
}

/// Score of every Connected peer, ordered best first. Equal totals are
/// ordered by node id.
pub fn ranked_peers(directory: &PeerDirectory, collector: &Collector) -> Vec<(NodeId, Score)> {
    let local = directory.local_id();
    let mut ranked: Vec<(NodeId, Score)> = directory
        .connected_peers()
        .into_iter()
        .filter(|p| &p.node_id != local)
        .map(|p| {
            let score = collector.calculate_score(&p.node_id);
            (p.node_id, score)
        })
        .collect();
    ranked.sort_by(|(a_id, a), (b_id, b)| a.total.total_cmp(&b.total).then_with(|| a_id.cmp(b_id)));
    ranked
}

/// Pick the Connected peer with the lowest score. Never returns the local
/// node and never returns a peer that is not Connected.
pub fn select_peer(directory: &PeerDirectory, collector: &Collector) -> Selection {
    match ranked_peers(directory, collector).into_iter().next() {
        Some((id, _)) => Selection::Peer(id),
        None => Selection::Local,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RouteDecision {
    Local,
    Forward {
        node_id: NodeId,
        /// The peer's HTTP address as reported in its metrics.
        address: String,
    },
}

/// Decides whether an inbound HTTP request is served here or relayed.
#[derive(Debug, Clone, Copy)]
pub struct Balancer {
    threshold: f64,
}

impl Balancer {
    pub fn new(threshold: f64) -> Self {
        Self {
            threshold: threshold.max(0.0),
        }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Forward only when the best peer beats the local score by more than
    /// the threshold and has reported an address to forward to. Requests
    /// already relayed by a peer are always served here, so a request is
    /// forwarded at most once.
    pub fn route(&self, directory: &PeerDirectory, collector: &Collector, from_peer: bool) -> RouteDecision {
        if from_peer {
            return RouteDecision::Local;
        }
        let Some((node_id, best)) = ranked_peers(directory, collector).into_iter().next() else {
            return RouteDecision::Local;
        };
        let local = collector.local_score();
        if local.total - best.total <= self.threshold {
            return RouteDecision::Local;
        }
        match collector.metrics_for(&node_id) {
            Some(m) if !m.address.is_empty() => {
                tracing::debug!(
                    peer = %node_id,
                    local = local.total,
                    remote = best.total,
                    "forwarding to less loaded peer"
                );
                RouteDecision::Forward {
                    node_id,
                    address: m.address,
                }
            }
            _ => RouteDecision::Local,
        }
    }
}
