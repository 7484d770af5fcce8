//! Metrics collector: windowed local load statistics, the latest
//! snapshot reported by every peer, and the score used for peer selection.
//!
//! All mutable state sits behind one reader/writer lock per collector.
//! Reads (`collect_local_metrics`, `calculate_score`) share it, mutations
//! take it exclusively. Nothing performs I/O while holding it.

use std::collections::HashMap;
use std::time::{Duration, SystemTime};

use parking_lot::RwLock;
use serde::Serialize;
use uuid::Uuid;

use gatemesh_core::config::WeightsConfig;
use gatemesh_core::{NodeId, NodeMetrics};

use crate::host::{HostStats, SystemHost};

/// Score coefficients, fixed after startup.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Weights {
    pub cpu: f64,
    pub memory: f64,
    pub rps: f64,
    pub latency: f64,
}

impl Default for Weights {
    fn default() -> Self {
        WeightsConfig::default().into()
    }
}

impl From<WeightsConfig> for Weights {
    fn from(w: WeightsConfig) -> Self {
        Self {
            cpu: w.cpu,
            memory: w.memory,
            rps: w.rps,
            latency: w.latency,
        }
    }
}

/// Composite load score. Lower is better.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Score {
    pub cpu: f64,
    pub memory: f64,
    pub rps: f64,
    pub latency: f64,
    pub total: f64,
}

impl Score {
    /// Score for a node with no known metrics: maximally loaded.
    pub fn unknown() -> Self {
        Self {
            cpu: 1.0,
            memory: 1.0,
            rps: 1.0,
            latency: 1.0,
            total: 1.0,
        }
    }

    /// `cpu/100`, `memory/100`, `min(rps/1000, 1)`, `min(latency_ms/1000, 1)`,
    /// weighted and summed.
    pub fn from_metrics(metrics: &NodeMetrics, latency: Duration, weights: &Weights) -> Self {
        let cpu = metrics.cpu_usage / 100.0;
        let memory = metrics.memory_usage / 100.0;
        let rps = (metrics.requests_per_sec / 1000.0).min(1.0);
        let latency_ms = latency.as_secs_f64() * 1000.0;
        let latency = (latency_ms / 1000.0).min(1.0);
        let total = cpu * weights.cpu
            + memory * weights.memory
            + rps * weights.rps
            + latency * weights.latency;
        Self {
            cpu,
            memory,
            rps,
            latency,
            total,
        }
    }
}

/// An in-flight API call.
#[derive(Debug, Clone)]
pub struct Request {
    pub id: String,
    pub start_time: SystemTime,
    pub end_time: Option<SystemTime>,
    pub method: String,
    pub path: String,
    /// Relayed to us by another gateway node.
    pub from_peer: bool,
}

impl Request {
    /// A request starting now, with a fresh unique id.
    pub fn new(method: impl Into<String>, path: impl Into<String>, from_peer: bool) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            start_time: SystemTime::now(),
            end_time: None,
            method: method.into(),
            path: path.into(),
            from_peer,
        }
    }
}

/// Completed request, as retained by the sliding window.
#[derive(Debug, Clone)]
pub struct RequestStat {
    pub path: String,
    pub duration: Duration,
    pub is_error: bool,
    /// Completion time.
    pub timestamp: SystemTime,
}

#[derive(Default)]
struct CollectorState {
    active: HashMap<String, Request>,
    history: Vec<RequestStat>,
    peers: HashMap<NodeId, NodeMetrics>,
    latencies: HashMap<NodeId, Duration>,
}

/// Per-node metrics collector.
pub struct Collector {
    node_id: NodeId,
    /// Public HTTP address reported in our snapshots.
    address: String,
    window: Duration,
    weights: Weights,
    host: Box<dyn HostStats>,
    state: RwLock<CollectorState>,
}

impl Collector {
    pub fn new(node_id: NodeId, address: impl Into<String>, window: Duration, weights: Weights) -> Self {
        Self {
            node_id,
            address: address.into(),
            window,
            weights,
            host: Box::new(SystemHost),
            state: RwLock::new(CollectorState::default()),
        }
    }

    /// Replace the host probe.
    pub fn with_host(mut self, host: impl HostStats + 'static) -> Self {
        self.host = Box::new(host);
        self
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn weights(&self) -> Weights {
        self.weights
    }

    // ── Request lifecycle ─────────────────────────────────────────────────

    /// Register an active request. A second start with the same id
    /// overwrites the first.
    pub fn start_request(&self, req: Request) {
        self.state.write().active.insert(req.id.clone(), req);
    }

    /// Complete an active request. Unknown ids are ignored, which covers
    /// double completion and completion after a restart.
    pub fn finish_request(&self, id: &str, is_error: bool) {
        self.finish_request_at(id, is_error, SystemTime::now());
    }

    fn finish_request_at(&self, id: &str, is_error: bool, now: SystemTime) {
        let mut state = self.state.write();
        let Some(mut req) = state.active.remove(id) else {
            tracing::trace!(request_id = id, "finish for unknown request ignored");
            return;
        };
        req.end_time = Some(now);
        let duration = now.duration_since(req.start_time).unwrap_or_default();
        state.history.push(RequestStat {
            path: req.path,
            duration,
            is_error,
            timestamp: now,
        });
        self.cleanup(&mut state, now);
    }

    // ── Local metrics ─────────────────────────────────────────────────────

    /// Snapshot of this node's load over the trailing window.
    pub fn collect_local_metrics(&self) -> NodeMetrics {
        self.collect_at(SystemTime::now())
    }

    fn collect_at(&self, now: SystemTime) -> NodeMetrics {
        // Host probes are syscalls; read them before taking the lock.
        let cpu_usage = self.host.cpu_usage();
        let memory_usage = self.host.memory_usage();

        let state = self.state.read();
        let mut requests = 0usize;
        let mut errors = 0usize;
        let mut total_latency = Duration::ZERO;
        for stat in state.history.iter().filter(|s| self.in_window(s.timestamp, now)) {
            requests += 1;
            total_latency += stat.duration;
            if stat.is_error {
                errors += 1;
            }
        }

        let (error_rate, average_latency_ms) = if requests == 0 {
            (0.0, 0.0)
        } else {
            (
                errors as f64 / requests as f64 * 100.0,
                total_latency.as_secs_f64() * 1000.0 / requests as f64,
            )
        };

        NodeMetrics {
            node_id: self.node_id.clone(),
            address: self.address.clone(),
            cpu_usage,
            memory_usage,
            requests_per_sec: requests as f64 / self.window.as_secs_f64(),
            average_latency_ms,
            active_requests: state.active.len() as u64,
            error_rate,
            timestamp: to_millis(now),
        }
    }

    /// `timestamp` lies in `[now - window, now]`.
    fn in_window(&self, timestamp: SystemTime, now: SystemTime) -> bool {
        now.duration_since(timestamp)
            .map(|age| age <= self.window)
            .unwrap_or(false)
    }

    // ── Peer metrics ──────────────────────────────────────────────────────

    /// Record a peer's latest snapshot and our last observed round trip
    /// to it.
    pub fn update_node_metrics(&self, metrics: NodeMetrics, latency: Duration) {
        if metrics.node_id == self.node_id {
            return;
        }
        let mut state = self.state.write();
        state.latencies.insert(metrics.node_id.clone(), latency);
        state.peers.insert(metrics.node_id.clone(), metrics);
        self.cleanup(&mut state, SystemTime::now());
    }

    /// Latest snapshot for a node, if one is held.
    pub fn metrics_for(&self, node_id: &NodeId) -> Option<NodeMetrics> {
        self.state.read().peers.get(node_id).cloned()
    }

    pub fn latency_for(&self, node_id: &NodeId) -> Option<Duration> {
        self.state.read().latencies.get(node_id).copied()
    }

    /// All peer snapshots currently held.
    pub fn peer_metrics(&self) -> Vec<NodeMetrics> {
        self.state.read().peers.values().cloned().collect()
    }

    /// Score a peer from its latest snapshot. A node with no snapshot
    /// scores [`Score::unknown`].
    pub fn calculate_score(&self, node_id: &NodeId) -> Score {
        let state = self.state.read();
        match state.peers.get(node_id) {
            Some(metrics) => {
                let latency = state.latencies.get(node_id).copied().unwrap_or_default();
                Score::from_metrics(metrics, latency, &self.weights)
            }
            None => Score::unknown(),
        }
    }

    /// Score this node from freshly collected metrics, using its own
    /// average request latency as the latency component.
    pub fn local_score(&self) -> Score {
        let metrics = self.collect_local_metrics();
        let latency = Duration::from_secs_f64(metrics.average_latency_ms / 1000.0);
        Score::from_metrics(&metrics, latency, &self.weights)
    }

    // ── Introspection ─────────────────────────────────────────────────────

    pub fn active_count(&self) -> usize {
        self.state.read().active.len()
    }

    pub fn history_len(&self) -> usize {
        self.state.read().history.len()
    }

    /// Drop history entries and peer snapshots that fell out of the
    /// window. Runs after every mutation; also called by the heartbeat so
    /// an idle node still ages out peers.
    pub fn purge_expired(&self) {
        let mut state = self.state.write();
        self.cleanup(&mut state, SystemTime::now());
    }

    fn cleanup(&self, state: &mut CollectorState, now: SystemTime) {
        let cutoff = now.checked_sub(self.window).unwrap_or(SystemTime::UNIX_EPOCH);
        state.history.retain(|s| s.timestamp >= cutoff);

        let cutoff_ms = to_millis(cutoff);
        let before = state.peers.len();
        state.peers.retain(|_, m| m.timestamp >= cutoff_ms);
        if state.peers.len() != before {
            let CollectorState {
                peers, latencies, ..
            } = state;
            latencies.retain(|id, _| peers.contains_key(id));
            tracing::debug!(removed = before - peers.len(), "purged stale peer metrics");
        }
    }
}

fn to_millis(t: SystemTime) -> u64 {
    t.duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Build a snapshot stamped now.
#[cfg(test)]
pub(crate) fn snapshot(node_id: &str, cpu: f64, memory: f64, rps: f64, latency_ms: f64) -> NodeMetrics {
    NodeMetrics {
        node_id: NodeId::from(node_id),
        address: String::new(),
        cpu_usage: cpu,
        memory_usage: memory,
        requests_per_sec: rps,
        average_latency_ms: latency_ms,
        active_requests: 0,
        error_rate: 0.0,
        timestamp: to_millis(SystemTime::now()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gatemesh_core::unix_millis;
    use crate::host::FixedHost;
    use std::sync::Arc;

    const WINDOW: Duration = Duration::from_secs(60);

    fn collector() -> Collector {
        Collector::new(NodeId::from("local"), "127.0.0.1:8080", WINDOW, Weights::default())
            .with_host(FixedHost {
                cpu: 10.0,
                memory: 20.0,
            })
    }

    fn request_started(at: SystemTime) -> Request {
        Request {
            start_time: at,
            ..Request::new("GET", "/status", false)
        }
    }

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn active_requests_tracks_unfinished() {
        let c = collector();
        let ids: Vec<String> = (0..5)
            .map(|_| {
                let req = Request::new("GET", "/a", false);
                let id = req.id.clone();
                c.start_request(req);
                id
            })
            .collect();
        assert_eq!(c.collect_local_metrics().active_requests, 5);

        c.finish_request(&ids[0], false);
        c.finish_request(&ids[3], true);
        assert_eq!(c.collect_local_metrics().active_requests, 3);

        // Starting the same id again overwrites rather than duplicates.
        c.start_request(Request {
            id: ids[1].clone(),
            ..Request::new("POST", "/b", true)
        });
        assert_eq!(c.collect_local_metrics().active_requests, 3);

        for id in &ids {
            c.finish_request(id, false);
        }
        assert_eq!(c.collect_local_metrics().active_requests, 0);
    }

    #[test]
    fn double_finish_is_a_noop() {
        let c = collector();
        let req = Request::new("GET", "/x", false);
        let id = req.id.clone();
        c.start_request(req);

        c.finish_request(&id, false);
        c.finish_request(&id, true);

        assert_eq!(c.history_len(), 1);
        assert_eq!(c.collect_local_metrics().error_rate, 0.0);
    }

    #[test]
    fn finish_for_unknown_id_is_ignored() {
        let c = collector();
        c.finish_request("never-started", true);
        assert_eq!(c.history_len(), 0);
        assert_eq!(c.active_count(), 0);
    }

    #[test]
    fn old_history_does_not_count() {
        let c = collector();
        let now = SystemTime::now();

        // Completed 1s ago, took 1s.
        let fresh = request_started(now - Duration::from_secs(2));
        let fresh_id = fresh.id.clone();
        c.start_request(fresh);
        c.finish_request_at(&fresh_id, false, now - Duration::from_secs(1));

        // Completed 125s ago with an error. Its own cleanup pass runs at
        // that earlier instant, so it is still held in history.
        let old = request_started(now - Duration::from_secs(130));
        let old_id = old.id.clone();
        c.start_request(old);
        c.finish_request_at(&old_id, true, now - Duration::from_secs(125));
        assert_eq!(c.history_len(), 2);

        let m = c.collect_at(now);
        assert!(approx(m.requests_per_sec, 1.0 / 60.0));
        assert_eq!(m.error_rate, 0.0);
        assert!(approx(m.average_latency_ms, 1000.0));
    }

    #[test]
    fn cleanup_purges_history_outside_window() {
        let c = collector();
        let now = SystemTime::now();

        let old = request_started(now - Duration::from_secs(200));
        let old_id = old.id.clone();
        c.start_request(old);
        c.finish_request_at(&old_id, false, now - Duration::from_secs(190));
        assert_eq!(c.history_len(), 1);

        // Any later mutation purges it.
        let req = request_started(now);
        let id = req.id.clone();
        c.start_request(req);
        c.finish_request_at(&id, false, now);
        assert_eq!(c.history_len(), 1);
    }

    #[test]
    fn error_rate_and_latency_over_window() {
        let c = collector();
        let now = SystemTime::now();
        for (i, is_error) in [false, true, false, true].into_iter().enumerate() {
            let req = request_started(now - Duration::from_millis(100 * (i as u64 + 1)));
            let id = req.id.clone();
            c.start_request(req);
            c.finish_request_at(&id, is_error, now);
        }

        let m = c.collect_at(now);
        assert!(approx(m.error_rate, 50.0));
        // 100 + 200 + 300 + 400 ms over 4 requests.
        assert!(approx(m.average_latency_ms, 250.0));
        assert!(approx(m.requests_per_sec, 4.0 / 60.0));
        assert_eq!(m.cpu_usage, 10.0);
        assert_eq!(m.memory_usage, 20.0);
        assert_eq!(m.node_id, NodeId::from("local"));
    }

    #[test]
    fn empty_window_reports_zeroes() {
        let m = collector().collect_local_metrics();
        assert_eq!(m.requests_per_sec, 0.0);
        assert_eq!(m.error_rate, 0.0);
        assert_eq!(m.average_latency_ms, 0.0);
        assert_eq!(m.active_requests, 0);
    }

    #[test]
    fn unknown_node_scores_one() {
        let c = collector();
        let score = c.calculate_score(&NodeId::from("nobody"));
        assert_eq!(score.total, 1.0);
        assert_eq!(score, Score::unknown());
    }

    #[test]
    fn reference_scenario_scores_0_475() {
        let c = collector();
        c.update_node_metrics(
            snapshot("node-a", 80.0, 40.0, 500.0, 200.0),
            Duration::from_millis(200),
        );

        let score = c.calculate_score(&NodeId::from("node-a"));
        assert!(approx(score.cpu, 0.8));
        assert!(approx(score.memory, 0.4));
        assert!(approx(score.rps, 0.5));
        assert!(approx(score.latency, 0.2));
        assert!(approx(score.total, 0.475));
    }

    #[test]
    fn rps_and_latency_components_saturate() {
        let m = snapshot("n", 0.0, 0.0, 50_000.0, 0.0);
        let score = Score::from_metrics(&m, Duration::from_secs(30), &Weights::default());
        assert_eq!(score.rps, 1.0);
        assert_eq!(score.latency, 1.0);
        assert!(approx(score.total, 0.5));
    }

    #[test]
    fn increasing_any_component_never_lowers_total() {
        let weights = Weights {
            cpu: 0.4,
            memory: 0.1,
            rps: 0.3,
            latency: 0.2,
        };
        let base = snapshot("n", 30.0, 30.0, 300.0, 0.0);
        let base_latency = Duration::from_millis(300);
        let base_total = Score::from_metrics(&base, base_latency, &weights).total;

        for step in [1.0, 10.0, 100.0, 10_000.0] {
            let mut m = base.clone();
            m.cpu_usage += step;
            assert!(Score::from_metrics(&m, base_latency, &weights).total >= base_total);

            let mut m = base.clone();
            m.memory_usage += step;
            assert!(Score::from_metrics(&m, base_latency, &weights).total >= base_total);

            let mut m = base.clone();
            m.requests_per_sec += step;
            assert!(Score::from_metrics(&m, base_latency, &weights).total >= base_total);

            let latency = base_latency + Duration::from_millis(step as u64);
            assert!(Score::from_metrics(&base, latency, &weights).total >= base_total);
        }
    }

    #[test]
    fn stale_peer_snapshot_is_purged() {
        let c = collector();
        let mut old = snapshot("old", 10.0, 10.0, 1.0, 1.0);
        old.timestamp = unix_millis() - 2 * WINDOW.as_millis() as u64;
        c.update_node_metrics(old, Duration::from_millis(5));

        assert!(c.metrics_for(&NodeId::from("old")).is_none());
        assert!(c.latency_for(&NodeId::from("old")).is_none());
        assert_eq!(c.calculate_score(&NodeId::from("old")).total, 1.0);

        c.update_node_metrics(snapshot("fresh", 10.0, 10.0, 1.0, 1.0), Duration::ZERO);
        assert!(c.metrics_for(&NodeId::from("fresh")).is_some());
        assert_eq!(c.peer_metrics().len(), 1);
    }

    #[test]
    fn update_replaces_snapshot_wholesale() {
        let c = collector();
        c.update_node_metrics(snapshot("p", 90.0, 90.0, 900.0, 0.0), Duration::from_millis(900));
        c.update_node_metrics(snapshot("p", 10.0, 10.0, 100.0, 0.0), Duration::from_millis(100));

        let m = c.metrics_for(&NodeId::from("p")).unwrap();
        assert_eq!(m.cpu_usage, 10.0);
        assert_eq!(c.latency_for(&NodeId::from("p")), Some(Duration::from_millis(100)));
    }

    #[test]
    fn own_snapshot_is_not_stored_as_peer() {
        let c = collector();
        c.update_node_metrics(snapshot("local", 1.0, 1.0, 1.0, 1.0), Duration::ZERO);
        assert!(c.metrics_for(&NodeId::from("local")).is_none());
    }

    #[test]
    fn local_score_uses_host_and_history() {
        let c = collector();
        let score = c.local_score();
        assert!(approx(score.cpu, 0.1));
        assert!(approx(score.memory, 0.2));
        assert_eq!(score.rps, 0.0);
        assert_eq!(score.latency, 0.0);
        assert!(approx(score.total, 0.075));
    }

    #[test]
    fn concurrent_lifecycle_settles_to_zero_active() {
        let c = Arc::new(collector());
        let workers: Vec<_> = (0..8)
            .map(|_| {
                let c = c.clone();
                std::thread::spawn(move || {
                    for i in 0..200 {
                        let req = Request::new("GET", "/load", false);
                        let id = req.id.clone();
                        c.start_request(req);
                        let _ = c.collect_local_metrics();
                        c.finish_request(&id, i % 10 == 0);
                    }
                })
            })
            .collect();
        for w in workers {
            w.join().unwrap();
        }

        assert_eq!(c.active_count(), 0);
        assert_eq!(c.history_len(), 1600);
        let m = c.collect_local_metrics();
        assert!(approx(m.error_rate, 10.0));
    }
}
