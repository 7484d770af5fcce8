//! Network core: join walk, inbound message dispatch and heartbeat.
//!
//! The core ties the collector and the directory to the transport. It
//! owns no state of its own beyond configuration; everything it learns
//! lands in one of those two components.

use std::collections::{HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::future::join_all;
use tokio::sync::broadcast;

use gatemesh_core::config::GatemeshConfig;
use gatemesh_core::wire::HEARTBEAT_DIVISOR;
use gatemesh_core::{
    unix_millis, ErrorKind, Heartbeat, JoinRequest, JoinResponse, Message, MessageType,
    NetworkError, NodeId, NodeMetrics, PeerInfo,
};

use crate::directory::{PeerDirectory, PeerState, Transition};
use crate::metrics::Collector;
use crate::nat;
use crate::transport::{MessageHandler, Transport};

#[derive(Debug, Clone)]
pub struct NetworkSettings {
    /// Sliding window; a peer silent this long goes Stale.
    pub window: Duration,
    pub stale_grace: Duration,
    pub behind_nat: bool,
    pub punch_timeout: Duration,
}

impl From<&GatemeshConfig> for NetworkSettings {
    fn from(config: &GatemeshConfig) -> Self {
        Self {
            window: config.window(),
            stale_grace: config.stale_grace(),
            behind_nat: config.nat.behind_nat,
            punch_timeout: config.punch_timeout(),
        }
    }
}

/// A join attempt that did not produce a connection.
#[derive(Debug)]
pub struct JoinFailure {
    pub address: String,
    pub error: NetworkError,
}

#[derive(Debug, Default)]
pub struct JoinOutcome {
    /// Peers now Connected as a result of the walk, in join order.
    pub connected: Vec<NodeId>,
    pub failures: Vec<JoinFailure>,
}

impl JoinOutcome {
    pub fn is_joined(&self) -> bool {
        !self.connected.is_empty()
    }

    fn fail(&mut self, address: &str, error: impl Into<NetworkError>) {
        let error = error.into();
        tracing::info!(peer = address, error = %error, "join attempt failed");
        self.failures.push(JoinFailure {
            address: address.to_string(),
            error,
        });
    }
}

#[derive(Debug, Default)]
pub struct HeartbeatReport {
    pub reached: usize,
    pub failed: usize,
    pub transitions: Vec<Transition>,
}

struct Candidate {
    node_id: Option<NodeId>,
    address: String,
}

pub struct NetworkCore {
    local: PeerInfo,
    settings: NetworkSettings,
    collector: Arc<Collector>,
    directory: Arc<PeerDirectory>,
    transport: Arc<dyn Transport>,
}

impl NetworkCore {
    pub fn new(
        collector: Arc<Collector>,
        directory: Arc<PeerDirectory>,
        transport: Arc<dyn Transport>,
        settings: NetworkSettings,
    ) -> Self {
        let local = PeerInfo::new(directory.local_id().clone(), directory.local_addr());
        Self {
            local,
            settings,
            collector,
            directory,
            transport,
        }
    }

    pub fn local_id(&self) -> &NodeId {
        &self.local.node_id
    }

    pub fn local_addr(&self) -> &str {
        &self.local.address
    }

    pub fn collector(&self) -> &Arc<Collector> {
        &self.collector
    }

    pub fn directory(&self) -> &Arc<PeerDirectory> {
        &self.directory
    }

    // ── Join walk ─────────────────────────────────────────────────────────

    pub async fn join(&self, seed: &str) -> JoinOutcome {
        self.bootstrap(&[seed.to_string()]).await
    }

    /// Walk the overlay from `seeds` until the directory is full or no
    /// candidates remain.
    ///
    /// Accepting responders offer their other peers, which are queued for
    /// fan-out. A full responder is added to the visited list and its
    /// alternatives are tried next. A loop ends that path. Every failure
    /// is recorded and the walk moves on.
    pub async fn bootstrap(&self, seeds: &[String]) -> JoinOutcome {
        let mut outcome = JoinOutcome::default();
        let mut visited: Vec<NodeId> = Vec::new();
        let mut tried: HashSet<String> = HashSet::new();
        let mut queue: VecDeque<Candidate> = seeds
            .iter()
            .map(|address| Candidate {
                node_id: None,
                address: address.clone(),
            })
            .collect();

        while let Some(candidate) = queue.pop_front() {
            if self.directory.is_full() {
                tracing::debug!(pending = queue.len() + 1, "directory full, join walk done");
                break;
            }
            if !self.should_try(&candidate, &visited) || !tried.insert(candidate.address.clone()) {
                continue;
            }

            let address = candidate.address.as_str();
            let resp = match self.attempt(&candidate, &visited).await {
                Ok(resp) => resp,
                Err(e) => {
                    if let Some(id) = &candidate.node_id {
                        self.directory.abandon(id);
                    }
                    outcome.fail(address, e);
                    continue;
                }
            };

            if resp.success {
                visited.push(resp.node_id.clone());
                match self.complete_join(address, &resp).await {
                    Ok(()) => outcome.connected.push(resp.node_id.clone()),
                    Err(kind) => outcome.fail(address, kind),
                }
                if let Some(id) = candidate.node_id.as_ref().filter(|id| **id != resp.node_id) {
                    self.directory.abandon(id);
                }
                enqueue(&mut queue, &resp);
                continue;
            }

            if let Some(id) = &candidate.node_id {
                self.directory.abandon(id);
            }
            match resp.error {
                Some(kind @ (ErrorKind::NetworkFull | ErrorKind::NatPunchFailed)) => {
                    visited.push(resp.node_id.clone());
                    enqueue(&mut queue, &resp);
                    outcome.fail(address, kind);
                }
                Some(kind) => outcome.fail(address, kind),
                None => outcome.fail(address, ErrorKind::InvalidMessage),
            }
        }

        tracing::info!(
            connected = outcome.connected.len(),
            failed = outcome.failures.len(),
            peers = self.directory.len(),
            "join walk finished"
        );
        outcome
    }

    fn should_try(&self, candidate: &Candidate, visited: &[NodeId]) -> bool {
        if candidate.address == self.local.address {
            return false;
        }
        match &candidate.node_id {
            Some(id) => {
                id != &self.local.node_id
                    && !visited.contains(id)
                    && self.directory.state_of(id) != Some(PeerState::Connected)
            }
            None => true,
        }
    }

    /// Send one JoinRequest and return the responder's answer.
    async fn attempt(&self, candidate: &Candidate, visited: &[NodeId]) -> Result<JoinResponse, NetworkError> {
        if let Some(id) = &candidate.node_id {
            self.directory
                .begin_join(PeerInfo::new(id.clone(), candidate.address.clone()))?;
        }
        let mut req = JoinRequest::new(self.local.node_id.clone(), self.local.address.clone());
        req.visited_nodes = visited.to_vec();
        req.behind_nat = self.settings.behind_nat;

        tracing::debug!(peer = %candidate.address, hops = visited.len(), "sending join request");
        match self.transport.request(&candidate.address, Message::JoinRequest(req)).await? {
            Message::JoinResponse(resp) => Ok(resp),
            other => Err(NetworkError::UnexpectedReply {
                expected: MessageType::JoinResponse,
                got: other.message_type(),
            }),
        }
    }

    /// Finish an accepted join: punch if the responder opened a hole, then
    /// record the responder as Connected.
    async fn complete_join(&self, address: &str, resp: &JoinResponse) -> Result<(), ErrorKind> {
        if let Some(port) = resp.nat_port {
            nat::punch(address, port, self.settings.punch_timeout).await?;
        }
        let responder = PeerInfo::new(resp.node_id.clone(), address);
        self.directory.admit(responder)?;
        tracing::info!(peer = %resp.node_id, addr = address, "joined peer");
        Ok(())
    }

    // ── Inbound ───────────────────────────────────────────────────────────

    /// Answer a message that arrived from `remote`. Addresses advertised
    /// on an unspecified host (`0.0.0.0`, `[::]`) are pinned to the host the
    /// message came from.
    pub async fn handle_from(&self, msg: Message, remote: SocketAddr) -> Option<Message> {
        let host = remote.ip().to_string();
        let msg = match msg {
            Message::JoinRequest(mut req) => {
                req.address = with_observed_host(&req.address, &host);
                Message::JoinRequest(req)
            }
            Message::Metrics(mut metrics) => {
                metrics.address = with_observed_host(&metrics.address, &host);
                Message::Metrics(metrics)
            }
            other => other,
        };
        self.handle_message(msg).await
    }

    pub async fn handle_message(&self, msg: Message) -> Option<Message> {
        match msg {
            Message::JoinRequest(req) => Some(Message::JoinResponse(self.answer_join(req).await)),
            Message::Metrics(metrics) => {
                let peer = metrics.node_id.clone();
                if !self.directory.mark_seen(&peer) {
                    tracing::debug!(%peer, "metrics from unknown peer");
                }
                let rtt = self.collector.latency_for(&peer).unwrap_or_default();
                self.collector.update_node_metrics(metrics, rtt);
                Some(Message::Metrics(self.collector.collect_local_metrics()))
            }
            Message::Ping(hb) => {
                self.directory.mark_seen(&hb.node_id);
                Some(Message::Pong(Heartbeat {
                    node_id: self.local.node_id.clone(),
                    timestamp: hb.timestamp,
                }))
            }
            Message::Leave { node_id } => {
                match self.directory.remove(&node_id) {
                    Ok(info) => {
                        self.transport.forget(&info.address);
                        tracing::info!(peer = %node_id, "peer left");
                    }
                    Err(kind) => tracing::debug!(peer = %node_id, error = %kind, "leave from unknown peer"),
                }
                None
            }
            other @ (Message::JoinResponse(_) | Message::Pong(_)) => {
                tracing::warn!(
                    message = %other.message_type(),
                    kind = %ErrorKind::InvalidMessage,
                    "unsolicited reply dropped"
                );
                None
            }
        }
    }

    async fn answer_join(&self, req: JoinRequest) -> JoinResponse {
        let traverse = req.behind_nat && self.settings.behind_nat;
        let mut resp = self.directory.handle_join(&req, traverse);
        if !traverse || !resp.success {
            return resp;
        }

        match nat::open_hole(self.settings.punch_timeout).await {
            Ok(hole) => {
                resp.nat_port = Some(hole.port());
                let directory = self.directory.clone();
                let joiner = req.node_id.clone();
                tokio::spawn(async move {
                    match hole.wait().await {
                        Ok(from) => {
                            tracing::info!(peer = %joiner, %from, "NAT traversal complete");
                            let _ = directory.confirm(&joiner);
                        }
                        Err(e) => {
                            tracing::info!(peer = %joiner, error = %e, "NAT traversal failed");
                            directory.abandon(&joiner);
                        }
                    }
                });
            }
            Err(e) => {
                tracing::warn!(peer = %req.node_id, error = %e, "could not open punch socket");
                self.directory.abandon(&req.node_id);
                resp.success = false;
                resp.error = Some(ErrorKind::NatPunchFailed);
            }
        }
        resp
    }

    // ── Heartbeat ─────────────────────────────────────────────────────────

    /// One heartbeat round: exchange Ping/Pong and Metrics with every
    /// Connected or Stale peer, then age the directory and the collector.
    pub async fn heartbeat_once(&self) -> HeartbeatReport {
        let peers = self.directory.known_peers();
        let local_metrics = self.collector.collect_local_metrics();

        let results = join_all(
            peers
                .iter()
                .map(|peer| self.heartbeat_peer(peer, local_metrics.clone())),
        )
        .await;

        let mut report = HeartbeatReport::default();
        for (peer, result) in peers.iter().zip(results) {
            match result {
                Ok(()) => report.reached += 1,
                Err(e) => {
                    report.failed += 1;
                    tracing::debug!(peer = %peer.node_id, error = %e, "heartbeat failed");
                }
            }
        }

        report.transitions = self
            .directory
            .sweep(self.settings.window, self.settings.stale_grace);
        for transition in &report.transitions {
            if let Transition::Left(id) = transition {
                if let Some(peer) = peers.iter().find(|p| &p.node_id == id) {
                    self.transport.forget(&peer.address);
                }
            }
        }
        self.collector.purge_expired();
        report
    }

    async fn heartbeat_peer(&self, peer: &PeerInfo, local: NodeMetrics) -> Result<(), NetworkError> {
        let ping = Message::Ping(Heartbeat {
            node_id: self.local.node_id.clone(),
            timestamp: unix_millis(),
        });
        let started = Instant::now();
        match self.transport.request(&peer.address, ping).await? {
            Message::Pong(hb) if hb.node_id == peer.node_id => {}
            Message::Pong(hb) => {
                tracing::warn!(expected = %peer.node_id, got = %hb.node_id, "pong from a different node");
                return Err(ErrorKind::InvalidMessage.into());
            }
            other => {
                return Err(NetworkError::UnexpectedReply {
                    expected: MessageType::Pong,
                    got: other.message_type(),
                })
            }
        }
        let rtt = started.elapsed();
        self.directory.mark_seen(&peer.node_id);

        match self.transport.request(&peer.address, Message::Metrics(local)).await? {
            Message::Metrics(mut metrics) if metrics.node_id == peer.node_id => {
                let host = peer
                    .address
                    .rsplit_once(':')
                    .map_or(peer.address.as_str(), |(host, _)| host);
                metrics.address = with_observed_host(&metrics.address, host);
                self.collector.update_node_metrics(metrics, rtt);
                Ok(())
            }
            Message::Metrics(_) => Err(ErrorKind::InvalidMessage.into()),
            other => Err(NetworkError::UnexpectedReply {
                expected: MessageType::Metrics,
                got: other.message_type(),
            }),
        }
    }

    /// Heartbeat every `window / HEARTBEAT_DIVISOR` until shutdown.
    pub async fn run_heartbeat(&self, mut shutdown: broadcast::Receiver<()>) {
        let period = (self.settings.window / HEARTBEAT_DIVISOR).max(Duration::from_millis(10));
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        tracing::info!(period_ms = period.as_millis() as u64, "heartbeat started");

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!("heartbeat stopped");
                    return;
                }
                _ = interval.tick() => {
                    let report = self.heartbeat_once().await;
                    tracing::debug!(
                        reached = report.reached,
                        failed = report.failed,
                        transitions = report.transitions.len(),
                        peers = self.directory.len(),
                        "heartbeat round"
                    );
                }
            }
        }
    }

    /// Tell every known peer we are leaving. Best effort.
    pub async fn leave(&self) {
        let peers = self.directory.known_peers();
        let sends = peers.iter().map(|peer| {
            let msg = Message::Leave {
                node_id: self.local.node_id.clone(),
            };
            self.transport.notify(&peer.address, msg)
        });
        let delivered = join_all(sends).await.into_iter().filter(Result::is_ok).count();
        tracing::info!(delivered, peers = peers.len(), "left overlay");
    }
}

/// Replace an unspecified host in `address` with `host`. Any other address
/// is returned unchanged.
pub fn with_observed_host(address: &str, host: &str) -> String {
    match address.parse::<SocketAddr>() {
        Ok(addr) if addr.ip().is_unspecified() => {
            if host.contains(':') && !host.starts_with('[') {
                format!("[{host}]:{}", addr.port())
            } else {
                format!("{host}:{}", addr.port())
            }
        }
        _ => address.to_string(),
    }
}

fn enqueue(queue: &mut VecDeque<Candidate>, resp: &JoinResponse) {
    queue.extend(resp.alternative_peers.iter().map(|p| Candidate {
        node_id: Some(p.node_id.clone()),
        address: p.address.clone(),
    }));
}

#[async_trait]
impl MessageHandler for NetworkCore {
    async fn handle(&self, msg: Message, remote: SocketAddr) -> Option<Message> {
        tracing::trace!(%remote, message = %msg.message_type(), "overlay message");
        self.handle_from(msg, remote).await
    }
}
