//! Peer directory: the bounded set of peers this node knows.
//!
//! Per-peer lifecycle:
//!
//! ```text
//!   (absent) ──join──▶ Joining ──response / traversal──▶ Connected
//!                                                        │     ▲
//!                                          no heartbeat  │     │ heartbeat
//!                                          for a window  ▼     │
//!                                                        Stale ─┘
//!                                                          │
//!                              grace expired / leave / evict ▼
//!                                                       (removed)
//! ```
//!
//! Only Connected peers are eligible for selection. Stale peers are kept
//! for a grace period so a peer that blips can come back without a new
//! join. The map is guarded by a single lock and never exceeds
//! `max_peers` entries.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::Serialize;

use gatemesh_core::wire::ALTERNATIVES_LIMIT;
use gatemesh_core::{ErrorKind, JoinRequest, JoinResponse, NodeId, PeerInfo};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerState {
    Joining,
    Connected,
    Stale,
}

#[derive(Debug, Clone)]
pub struct PeerEntry {
    pub info: PeerInfo,
    pub state: PeerState,
    pub last_seen: Instant,
    pub stale_since: Option<Instant>,
}

impl PeerEntry {
    fn new(info: PeerInfo, state: PeerState, now: Instant) -> Self {
        let mut entry = Self {
            info,
            state,
            last_seen: now,
            stale_since: None,
        };
        entry.info.connected = state == PeerState::Connected;
        entry
    }

    fn set_state(&mut self, state: PeerState, now: Instant) {
        self.state = state;
        self.info.connected = state == PeerState::Connected;
        self.stale_since = (state == PeerState::Stale).then_some(now);
    }
}

/// State change produced by a sweep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    Stale(NodeId),
    Left(NodeId),
}

/// A join is looping if the receiving node already appears on its path,
/// or if a node tries to join itself.
pub fn check_join(local_id: &NodeId, req: &JoinRequest) -> Result<(), ErrorKind> {
    if req.has_visited(local_id) || &req.node_id == local_id {
        return Err(ErrorKind::NetworkJoinLoop);
    }
    Ok(())
}

pub struct PeerDirectory {
    local_id: NodeId,
    /// Our overlay address, reported in join responses.
    local_addr: String,
    max_peers: usize,
    peers: RwLock<HashMap<NodeId, PeerEntry>>,
}

impl PeerDirectory {
    pub fn new(local_id: NodeId, local_addr: impl Into<String>, max_peers: usize) -> Self {
        Self {
            local_id,
            local_addr: local_addr.into(),
            max_peers,
            peers: RwLock::new(HashMap::new()),
        }
    }

    pub fn local_id(&self) -> &NodeId {
        &self.local_id
    }

    pub fn local_addr(&self) -> &str {
        &self.local_addr
    }

    pub fn max_peers(&self) -> usize {
        self.max_peers
    }

    // ── Inbound joins ─────────────────────────────────────────────────────

    /// Answer a join request.
    ///
    /// A looping request is rejected without touching the directory. A
    /// known joiner is refreshed in place. A new joiner is admitted if
    /// there is room, or if a Stale peer can be evicted to make room;
    /// otherwise the join fails with `NetworkFull` and the known peers are
    /// offered as alternatives. `await_traversal` admits the joiner as
    /// Joining until a NAT punch confirms the path.
    pub fn handle_join(&self, req: &JoinRequest, await_traversal: bool) -> JoinResponse {
        if let Err(kind) = check_join(&self.local_id, req) {
            tracing::debug!(joiner = %req.node_id, hops = req.visited_nodes.len(), "join loop detected");
            return self.reject(kind, Vec::new());
        }

        let now = Instant::now();
        let initial = if await_traversal {
            PeerState::Joining
        } else {
            PeerState::Connected
        };
        let mut peers = self.peers.write();

        if let Some(entry) = peers.get_mut(&req.node_id) {
            entry.info.address = req.address.clone();
            entry.last_seen = now;
            if entry.state != PeerState::Connected {
                entry.set_state(initial, now);
            }
            tracing::debug!(peer = %req.node_id, "known peer re-joined");
            let alternatives = alternatives(&peers, &req.node_id);
            return self.accept(alternatives);
        }

        if peers.len() >= self.max_peers {
            match longest_stale(&peers) {
                Some(victim) => {
                    peers.remove(&victim);
                    tracing::info!(evicted = %victim, joiner = %req.node_id, "evicted stale peer to admit joiner");
                }
                None => {
                    let alternatives = alternatives(&peers, &req.node_id);
                    tracing::info!(
                        joiner = %req.node_id,
                        alternatives = alternatives.len(),
                        "join rejected, directory full"
                    );
                    return self.reject(ErrorKind::NetworkFull, alternatives);
                }
            }
        }

        let alternatives = alternatives(&peers, &req.node_id);
        let info = PeerInfo::new(req.node_id.clone(), req.address.clone());
        peers.insert(req.node_id.clone(), PeerEntry::new(info, initial, now));
        tracing::info!(peer = %req.node_id, addr = %req.address, state = ?initial, "peer admitted");
        self.accept(alternatives)
    }

    fn accept(&self, alternatives: Vec<PeerInfo>) -> JoinResponse {
        JoinResponse::accepted(self.local_id.clone(), self.local_addr.clone(), alternatives)
    }

    fn reject(&self, kind: ErrorKind, alternatives: Vec<PeerInfo>) -> JoinResponse {
        JoinResponse::rejected(
            self.local_id.clone(),
            self.local_addr.clone(),
            kind,
            alternatives,
        )
    }

    // ── Outbound joins ────────────────────────────────────────────────────

    /// Reserve a slot for a peer we are about to join. Already-known peers
    /// keep their current state.
    pub fn begin_join(&self, info: PeerInfo) -> Result<(), ErrorKind> {
        self.insert_if_room(info, PeerState::Joining)
    }

    /// Record a peer that accepted our join.
    pub fn admit(&self, info: PeerInfo) -> Result<(), ErrorKind> {
        let id = info.node_id.clone();
        self.insert_if_room(info, PeerState::Connected)?;
        self.confirm(&id)
    }

    fn insert_if_room(&self, info: PeerInfo, state: PeerState) -> Result<(), ErrorKind> {
        if info.node_id == self.local_id {
            return Err(ErrorKind::NetworkJoinLoop);
        }
        let mut peers = self.peers.write();
        if peers.contains_key(&info.node_id) {
            return Ok(());
        }
        if peers.len() >= self.max_peers {
            return Err(ErrorKind::NetworkFull);
        }
        let now = Instant::now();
        peers.insert(info.node_id.clone(), PeerEntry::new(info, state, now));
        Ok(())
    }

    /// Joining/Stale → Connected.
    pub fn confirm(&self, id: &NodeId) -> Result<(), ErrorKind> {
        let mut peers = self.peers.write();
        let entry = peers.get_mut(id).ok_or(ErrorKind::PeerNotFound)?;
        let now = Instant::now();
        entry.last_seen = now;
        if entry.state != PeerState::Connected {
            tracing::info!(peer = %id, from = ?entry.state, "peer connected");
            entry.set_state(PeerState::Connected, now);
        }
        Ok(())
    }

    /// Drop a reservation made by [`begin_join`](Self::begin_join) whose join
    /// failed. Peers that got further than Joining are left alone.
    pub fn abandon(&self, id: &NodeId) {
        let mut peers = self.peers.write();
        if matches!(peers.get(id), Some(e) if e.state == PeerState::Joining) {
            peers.remove(id);
        }
    }

    // ── Liveness ──────────────────────────────────────────────────────────

    /// A heartbeat or metrics push arrived from `id`. Returns false for
    /// unknown peers.
    pub fn mark_seen(&self, id: &NodeId) -> bool {
        let mut peers = self.peers.write();
        let Some(entry) = peers.get_mut(id) else {
            return false;
        };
        let now = Instant::now();
        entry.last_seen = now;
        if entry.state != PeerState::Connected {
            tracing::info!(peer = %id, from = ?entry.state, "peer back to connected");
            entry.set_state(PeerState::Connected, now);
        }
        true
    }

    /// Age the directory: Connected peers silent for a full window become
    /// Stale, Stale peers past `grace` and Joining peers silent for a
    /// window are removed.
    pub fn sweep(&self, window: Duration, grace: Duration) -> Vec<Transition> {
        self.sweep_at(Instant::now(), window, grace)
    }

    pub fn sweep_at(&self, now: Instant, window: Duration, grace: Duration) -> Vec<Transition> {
        let mut transitions = Vec::new();
        let mut peers = self.peers.write();

        peers.retain(|id, entry| {
            let silent = now.saturating_duration_since(entry.last_seen);
            match entry.state {
                PeerState::Connected if silent >= window => {
                    entry.set_state(PeerState::Stale, now);
                    transitions.push(Transition::Stale(id.clone()));
                    true
                }
                PeerState::Stale => {
                    let since = entry.stale_since.unwrap_or(entry.last_seen);
                    if now.saturating_duration_since(since) >= grace {
                        transitions.push(Transition::Left(id.clone()));
                        false
                    } else {
                        true
                    }
                }
                PeerState::Joining if silent >= window => {
                    transitions.push(Transition::Left(id.clone()));
                    false
                }
                _ => true,
            }
        });

        for t in &transitions {
            match t {
                Transition::Stale(id) => tracing::info!(peer = %id, "peer stale"),
                Transition::Left(id) => tracing::info!(peer = %id, "peer removed"),
            }
        }
        transitions
    }

    /// Remove a peer (explicit leave or operator action).
    pub fn remove(&self, id: &NodeId) -> Result<PeerInfo, ErrorKind> {
        self.peers
            .write()
            .remove(id)
            .map(|e| e.info)
            .ok_or(ErrorKind::PeerNotFound)
    }

    // ── Queries ───────────────────────────────────────────────────────────

    pub fn get(&self, id: &NodeId) -> Option<PeerEntry> {
        self.peers.read().get(id).cloned()
    }

    pub fn state_of(&self, id: &NodeId) -> Option<PeerState> {
        self.peers.read().get(id).map(|e| e.state)
    }

    /// Connected peers, ordered by id.
    pub fn connected_peers(&self) -> Vec<PeerInfo> {
        let mut out: Vec<PeerInfo> = self
            .peers
            .read()
            .values()
            .filter(|e| e.state == PeerState::Connected)
            .map(|e| e.info.clone())
            .collect();
        out.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        out
    }

    /// Connected and Stale peers, ordered by id. These are the heartbeat
    /// targets.
    pub fn known_peers(&self) -> Vec<PeerInfo> {
        let mut out: Vec<PeerInfo> = self
            .peers
            .read()
            .values()
            .filter(|e| e.state != PeerState::Joining)
            .map(|e| e.info.clone())
            .collect();
        out.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        out
    }

    /// Every entry, ordered by id.
    pub fn snapshot(&self) -> Vec<PeerEntry> {
        let mut out: Vec<PeerEntry> = self.peers.read().values().cloned().collect();
        out.sort_by(|a, b| a.info.node_id.cmp(&b.info.node_id));
        out
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.peers.read().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.read().is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.max_peers
    }
}

/// Peers to offer a joiner: everyone but the joiner, Connected first,
/// then by id, capped at `ALTERNATIVES_LIMIT`.
fn alternatives(peers: &HashMap<NodeId, PeerEntry>, joiner: &NodeId) -> Vec<PeerInfo> {
    let mut candidates: Vec<&PeerEntry> = peers
        .values()
        .filter(|e| &e.info.node_id != joiner && e.state != PeerState::Joining)
        .collect();
    candidates.sort_by(|a, b| {
        (a.state != PeerState::Connected, &a.info.node_id)
            .cmp(&(b.state != PeerState::Connected, &b.info.node_id))
    });
    candidates
        .into_iter()
        .take(ALTERNATIVES_LIMIT)
        .map(|e| e.info.clone())
        .collect()
}

/// The Stale peer that has been stale the longest.
fn longest_stale(peers: &HashMap<NodeId, PeerEntry>) -> Option<NodeId> {
    peers
        .values()
        .filter(|e| e.state == PeerState::Stale)
        .min_by_key(|e| e.stale_since.unwrap_or(e.last_seen))
        .map(|e| e.info.node_id.clone())
}
