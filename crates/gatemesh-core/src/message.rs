//! Overlay message model.
//!
//! Every message exchanged between gateway nodes is a [`Message`]. The
//! enum is adjacently tagged so the JSON form is `{"type": ..., "payload": ...}`
//! and the payload shape is fully determined by the tag.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unix timestamp in milliseconds.
pub fn unix_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// ── Identity ──────────────────────────────────────────────────────────────────

/// Opaque node identifier, unique within the overlay.
///
/// Ordering is plain string ordering and is used to break score ties
/// deterministically.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Fresh random identifier, used when the operator configures none.
    pub fn generate() -> Self {
        Self(format!("node-{}", Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// A peer as seen by the directory and as advertised in join responses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub node_id: NodeId,
    /// Overlay address (`host:port`) the peer accepts messages on.
    pub address: String,
    pub connected: bool,
}

impl PeerInfo {
    pub fn new(node_id: NodeId, address: impl Into<String>) -> Self {
        Self {
            node_id,
            address: address.into(),
            connected: false,
        }
    }
}

// ── Metrics ───────────────────────────────────────────────────────────────────

/// Load snapshot for one node, local or remote.
///
/// Replaced wholesale on every update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeMetrics {
    pub node_id: NodeId,
    /// Public HTTP address (`host:port`) requests can be relayed to.
    pub address: String,
    /// Percent, 0–100.
    pub cpu_usage: f64,
    /// Percent, 0–100.
    pub memory_usage: f64,
    pub requests_per_sec: f64,
    pub average_latency_ms: f64,
    pub active_requests: u64,
    /// Percent, 0–100.
    pub error_rate: f64,
    /// Unix milliseconds at collection time.
    pub timestamp: u64,
}

// ── Messages ──────────────────────────────────────────────────────────────────

/// Sent by a node that wants to become part of the overlay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinRequest {
    pub node_id: NodeId,
    pub address: String,
    /// Nodes this join has already been offered to. A node that finds
    /// itself in this list rejects the join with `NetworkJoinLoop`.
    #[serde(default)]
    pub visited_nodes: Vec<NodeId>,
    /// The joiner sits behind a NAT and needs a punched path to accept
    /// traffic from the responder.
    #[serde(default)]
    pub behind_nat: bool,
}

impl JoinRequest {
    pub fn new(node_id: NodeId, address: impl Into<String>) -> Self {
        Self {
            node_id,
            address: address.into(),
            visited_nodes: Vec::new(),
            behind_nat: false,
        }
    }

    pub fn has_visited(&self, id: &NodeId) -> bool {
        self.visited_nodes.iter().any(|v| v == id)
    }
}

/// Answer to a [`JoinRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinResponse {
    pub success: bool,
    pub error: Option<crate::ErrorKind>,
    /// Other peers the joiner may connect to (fan-out on success, retry
    /// targets on failure).
    #[serde(default)]
    pub alternative_peers: Vec<PeerInfo>,
    /// UDP port the responder opened for hole punching, if any.
    pub nat_port: Option<u16>,
    /// Responder identity.
    pub node_id: NodeId,
    pub address: String,
}

impl JoinResponse {
    pub fn accepted(node_id: NodeId, address: impl Into<String>, alternatives: Vec<PeerInfo>) -> Self {
        Self {
            success: true,
            error: None,
            alternative_peers: alternatives,
            nat_port: None,
            node_id,
            address: address.into(),
        }
    }

    pub fn rejected(
        node_id: NodeId,
        address: impl Into<String>,
        error: crate::ErrorKind,
        alternatives: Vec<PeerInfo>,
    ) -> Self {
        Self {
            success: false,
            error: Some(error),
            alternative_peers: alternatives,
            nat_port: None,
            node_id,
            address: address.into(),
        }
    }
}

/// Ping/Pong body. A Pong echoes the timestamp of the Ping it answers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub node_id: NodeId,
    pub timestamp: u64,
}

/// Every message exchanged on the overlay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum Message {
    JoinRequest(JoinRequest),
    JoinResponse(JoinResponse),
    Metrics(NodeMetrics),
    Ping(Heartbeat),
    Pong(Heartbeat),
    /// Explicit departure from the overlay.
    Leave { node_id: NodeId },
}

/// Message discriminator, for logging and reply matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    JoinRequest,
    JoinResponse,
    Metrics,
    Ping,
    Pong,
    Leave,
}

impl MessageType {
    pub fn name(&self) -> &'static str {
        match self {
            Self::JoinRequest => "join_request",
            Self::JoinResponse => "join_response",
            Self::Metrics => "metrics",
            Self::Ping => "ping",
            Self::Pong => "pong",
            Self::Leave => "leave",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::JoinRequest(_) => MessageType::JoinRequest,
            Self::JoinResponse(_) => MessageType::JoinResponse,
            Self::Metrics(_) => MessageType::Metrics,
            Self::Ping(_) => MessageType::Ping,
            Self::Pong(_) => MessageType::Pong,
            Self::Leave { .. } => MessageType::Leave,
        }
    }

    /// Serialize to JSON bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Deserialize from JSON bytes.
    pub fn from_bytes(data: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(data)
    }
}
