//! Overlay error taxonomy.
//!
//! [`ErrorKind`] is the protocol-level error carried on the wire inside a
//! `JoinResponse`. [`NetworkError`] is what local callers see: a protocol
//! error, or a transport failure that never left this node.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::message::MessageType;

/// Protocol errors. Recoverable by construction: each one drives a retry,
/// a fallback peer or a state transition, never a process exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum ErrorKind {
    /// Join rejected because the directory is at capacity.
    #[error("network is full")]
    NetworkFull,
    /// The referenced node is not in the directory.
    #[error("peer not found")]
    PeerNotFound,
    /// Malformed or unexpected message.
    #[error("invalid message")]
    InvalidMessage,
    /// NAT hole punch did not complete.
    #[error("NAT punch failed")]
    NatPunchFailed,
    /// The join request reached a node it had already visited.
    #[error("join request looped back")]
    NetworkJoinLoop,
}

#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    #[error(transparent)]
    Protocol(#[from] ErrorKind),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to encode message: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("connection to {0} closed")]
    Closed(String),

    #[error("unexpected reply: expected {expected}, got {got}")]
    UnexpectedReply {
        expected: MessageType,
        got: MessageType,
    },
}

impl NetworkError {
    /// The protocol error behind this failure, if it is one.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            Self::Protocol(kind) => Some(*kind),
            Self::UnexpectedReply { .. } => Some(ErrorKind::InvalidMessage),
            _ => None,
        }
    }
}
