//! gatemesh-core: shared identity, message and wire types for the overlay.
//! All other gatemesh crates depend on this one.

pub mod config;
pub mod error;
pub mod message;
pub mod wire;

pub use error::{ErrorKind, NetworkError};
pub use message::{
    unix_millis, Heartbeat, JoinRequest, JoinResponse, Message, MessageType, NodeId, NodeMetrics,
    PeerInfo,
};
