//! gatemesh-services: the overlay's moving parts.
//!
//! `metrics` and `directory` hold all mutable state, each behind its own
//! lock. `network` drives them from the wire through a [`Transport`];
//! `balancer` reads them to pick where a request should run.

pub mod balancer;
pub mod directory;
pub mod host;
pub mod metrics;
pub mod nat;
pub mod network;
pub mod transport;

pub use balancer::{select_peer, Balancer, RouteDecision, Selection};
pub use directory::{PeerDirectory, PeerEntry, PeerState};
pub use metrics::{Collector, Request, Score, Weights};
pub use network::{JoinOutcome, NetworkCore, NetworkSettings};
pub use transport::{serve, MessageHandler, TcpTransport, Transport};
