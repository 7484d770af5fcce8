//! UDP hole punching between two nodes that are both behind NAT.
//!
//! The responder opens a hole: a fresh UDP socket whose port it returns
//! in the `JoinResponse`. The joiner sends [`PUNCH_PROBE`] datagrams to
//! that port and waits for [`PUNCH_ACK`]. The probe creates the mapping
//! on the joiner's side; the ack proves the path works both ways.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::task::JoinHandle;

use gatemesh_core::wire::{PUNCH_ACK, PUNCH_PROBE};
use gatemesh_core::{ErrorKind, NetworkError};

/// Probes sent per punch attempt, spread over the timeout.
const PROBE_ATTEMPTS: u32 = 4;

/// An open punch socket waiting for the joiner's probe.
pub struct Hole {
    port: u16,
    task: JoinHandle<Result<SocketAddr, NetworkError>>,
}

impl Hole {
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Wait for the probe. Returns the joiner's observed UDP address.
    pub async fn wait(self) -> Result<SocketAddr, NetworkError> {
        match self.task.await {
            Ok(r) => r,
            Err(_) => Err(ErrorKind::NatPunchFailed.into()),
        }
    }
}

/// Open a hole and answer the first probe within `timeout`.
pub async fn open_hole(timeout: Duration) -> Result<Hole, NetworkError> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
    let port = socket.local_addr()?.port();

    let task = tokio::spawn(async move {
        match tokio::time::timeout(timeout, answer_probe(&socket)).await {
            Ok(Ok(from)) => {
                tracing::debug!(port, %from, "punch probe answered");
                Ok(from)
            }
            Ok(Err(e)) => {
                tracing::debug!(port, error = %e, "punch socket failed");
                Err(ErrorKind::NatPunchFailed.into())
            }
            Err(_) => {
                tracing::debug!(port, "no punch probe before timeout");
                Err(ErrorKind::NatPunchFailed.into())
            }
        }
    });

    Ok(Hole { port, task })
}

async fn answer_probe(socket: &UdpSocket) -> Result<SocketAddr, NetworkError> {
    let mut buf = [0u8; 64];
    loop {
        let (n, from) = socket.recv_from(&mut buf).await?;
        if &buf[..n] == PUNCH_PROBE {
            socket.send_to(PUNCH_ACK, from).await?;
            return Ok(from);
        }
        tracing::trace!(%from, len = n, "ignoring stray datagram on punch socket");
    }
}

/// Punch through to `port` on the host of the overlay address `peer_addr`.
pub async fn punch(peer_addr: &str, port: u16, timeout: Duration) -> Result<(), ErrorKind> {
    let target = match resolve(peer_addr, port).await {
        Some(t) => t,
        None => {
            tracing::debug!(peer = peer_addr, "cannot resolve punch target");
            return Err(ErrorKind::NatPunchFailed);
        }
    };
    let bind: IpAddr = if target.is_ipv4() {
        Ipv4Addr::UNSPECIFIED.into()
    } else {
        Ipv6Addr::UNSPECIFIED.into()
    };
    let socket = UdpSocket::bind((bind, 0))
        .await
        .map_err(|_| ErrorKind::NatPunchFailed)?;

    let per_attempt = timeout / PROBE_ATTEMPTS;
    let mut buf = [0u8; 64];
    for attempt in 1..=PROBE_ATTEMPTS {
        if let Err(e) = socket.send_to(PUNCH_PROBE, target).await {
            tracing::debug!(%target, attempt, error = %e, "punch probe send failed");
            continue;
        }
        let wait = async {
            loop {
                match socket.recv_from(&mut buf).await {
                    Ok((n, from)) if from == target && &buf[..n] == PUNCH_ACK => return true,
                    Ok(_) => continue,
                    Err(_) => return false,
                }
            }
        };
        match tokio::time::timeout(per_attempt, wait).await {
            Ok(true) => {
                tracing::info!(%target, attempt, "NAT punch succeeded");
                return Ok(());
            }
            Ok(false) => tokio::time::sleep(per_attempt).await,
            Err(_) => {}
        }
    }
    tracing::info!(%target, "NAT punch failed");
    Err(ErrorKind::NatPunchFailed)
}

async fn resolve(peer_addr: &str, port: u16) -> Option<SocketAddr> {
    let mut addrs = tokio::net::lookup_host(peer_addr).await.ok()?;
    addrs.next().map(|a| SocketAddr::new(a.ip(), port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn punch_through_open_hole() {
        let hole = open_hole(Duration::from_secs(2)).await.unwrap();
        let port = hole.port();
        assert_ne!(port, 0);

        punch("127.0.0.1:7400", port, Duration::from_secs(2)).await.unwrap();
        let from = hole.wait().await.unwrap();
        assert!(from.ip().is_loopback());
    }

    #[tokio::test]
    async fn hole_without_probe_fails() {
        let hole = open_hole(Duration::from_millis(100)).await.unwrap();
        let err = hole.wait().await.unwrap_err();
        assert_eq!(err.kind(), Some(ErrorKind::NatPunchFailed));
    }

    #[tokio::test]
    async fn punch_to_closed_port_fails() {
        let unused = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = unused.local_addr().unwrap().port();
        drop(unused);

        let err = punch("127.0.0.1:7400", port, Duration::from_millis(200)).await.unwrap_err();
        assert_eq!(err, ErrorKind::NatPunchFailed);
    }

    #[tokio::test]
    async fn unresolvable_peer_fails() {
        let err = punch("not an address", 1, Duration::from_millis(50)).await.unwrap_err();
        assert_eq!(err, ErrorKind::NatPunchFailed);
    }
}
