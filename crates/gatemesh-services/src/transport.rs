//! Overlay transport: framed JSON messages over TCP.
//!
//! Outbound requests reuse one persistent connection per peer address.
//! A connection carries one exchange at a time, so a reply always belongs
//! to the request just written. Any failure drops the pooled connection
//! and the next request dials again.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, Mutex};
use tokio_util::codec::Framed;

use gatemesh_core::wire::MessageCodec;
use gatemesh_core::{ErrorKind, Message, NetworkError};

#[async_trait]
pub trait Transport: Send + Sync {
    /// Send `msg` to `addr` and wait for the single reply.
    async fn request(&self, addr: &str, msg: Message) -> Result<Message, NetworkError>;

    /// Send `msg` to `addr` without waiting for a reply.
    async fn notify(&self, addr: &str, msg: Message) -> Result<(), NetworkError>;

    /// Drop any cached connection to `addr`.
    fn forget(&self, _addr: &str) {}
}

/// Answers inbound overlay messages. `None` means no reply is sent.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, msg: Message, remote: SocketAddr) -> Option<Message>;
}

type Connection = Arc<Mutex<Framed<TcpStream, MessageCodec>>>;

pub struct TcpTransport {
    timeout: Duration,
    pool: DashMap<String, Connection>,
}

impl TcpTransport {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            pool: DashMap::new(),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Number of pooled connections.
    pub fn pooled(&self) -> usize {
        self.pool.len()
    }

    async fn connection(&self, addr: &str) -> Result<Connection, NetworkError> {
        if let Some(conn) = self.pool.get(addr) {
            return Ok(conn.clone());
        }
        let conn = Arc::new(Mutex::new(dial(addr).await?));
        // A concurrent dial to the same address may win; either connection works.
        self.pool.insert(addr.to_string(), conn.clone());
        Ok(conn)
    }

    async fn exchange(&self, addr: &str, msg: Message) -> Result<Message, NetworkError> {
        let conn = self.connection(addr).await?;
        let mut framed = conn.lock().await;
        framed.send(msg).await?;
        read_reply(&mut framed, addr).await
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn request(&self, addr: &str, msg: Message) -> Result<Message, NetworkError> {
        let kind = msg.message_type();
        let result = match tokio::time::timeout(self.timeout, self.exchange(addr, msg)).await {
            Ok(r) => r,
            Err(_) => Err(NetworkError::Timeout(self.timeout)),
        };
        if let Err(e) = &result {
            self.pool.remove(addr);
            tracing::debug!(peer = addr, message = %kind, error = %e, "overlay request failed");
        }
        result
    }

    async fn notify(&self, addr: &str, msg: Message) -> Result<(), NetworkError> {
        let send = async {
            let mut framed = dial(addr).await?;
            framed.send(msg).await?;
            framed.close().await
        };
        match tokio::time::timeout(self.timeout, send).await {
            Ok(r) => r,
            Err(_) => Err(NetworkError::Timeout(self.timeout)),
        }
    }

    fn forget(&self, addr: &str) {
        if self.pool.remove(addr).is_some() {
            tracing::debug!(peer = addr, "pooled connection dropped");
        }
    }
}

async fn dial(addr: &str) -> Result<Framed<TcpStream, MessageCodec>, NetworkError> {
    let stream = TcpStream::connect(addr).await?;
    stream.set_nodelay(true)?;
    Ok(Framed::new(stream, MessageCodec::new()))
}

async fn read_reply(
    framed: &mut Framed<TcpStream, MessageCodec>,
    addr: &str,
) -> Result<Message, NetworkError> {
    match framed.next().await {
        Some(Ok(Ok(reply))) => Ok(reply),
        Some(Ok(Err(e))) => {
            tracing::warn!(peer = addr, error = %e, "malformed reply");
            Err(ErrorKind::InvalidMessage.into())
        }
        Some(Err(e)) => Err(e.into()),
        None => Err(NetworkError::Closed(addr.to_string())),
    }
}

// ── Inbound ───────────────────────────────────────────────────────────────────

/// Accept overlay connections until shutdown. Each connection gets its
/// own task, which also ends on shutdown.
pub async fn serve(
    listener: TcpListener,
    handler: Arc<dyn MessageHandler>,
    mut shutdown: broadcast::Receiver<()>,
) {
    if let Ok(addr) = listener.local_addr() {
        tracing::info!(%addr, "overlay listener started");
    }
    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                tracing::info!("overlay listener stopped");
                return;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, remote)) => {
                    let handler = handler.clone();
                    tokio::spawn(handle_connection(stream, remote, handler, shutdown.resubscribe()));
                }
                Err(e) => tracing::warn!(error = %e, "overlay accept failed"),
            },
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    remote: SocketAddr,
    handler: Arc<dyn MessageHandler>,
    mut shutdown: broadcast::Receiver<()>,
) {
    if let Err(e) = stream.set_nodelay(true) {
        tracing::debug!(%remote, error = %e, "set_nodelay failed");
    }
    let mut framed = Framed::new(stream, MessageCodec::new());
    tracing::trace!(%remote, "overlay connection opened");

    loop {
        let frame = tokio::select! {
            _ = shutdown.recv() => break,
            frame = framed.next() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };
        match frame {
            Ok(Ok(msg)) => {
                if let Some(reply) = handler.handle(msg, remote).await {
                    if let Err(e) = framed.send(reply).await {
                        tracing::debug!(%remote, error = %e, "reply failed, closing");
                        break;
                    }
                }
            }
            Ok(Err(e)) => {
                tracing::warn!(%remote, error = %e, kind = %ErrorKind::InvalidMessage, "dropped malformed frame");
            }
            Err(e) => {
                tracing::debug!(%remote, error = %e, "overlay stream error, closing");
                break;
            }
        }
    }
    tracing::trace!(%remote, "overlay connection closed");
}
