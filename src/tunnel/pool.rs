//! UDP connection pool (§4.6).
//!
//! Each peer node gets one "connected" UDP socket, created lazily and kept
//! around across packets to that peer. Forwarding a datagram retries a
//! bounded number of times against a fresh socket rather than recursing —
//! the source this is descended from recursed on send failure, which could
//! in principle run away under a sustained outage; a capped loop can't.

use std::net::SocketAddr;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::net::UdpSocket;
use tracing::warn;

use crate::error::{NetError, Result};

pub const MAX_FORWARD_ATTEMPTS: u32 = 10;

pub struct UdpConnectionPool {
    peers: DashMap<SocketAddr, Arc<UdpSocket>>,
}

impl UdpConnectionPool {
    pub fn new() -> Self {
        Self {
            peers: DashMap::new(),
        }
    }

    async fn connection_for(&self, peer: SocketAddr) -> Result<Arc<UdpSocket>> {
        if let Some(existing) = self.peers.get(&peer) {
            return Ok(existing.clone());
        }
        let bind_addr: SocketAddr = if peer.is_ipv4() {
            "0.0.0.0:0".parse().unwrap()
        } else {
            "[::]:0".parse().unwrap()
        };
        let socket = UdpSocket::bind(bind_addr).await?;
        socket.connect(peer).await?;
        let socket = Arc::new(socket);
        self.peers.insert(peer, socket.clone());
        Ok(socket)
    }

    /// Sends `data` to `peer`, retrying up to [`MAX_FORWARD_ATTEMPTS`] times
    /// against a freshly dialed socket whenever the current one errors.
    pub async fn forward(&self, peer: SocketAddr, data: &[u8]) -> Result<()> {
        let mut last_err = None;
        for attempt in 0..MAX_FORWARD_ATTEMPTS {
            let socket = self.connection_for(peer).await?;
            match socket.send(data).await {
                Ok(_) => return Ok(()),
                Err(e) => {
                    warn!(%peer, attempt, error = %e, "udp forward attempt failed, retrying");
                    self.peers.remove(&peer);
                    last_err = Some(e);
                }
            }
        }
        Err(NetError::Io(last_err.unwrap()))
    }

    pub fn active_peers(&self) -> usize {
        self.peers.len()
    }
}

impl Default for UdpConnectionPool {
    fn default() -> Self {
        Self::new()
    }
}
