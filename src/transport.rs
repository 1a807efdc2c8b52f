//! # Datagram Transport Adapter
//!
//! The overlay core never touches sockets directly; it sends through the
//! [`Transport`] capability so protocol logic stays testable with an
//! in-memory implementation. Delivery is connectionless fire-and-forget:
//! there is no acknowledgement and no retry, and a failed send to one peer
//! must never block delivery to the others (the caller logs and moves on).
//!
//! [`UdpTransport`] is the production implementation: a reusable-address
//! UDP socket shared by the listening loop (`recv_from`) and every sender.

use std::net::SocketAddr;

use anyhow::{Context, Result};
use async_trait::async_trait;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;

/// Receive buffer size for a single datagram.
/// Envelopes larger than this are truncated by the kernel and will fail to
/// decode, which the dispatcher treats like any other malformed input.
pub const MAX_DATAGRAM_SIZE: usize = 4096;

/// Outbound datagram capability injected into the overlay core.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Send one datagram to `host:port`. Best-effort: an `Err` means the
    /// local send failed, it says nothing about remote delivery.
    async fn send(&self, payload: &[u8], host: &str, port: u16) -> Result<()>;
}

/// UDP socket with reuse-address semantics, bound once per node.
pub struct UdpTransport {
    socket: UdpSocket,
}

impl UdpTransport {
    /// Bind to `0.0.0.0:port` with `SO_REUSEADDR` so a restarted node can
    /// reclaim its port immediately.
    pub fn bind(port: u16) -> Result<Self> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
            .context("failed to create UDP socket")?;
        socket
            .set_reuse_address(true)
            .context("failed to set SO_REUSEADDR")?;
        socket
            .set_nonblocking(true)
            .context("failed to set socket non-blocking")?;

        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        socket
            .bind(&addr.into())
            .with_context(|| format!("failed to bind UDP port {port}"))?;

        let socket = UdpSocket::from_std(socket.into())
            .context("failed to register socket with the runtime")?;
        Ok(UdpTransport { socket })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.socket
            .local_addr()
            .context("failed to get local address")
    }

    /// Block until the next inbound datagram. Only the listening loop calls
    /// this; returns the payload length and the sender's address.
    pub async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr)> {
        self.socket
            .recv_from(buf)
            .await
            .context("datagram receive failed")
    }
}

#[async_trait]
impl Transport for UdpTransport {
    async fn send(&self, payload: &[u8], host: &str, port: u16) -> Result<()> {
        self.socket
            .send_to(payload, (host, port))
            .await
            .with_context(|| format!("send to {host}:{port} failed"))?;
        Ok(())
    }
}
