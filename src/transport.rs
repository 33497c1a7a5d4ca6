//! Packet Transport Abstraction
//!
//! Everything above this layer sees a connection as a pair of whole-datagram
//! operations. A packet written is delivered whole or not at all; ordering
//! and delivery are not guaranteed.

use crate::error::{Result, TunnelError};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex};

/// Largest datagram a UDP socket can carry
pub const MAX_DATAGRAM_SIZE: usize = 65507;

/// Datagram-oriented connection
///
/// One task may read while another writes; the methods take `&self`.
#[async_trait]
pub trait PacketConn: Send + Sync {
    /// Receive one packet into `buf`, returning its length. A packet longer
    /// than `buf` is truncated.
    async fn read_packet(&self, buf: &mut [u8]) -> Result<usize>;

    /// Send `packet` as one datagram
    async fn write_packet(&self, packet: &[u8]) -> Result<usize>;

    fn local_addr(&self) -> std::io::Result<SocketAddr>;

    fn peer_addr(&self) -> std::io::Result<SocketAddr>;
}

#[async_trait]
impl<T: PacketConn + ?Sized> PacketConn for Arc<T> {
    async fn read_packet(&self, buf: &mut [u8]) -> Result<usize> {
        (**self).read_packet(buf).await
    }

    async fn write_packet(&self, packet: &[u8]) -> Result<usize> {
        (**self).write_packet(packet).await
    }

    fn local_addr(&self) -> std::io::Result<SocketAddr> {
        (**self).local_addr()
    }

    fn peer_addr(&self) -> std::io::Result<SocketAddr> {
        (**self).peer_addr()
    }
}

/// UDP socket connected to a single peer
#[derive(Debug)]
pub struct UdpConn {
    socket: UdpSocket,
}

impl UdpConn {
    /// Bind an ephemeral local port and connect it to `peer`
    pub async fn connect(peer: SocketAddr) -> Result<Self> {
        let bind: SocketAddr = if peer.is_ipv4() {
            ([0, 0, 0, 0], 0).into()
        } else {
            ([0u16; 8], 0).into()
        };
        let socket = UdpSocket::bind(bind).await?;
        socket.connect(peer).await?;
        Ok(Self { socket })
    }
}

#[async_trait]
impl PacketConn for UdpConn {
    async fn read_packet(&self, buf: &mut [u8]) -> Result<usize> {
        Ok(self.socket.recv(buf).await?)
    }

    async fn write_packet(&self, packet: &[u8]) -> Result<usize> {
        Ok(self.socket.send(packet).await?)
    }

    fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    fn peer_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.peer_addr()
    }
}

/// Packet pipe backed by tokio channels
#[derive(Debug)]
pub struct MemoryConn {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    rx: Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    local: SocketAddr,
    peer: SocketAddr,
}

impl MemoryConn {
    /// Two connected ends
    pub fn pair() -> (Self, Self) {
        let a_addr: SocketAddr = ([127, 0, 0, 1], 1).into();
        let b_addr: SocketAddr = ([127, 0, 0, 1], 2).into();
        let (a_tx, b_rx) = mpsc::unbounded_channel();
        let (b_tx, a_rx) = mpsc::unbounded_channel();
        (
            Self::channel(a_tx, a_rx, a_addr, b_addr),
            Self::channel(b_tx, b_rx, b_addr, a_addr),
        )
    }

    /// Connection over caller-supplied channel ends
    pub fn channel(
        tx: mpsc::UnboundedSender<Vec<u8>>,
        rx: mpsc::UnboundedReceiver<Vec<u8>>,
        local: SocketAddr,
        peer: SocketAddr,
    ) -> Self {
        Self {
            tx,
            rx: Mutex::new(rx),
            local,
            peer,
        }
    }
}

#[async_trait]
impl PacketConn for MemoryConn {
    async fn read_packet(&self, buf: &mut [u8]) -> Result<usize> {
        let packet = self.rx.lock().await.recv().await.ok_or(TunnelError::Closed)?;
        let len = packet.len().min(buf.len());
        buf[..len].copy_from_slice(&packet[..len]);
        Ok(len)
    }

    async fn write_packet(&self, packet: &[u8]) -> Result<usize> {
        self.tx
            .send(packet.to_vec())
            .map_err(|_| TunnelError::Closed)?;
        Ok(packet.len())
    }

    fn local_addr(&self) -> std::io::Result<SocketAddr> {
        Ok(self.local)
    }

    fn peer_addr(&self) -> std::io::Result<SocketAddr> {
        Ok(self.peer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_pair() {
        let (a, b) = MemoryConn::pair();
        a.write_packet(b"ping").await.unwrap();

        let mut buf = [0u8; 16];
        let n = b.read_packet(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ping");
        assert_eq!(a.peer_addr().unwrap(), b.local_addr().unwrap());
    }

    #[tokio::test]
    async fn test_memory_closed() {
        let (a, b) = MemoryConn::pair();
        tokio_test::assert_ok!(a.write_packet(b"x").await);
        drop(b);
        assert!(matches!(a.write_packet(b"x").await, Err(TunnelError::Closed)));

        let mut buf = [0u8; 4];
        assert!(matches!(a.read_packet(&mut buf).await, Err(TunnelError::Closed)));
    }

    #[tokio::test]
    async fn test_udp_loopback() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let conn = UdpConn::connect(server.local_addr().unwrap()).await.unwrap();

        conn.write_packet(b"hello").await.unwrap();
        let mut buf = [0u8; 16];
        let (n, from) = server.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello");

        server.send_to(b"world", from).await.unwrap();
        let n = conn.read_packet(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"world");
    }
}
