//! Tunnel connections
//!
//! [`SecureConn`] frames every packet through a [`SecureFramer`].
//! [`TunnelConn`] sits on top and adds the packet identity trailer, FEC shard
//! groups and duplicate suppression:
//!
//! ```text
//! write: payload ∥ id(8) → FecEncoder → shards → SecureConn → transport
//! read:  transport → SecureConn → FecDecoder → datagrams → dedup → payload
//! ```

use crate::config::{TunnelConfig, PACKET_ID_LEN};
use crate::crypto::{Decoded, SecureFramer};
use crate::error::{Result, TunnelError};
use crate::fec::{ErasureCoder, FecDecoder, FecEncoder, FecStats, ReedSolomon};
use crate::replay::PacketIdentityWindow;
use crate::transport::PacketConn;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Encrypted, authenticated packet connection
pub struct SecureConn<T> {
    transport: T,
    framer: SecureFramer,
}

impl<T: PacketConn> SecureConn<T> {
    pub fn new(transport: T, framer: SecureFramer) -> Self {
        Self { transport, framer }
    }

    pub fn framer(&self) -> &SecureFramer {
        &self.framer
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Seal and send one payload
    pub async fn write_frame(&self, payload: &[u8]) -> Result<usize> {
        let packet = self.framer.seal(payload)?;
        self.transport.write_packet(&packet).await?;
        Ok(payload.len())
    }

    /// Next payload that opens cleanly; bad packets are dropped
    pub async fn read_frame(&self) -> Result<Vec<u8>> {
        // One byte past the MTU so oversized packets are seen as such.
        let mut buf = vec![0u8; self.framer.mtu() + 1];
        loop {
            let n = self.transport.read_packet(&mut buf).await?;
            match self.framer.open(&buf[..n]) {
                Decoded::Accepted(payload) => return Ok(payload),
                Decoded::Discarded(reason) => {
                    log::trace!("dropped {} byte packet: {}", n, reason);
                }
                Decoded::Fatal(e) => return Err(e),
            }
        }
    }
}

#[async_trait]
impl<T: PacketConn> PacketConn for SecureConn<T> {
    async fn read_packet(&self, buf: &mut [u8]) -> Result<usize> {
        let payload = self.read_frame().await?;
        Ok(copy_truncated(&payload, buf))
    }

    async fn write_packet(&self, packet: &[u8]) -> Result<usize> {
        self.write_frame(packet).await
    }

    fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.transport.local_addr()
    }

    fn peer_addr(&self) -> std::io::Result<SocketAddr> {
        self.transport.peer_addr()
    }
}

fn copy_truncated(src: &[u8], dst: &mut [u8]) -> usize {
    let n = src.len().min(dst.len());
    dst[..n].copy_from_slice(&src[..n]);
    n
}

struct Fec {
    encoder: Mutex<FecEncoder>,
    decoder: Mutex<FecDecoder>,
}

/// Datagram tunnel with identity, FEC and dedup
///
/// Reads and writes may run concurrently from different tasks.
pub struct TunnelConn<T> {
    inner: SecureConn<T>,
    next_id: AtomicU64,
    fec: Option<Fec>,
    window: Mutex<PacketIdentityWindow>,
    /// Datagrams recovered by FEC and not yet handed out
    ready: Mutex<VecDeque<Vec<u8>>>,
    max_payload: usize,
}

impl<T: PacketConn> TunnelConn<T> {
    pub fn new(transport: T, config: &TunnelConfig) -> Result<Self> {
        config.validate()?;
        let framer = SecureFramer::new(
            config.cipher_method()?,
            &config.password,
            config.mtu,
            config.authenticated,
        )?;

        let fec = if config.fec_enabled() {
            let coder: Arc<dyn ErasureCoder> =
                Arc::new(ReedSolomon::new(config.data_shards, config.parity_shards)?);
            Some(Fec {
                encoder: Mutex::new(FecEncoder::new(coder.clone())),
                decoder: Mutex::new(FecDecoder::new(coder, config.fec_group_window)),
            })
        } else {
            None
        };

        let max_payload = framer.max_payload() - config.tunnel_overhead();
        Ok(Self {
            inner: SecureConn::new(transport, framer),
            next_id: AtomicU64::new(0),
            fec,
            window: Mutex::new(PacketIdentityWindow::new(config.dedup_window)),
            ready: Mutex::new(VecDeque::new()),
            max_payload,
        })
    }

    /// Largest payload accepted by [`write`](Self::write)
    pub fn max_payload(&self) -> usize {
        self.max_payload
    }

    pub fn fec_stats(&self) -> Option<FecStats> {
        self.fec.as_ref().map(|fec| fec.decoder.lock().stats())
    }

    pub fn transport(&self) -> &T {
        self.inner.transport()
    }

    /// Send one payload; it arrives whole or not at all
    pub async fn write(&self, payload: &[u8]) -> Result<usize> {
        if payload.len() > self.max_payload {
            let mtu = self.inner.framer().mtu();
            return Err(TunnelError::PayloadTooLarge {
                size: payload.len() + mtu - self.max_payload,
                mtu,
            });
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut datagram = Vec::with_capacity(payload.len() + PACKET_ID_LEN);
        datagram.extend_from_slice(payload);
        datagram.extend_from_slice(&id.to_be_bytes());

        match &self.fec {
            Some(fec) => {
                let shards = fec.encoder.lock().encode(&datagram)?;
                for shard in &shards {
                    self.inner.write_frame(shard).await?;
                }
            }
            None => {
                self.inner.write_frame(&datagram).await?;
            }
        }
        Ok(payload.len())
    }

    /// Next fresh payload, copied into `buf` (truncated if `buf` is short)
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let payload = self.read_datagram().await?;
        Ok(copy_truncated(&payload, buf))
    }

    /// Next fresh payload
    pub async fn read_datagram(&self) -> Result<Vec<u8>> {
        loop {
            let queued = self.ready.lock().pop_front();
            if let Some(datagram) = queued {
                if let Some(payload) = self.accept(datagram) {
                    return Ok(payload);
                }
                continue;
            }

            let frame = self.inner.read_frame().await?;
            let datagrams = match &self.fec {
                Some(fec) => {
                    let decoded = fec.decoder.lock().decode(&frame);
                    match decoded {
                        Ok(datagrams) => datagrams,
                        Err(reason) => {
                            log::trace!("dropped {} byte shard: {}", frame.len(), reason);
                            continue;
                        }
                    }
                }
                None => vec![frame],
            };
            self.ready.lock().extend(datagrams);
        }
    }

    /// Strip the identity trailer; `None` for duplicates and runts
    fn accept(&self, mut datagram: Vec<u8>) -> Option<Vec<u8>> {
        if datagram.len() < PACKET_ID_LEN {
            log::trace!("dropped {} byte datagram: too short for identity", datagram.len());
            return None;
        }

        let split = datagram.len() - PACKET_ID_LEN;
        let mut id = [0u8; PACKET_ID_LEN];
        id.copy_from_slice(&datagram[split..]);
        let id = u64::from_be_bytes(id);

        if !self.window.lock().test(id) {
            log::trace!("dropped duplicate or out-of-window packet {}", id);
            return None;
        }

        datagram.truncate(split);
        Some(datagram)
    }
}

#[async_trait]
impl<T: PacketConn> PacketConn for TunnelConn<T> {
    async fn read_packet(&self, buf: &mut [u8]) -> Result<usize> {
        self.read(buf).await
    }

    async fn write_packet(&self, packet: &[u8]) -> Result<usize> {
        self.write(packet).await
    }

    fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    fn peer_addr(&self) -> std::io::Result<SocketAddr> {
        self.inner.peer_addr()
    }
}
