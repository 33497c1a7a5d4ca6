//! UDP relays for both tunnel ends
//!
//! - Client: plain UDP in on `local_addr`, one tunnel per source address to
//!   the server at `remote_addr`.
//! - Server: tunnel traffic in on `local_addr`, demultiplexed by peer, each
//!   peer forwarded as plain UDP to `remote_addr`.
//!
//! Sessions idle for longer than `expires` are dropped along with their
//! forwarding tasks.

use crate::config::{TunnelConfig, TunnelMode};
use crate::conn::TunnelConn;
use crate::error::{Result as TunnelResult, TunnelError};
use crate::transport::{PacketConn, UdpConn, MAX_DATAGRAM_SIZE};
use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;

/// Longest pause between expiry sweeps
const MAX_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Inbound packets queued per server session before new ones are dropped
const PEER_QUEUE_LEN: usize = 256;

/// Run the relay selected by `config.mode` until it fails
pub async fn run(config: TunnelConfig) -> Result<()> {
    match config.mode {
        TunnelMode::Client => ClientRelay::bind(config).await?.run().await,
        TunnelMode::Server => ServerRelay::bind(config).await?.run().await,
    }
}

/// Last time a session moved a packet
#[derive(Debug)]
struct Activity(Mutex<Instant>);

impl Activity {
    fn new() -> Arc<Self> {
        Arc::new(Self(Mutex::new(Instant::now())))
    }

    fn touch(&self) {
        *self.0.lock() = Instant::now();
    }

    fn idle(&self) -> Duration {
        self.0.lock().elapsed()
    }
}

/// One peer's relay state; aborts its tasks when dropped
struct Session<I> {
    input: I,
    activity: Arc<Activity>,
    tasks: Vec<JoinHandle<()>>,
}

impl<I> Session<I> {
    /// False once any forwarding task has stopped
    fn is_alive(&self) -> bool {
        self.tasks.iter().all(|task| !task.is_finished())
    }
}

impl<I> Drop for Session<I> {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

type Sessions<I> = Arc<RwLock<HashMap<SocketAddr, Session<I>>>>;

/// Periodically drop sessions idle longer than `expires`
fn spawn_expiry<I: Send + Sync + 'static>(sessions: Sessions<I>, expires: Duration) -> JoinHandle<()> {
    let period = (expires / 2).clamp(Duration::from_millis(100), MAX_SWEEP_INTERVAL);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        loop {
            ticker.tick().await;

            let mut sessions = sessions.write().await;
            sessions.retain(|peer, session| {
                let keep = session.activity.idle() <= expires;
                if !keep {
                    log::info!("removing expired session for {}", peer);
                }
                keep
            });
        }
    })
}

fn log_tunnel(from: SocketAddr, via: SocketAddr, to_local: std::io::Result<SocketAddr>, to: std::io::Result<SocketAddr>) {
    let show = |addr: std::io::Result<SocketAddr>| match addr {
        Ok(addr) => addr.to_string(),
        Err(_) => "?".to_string(),
    };
    log::info!(
        "create tunnel from {} -> {} to {} -> {}",
        from,
        via,
        show(to_local),
        show(to)
    );
}

/// Client end: plain UDP in, tunnel out
pub struct ClientRelay {
    config: TunnelConfig,
    socket: Arc<UdpSocket>,
    sessions: Sessions<Arc<TunnelConn<UdpConn>>>,
}

impl ClientRelay {
    pub async fn bind(config: TunnelConfig) -> Result<Self> {
        config.validate()?;
        let socket = UdpSocket::bind(config.local_addr)
            .await
            .with_context(|| format!("failed to bind {}", config.local_addr))?;
        Ok(Self {
            config,
            socket: Arc::new(socket),
            sessions: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub async fn run(self) -> Result<()> {
        log::info!(
            "client relay listening on {}, server {}",
            self.local_addr()?,
            self.config.remote_addr
        );
        let _expiry = AbortOnDrop(spawn_expiry(self.sessions.clone(), self.config.expires));

        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        loop {
            let (len, client_addr) = match self.socket.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(e) => {
                    log::error!("UDP recv_from error: {}", e);
                    continue;
                }
            };

            let tunnel = match self.session(client_addr).await {
                Ok(tunnel) => tunnel,
                Err(e) => {
                    log::error!("failed to open tunnel for {}: {:#}", client_addr, e);
                    continue;
                }
            };

            match tunnel.write(&buf[..len]).await {
                Ok(_) => {}
                Err(e @ TunnelError::PayloadTooLarge { .. }) => {
                    log::warn!("dropping datagram from {}: {}", client_addr, e);
                }
                Err(e) => log::error!("tunnel write for {} failed: {}", client_addr, e),
            }
        }
    }

    /// Existing tunnel for `client_addr`, or a new one
    async fn session(&self, client_addr: SocketAddr) -> Result<Arc<TunnelConn<UdpConn>>> {
        if let Some(session) = self.sessions.read().await.get(&client_addr) {
            if session.is_alive() {
                session.activity.touch();
                return Ok(session.input.clone());
            }
        }

        let mut sessions = self.sessions.write().await;
        if let Some(session) = sessions.get(&client_addr) {
            if session.is_alive() {
                session.activity.touch();
                return Ok(session.input.clone());
            }
            log::info!("replacing stopped session for {}", client_addr);
            sessions.remove(&client_addr);
        }

        let transport = UdpConn::connect(self.config.remote_addr)
            .await
            .with_context(|| format!("failed to connect to {}", self.config.remote_addr))?;
        let tunnel = Arc::new(TunnelConn::new(transport, &self.config)?);
        log_tunnel(
            client_addr,
            self.local_addr()?,
            tunnel.local_addr(),
            tunnel.peer_addr(),
        );

        let activity = Activity::new();
        let reverse = tokio::spawn(tunnel_to_client(
            tunnel.clone(),
            self.socket.clone(),
            client_addr,
            activity.clone(),
        ));

        sessions.insert(
            client_addr,
            Session {
                input: tunnel.clone(),
                activity,
                tasks: vec![reverse],
            },
        );
        Ok(tunnel)
    }
}

async fn tunnel_to_client(
    tunnel: Arc<TunnelConn<UdpConn>>,
    socket: Arc<UdpSocket>,
    client_addr: SocketAddr,
    activity: Arc<Activity>,
) {
    loop {
        let payload = match tunnel.read_datagram().await {
            Ok(payload) => payload,
            Err(e) if e.is_transient() => {
                log::debug!("tunnel read for {}: {}", client_addr, e);
                continue;
            }
            Err(e) => {
                log::warn!("tunnel read for {} failed: {}", client_addr, e);
                break;
            }
        };
        activity.touch();
        if let Err(e) = socket.send_to(&payload, client_addr).await {
            log::error!("failed to send reverse packet to {}: {}", client_addr, e);
            break;
        }
    }
    log::debug!("reverse forwarding stopped for {}", client_addr);
}

/// Server-side view of one tunnel peer on a shared socket
///
/// Inbound packets are pushed in by the relay's receive loop; outbound
/// packets go straight to the peer.
struct PeerConn {
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
    rx: tokio::sync::Mutex<mpsc::Receiver<Vec<u8>>>,
}

#[async_trait]
impl PacketConn for PeerConn {
    async fn read_packet(&self, buf: &mut [u8]) -> TunnelResult<usize> {
        let packet = self.rx.lock().await.recv().await.ok_or(TunnelError::Closed)?;
        let len = packet.len().min(buf.len());
        buf[..len].copy_from_slice(&packet[..len]);
        Ok(len)
    }

    async fn write_packet(&self, packet: &[u8]) -> TunnelResult<usize> {
        Ok(self.socket.send_to(packet, self.peer).await?)
    }

    fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    fn peer_addr(&self) -> std::io::Result<SocketAddr> {
        Ok(self.peer)
    }
}

/// Server end: tunnel in, plain UDP out
pub struct ServerRelay {
    config: TunnelConfig,
    socket: Arc<UdpSocket>,
    sessions: Sessions<mpsc::Sender<Vec<u8>>>,
}

impl ServerRelay {
    pub async fn bind(config: TunnelConfig) -> Result<Self> {
        config.validate()?;
        let socket = UdpSocket::bind(config.local_addr)
            .await
            .with_context(|| format!("failed to bind {}", config.local_addr))?;
        Ok(Self {
            config,
            socket: Arc::new(socket),
            sessions: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub async fn run(self) -> Result<()> {
        log::info!(
            "server relay listening on {}, forwarding to {}",
            self.local_addr()?,
            self.config.remote_addr
        );
        let _expiry = AbortOnDrop(spawn_expiry(self.sessions.clone(), self.config.expires));

        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        loop {
            let (len, peer) = match self.socket.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(e) => {
                    log::error!("UDP recv_from error: {}", e);
                    continue;
                }
            };

            if let Err(e) = self.dispatch(peer, buf[..len].to_vec()).await {
                log::error!("failed to open session for {}: {:#}", peer, e);
            }
        }
    }

    async fn dispatch(&self, peer: SocketAddr, packet: Vec<u8>) -> Result<()> {
        let packet = {
            let sessions = self.sessions.read().await;
            match sessions.get(&peer) {
                Some(session) if session.is_alive() => {
                    session.activity.touch();
                    match session.input.try_send(packet) {
                        Ok(()) => return Ok(()),
                        Err(mpsc::error::TrySendError::Full(_)) => {
                            log::debug!("session queue for {} full, dropping packet", peer);
                            return Ok(());
                        }
                        // Session tasks ended; replace it below.
                        Err(mpsc::error::TrySendError::Closed(packet)) => packet,
                    }
                }
                _ => packet,
            }
        };

        let (tx, rx) = mpsc::channel(PEER_QUEUE_LEN);
        let conn = PeerConn {
            socket: self.socket.clone(),
            peer,
            rx: tokio::sync::Mutex::new(rx),
        };
        let tunnel = Arc::new(TunnelConn::new(conn, &self.config)?);
        let remote = Arc::new(
            UdpConn::connect(self.config.remote_addr)
                .await
                .with_context(|| format!("failed to connect to {}", self.config.remote_addr))?,
        );
        log_tunnel(peer, self.local_addr()?, remote.local_addr(), remote.peer_addr());

        let activity = Activity::new();
        let forward = tokio::spawn(tunnel_to_remote(tunnel.clone(), remote.clone(), peer));
        let reverse = tokio::spawn(remote_to_tunnel(remote, tunnel, peer, activity.clone()));

        if let Err(e) = tx.try_send(packet) {
            log::debug!("first packet from {} not queued: {}", peer, e);
        }
        self.sessions.write().await.insert(
            peer,
            Session {
                input: tx,
                activity,
                tasks: vec![forward, reverse],
            },
        );
        Ok(())
    }
}

async fn tunnel_to_remote(tunnel: Arc<TunnelConn<PeerConn>>, remote: Arc<UdpConn>, peer: SocketAddr) {
    loop {
        let payload = match tunnel.read_datagram().await {
            Ok(payload) => payload,
            Err(e) => {
                log::debug!("tunnel from {} closed: {}", peer, e);
                break;
            }
        };
        match remote.write_packet(&payload).await {
            Ok(_) => {}
            Err(e) if e.is_transient() => {
                log::debug!("forward from {}: {}", peer, e);
            }
            Err(e) => {
                log::error!("failed to forward from {}: {}", peer, e);
                break;
            }
        }
    }
}

async fn remote_to_tunnel(
    remote: Arc<UdpConn>,
    tunnel: Arc<TunnelConn<PeerConn>>,
    peer: SocketAddr,
    activity: Arc<Activity>,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    loop {
        let len = match remote.read_packet(&mut buf).await {
            Ok(len) => len,
            Err(e) if e.is_transient() => {
                log::debug!("remote for {}: {}", peer, e);
                continue;
            }
            Err(e) => {
                log::error!("error receiving from remote for {}: {}", peer, e);
                break;
            }
        };
        activity.touch();
        match tunnel.write(&buf[..len]).await {
            Ok(_) => {}
            Err(e @ TunnelError::PayloadTooLarge { .. }) => {
                log::warn!("dropping reply to {}: {}", peer, e);
            }
            Err(e) => {
                log::error!("tunnel write to {} failed: {}", peer, e);
                break;
            }
        }
    }
}

struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}
