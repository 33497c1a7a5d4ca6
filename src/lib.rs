//! shardtun: encrypted UDP tunnel with forward error correction
//!
//! Every datagram handed to a [`TunnelConn`] is tagged with a packet
//! identity, optionally spread over a Reed-Solomon shard group, and sealed
//! into its own wire packet. The receiving side opens, rebuilds lost shards
//! from parity, drops duplicates and hands the payload back unchanged.
//!
//! ## Features
//!
//! - **Cipher methods**: `chacha20`, `chacha20-ietf`, `salsa20`,
//!   `aes-{128,192,256}-{cfb,ctr,gcm}`, `rc4-md5`, `chacha20-poly1305`, `none`
//! - **Authentication**: AEAD tags, or HMAC-MD5 on stream ciphers with `auth`
//! - **FEC**: K data + M parity shards per group, any K rebuild the group
//! - **Replay protection**: sliding window over 64-bit packet identities
//! - **Relays**: UDP client and server ends with idle session expiry
//!
//! ## Quick Start
//!
//! ### As a Library
//!
//! ```rust,no_run
//! use shardtun::{MemoryConn, TunnelConfig, TunnelConn};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), shardtun::TunnelError> {
//!     let config = TunnelConfig {
//!         method: "aes-256-gcm".into(),
//!         data_shards: 10,
//!         parity_shards: 3,
//!         ..TunnelConfig::default()
//!     };
//!
//!     let (a, b) = MemoryConn::pair();
//!     let left = TunnelConn::new(a, &config)?;
//!     let right = TunnelConn::new(b, &config)?;
//!
//!     left.write(b"hello").await?;
//!     let payload = right.read_datagram().await?;
//!     assert_eq!(payload, b"hello");
//!     Ok(())
//! }
//! ```
//!
//! ### As a Command-Line Tool
//!
//! ```bash
//! # Server: tunnel in on :4000, plain UDP out to a DNS resolver
//! shardtun server -l 0.0.0.0:4000 -r 8.8.8.8:53 --method aes-128-gcm --ds 10 --ps 3
//!
//! # Client: plain UDP in on :5353, tunnelled to the server
//! shardtun client -l 127.0.0.1:5353 -r server.example:4000 --method aes-128-gcm --ds 10 --ps 3
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌──────────────┐   wire   ┌──────────────┐     ┌─────────────┐
//! │ Application │────▶│ ClientRelay  │─────────▶│ ServerRelay  │────▶│   Remote    │
//! └─────────────┘     └──────────────┘          └──────────────┘     └─────────────┘
//!                            │
//!                            ▼
//!          TunnelConn ─▶ FecEncoder ─▶ SecureConn ─▶ PacketConn
//! ```

pub mod config;
pub mod conn;
pub mod crypto;
pub mod error;
pub mod fec;
pub mod relay;
pub mod replay;
pub mod transport;

// Re-export core types
pub use config::{TunnelConfig, TunnelMode, PACKET_ID_LEN};
pub use conn::{SecureConn, TunnelConn};
pub use crypto::{CipherMode, Decoded, DiscardReason, Method, SecureFramer};
pub use error::{Result, TunnelError};
pub use fec::{ErasureCoder, FecDecoder, FecEncoder, FecStats, ReedSolomon};
pub use relay::{ClientRelay, ServerRelay};
pub use replay::PacketIdentityWindow;
pub use transport::{MemoryConn, PacketConn, UdpConn};
