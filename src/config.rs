//! Tunnel configuration

use crate::crypto::{Method, SecureFramer};
use crate::error::{Result, TunnelError};
use crate::fec::{FEC_OVERHEAD, MAX_TOTAL_SHARDS};
use crate::replay::MIN_DEDUP_WINDOW;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Bytes of packet identity appended to every datagram
pub const PACKET_ID_LEN: usize = 8;

/// Largest MTU a UDP datagram can honour
pub const MAX_MTU: usize = 65535;

/// Operating mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelMode {
    /// Listen for plain UDP locally, tunnel it to a server
    #[serde(alias = "local")]
    Client,
    /// Accept tunnel traffic, forward plain UDP to the remote address
    Server,
}

/// One tunnel endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelConfig {
    pub mode: TunnelMode,

    /// Address to listen on
    pub local_addr: SocketAddr,

    /// Client: tunnel server. Server: where plain traffic is forwarded.
    pub remote_addr: SocketAddr,

    /// Cipher method name, e.g. `chacha20` or `aes-128-gcm`
    pub method: String,

    /// Pre-shared password
    pub password: String,

    /// Largest wire packet, framing included
    pub mtu: usize,

    /// FEC data shards per group (K); 0 disables FEC
    pub data_shards: usize,

    /// FEC parity shards per group (M); 0 disables FEC
    pub parity_shards: usize,

    /// Append an HMAC to stream-cipher packets
    pub authenticated: bool,

    /// Idle time before a relay session is dropped
    #[serde(with = "humantime_serde")]
    pub expires: Duration,

    /// Shard groups the FEC decoder keeps open
    pub fec_group_window: u32,

    /// Packet identity dedup window (W)
    pub dedup_window: usize,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            mode: TunnelMode::Client,
            local_addr: SocketAddr::from(([127, 0, 0, 1], 1080)),
            remote_addr: SocketAddr::from(([127, 0, 0, 1], 8388)),
            method: "chacha20".to_string(),
            password: "123".to_string(),
            mtu: 1400,
            data_shards: 0,
            parity_shards: 0,
            authenticated: false,
            expires: Duration::from_secs(60),
            fec_group_window: crate::fec::DEFAULT_GROUP_WINDOW,
            dedup_window: crate::replay::DEFAULT_DEDUP_WINDOW,
        }
    }
}

/// File layout: either one table of fields, or a `[[tunnel]]` array
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ConfigFile {
    Many { tunnel: Vec<TunnelConfig> },
    One(TunnelConfig),
}

impl TunnelConfig {
    /// Load every tunnel described by a TOML file
    pub fn from_file(path: &Path) -> anyhow::Result<Vec<Self>> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> anyhow::Result<Vec<Self>> {
        let configs = match toml::from_str::<ConfigFile>(contents)? {
            ConfigFile::Many { tunnel } => tunnel,
            ConfigFile::One(config) => vec![config],
        };
        Ok(configs)
    }

    /// Parsed cipher method
    pub fn cipher_method(&self) -> Result<Method> {
        self.method.parse()
    }

    /// FEC runs only when both shard counts are set
    pub fn fec_enabled(&self) -> bool {
        self.data_shards != 0 && self.parity_shards != 0
    }

    /// Bytes added to each payload before it reaches the framer
    pub fn tunnel_overhead(&self) -> usize {
        if self.fec_enabled() {
            PACKET_ID_LEN + FEC_OVERHEAD
        } else {
            PACKET_ID_LEN
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        let method = self.cipher_method()?;

        if self.mtu > MAX_MTU {
            return Err(TunnelError::config(format!(
                "mtu {} exceeds {}",
                self.mtu, MAX_MTU
            )));
        }

        // Framing, identity and shard headers all have to fit; no keys are
        // derived here.
        let overhead = SecureFramer::overhead_for(method, self.authenticated);
        if self.mtu <= overhead + self.tunnel_overhead() {
            return Err(TunnelError::config(format!(
                "mtu {} leaves no room for payload",
                self.mtu
            )));
        }

        if self.fec_enabled() && self.data_shards + self.parity_shards > MAX_TOTAL_SHARDS {
            return Err(TunnelError::config(format!(
                "{} data + {} parity shards exceeds {}",
                self.data_shards, self.parity_shards, MAX_TOTAL_SHARDS
            )));
        }

        if self.fec_enabled() && self.fec_group_window == 0 {
            return Err(TunnelError::config("fec_group_window must be at least 1"));
        }

        if self.dedup_window < MIN_DEDUP_WINDOW || !self.dedup_window.is_power_of_two() {
            return Err(TunnelError::config(format!(
                "dedup_window {} must be a power of two no smaller than {}",
                self.dedup_window, MIN_DEDUP_WINDOW
            )));
        }

        Ok(())
    }

    pub fn print(&self) {
        log::info!("mode: {:?}", self.mode);
        log::info!("local address: {}", self.local_addr);
        log::info!("remote address: {}", self.remote_addr);
        log::info!("method: {}", self.method);
        log::info!("mtu: {}", self.mtu);
        if self.fec_enabled() {
            log::info!("fec: {} data / {} parity shards", self.data_shards, self.parity_shards);
        }
        log::info!("expires: {}", humantime::format_duration(self.expires));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TunnelConfig::default();
        assert_eq!(config.mode, TunnelMode::Client);
        assert_eq!(config.method, "chacha20");
        assert_eq!(config.password, "123");
        assert_eq!(config.mtu, 1400);
        assert!(!config.fec_enabled());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_single_table() {
        let configs = TunnelConfig::from_toml(
            r#"
            mode = "server"
            local_addr = "0.0.0.0:4000"
            remote_addr = "127.0.0.1:53"
            method = "aes-128-gcm"
            data_shards = 10
            parity_shards = 3
            expires = "2m"
            "#,
        )
        .unwrap();

        assert_eq!(configs.len(), 1);
        let config = &configs[0];
        assert_eq!(config.mode, TunnelMode::Server);
        assert_eq!(config.cipher_method().unwrap(), Method::Aes128Gcm);
        assert!(config.fec_enabled());
        assert_eq!(config.expires, Duration::from_secs(120));
        assert_eq!(config.password, "123");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_tunnel_array() {
        let configs = TunnelConfig::from_toml(
            r#"
            [[tunnel]]
            mode = "local"
            local_addr = "127.0.0.1:5353"

            [[tunnel]]
            mode = "server"
            password = "other"
            "#,
        )
        .unwrap();

        assert_eq!(configs.len(), 2);
        assert_eq!(configs[0].mode, TunnelMode::Client);
        assert_eq!(configs[0].local_addr.port(), 5353);
        assert_eq!(configs[1].mode, TunnelMode::Server);
        assert_eq!(configs[1].password, "other");
    }

    #[test]
    fn test_validation_rejects() {
        let mut config = TunnelConfig::default();
        config.method = "des".to_string();
        assert!(matches!(config.validate(), Err(TunnelError::UnsupportedMethod(_))));

        let mut config = TunnelConfig::default();
        config.mtu = 70000;
        assert!(config.validate().is_err());

        let mut config = TunnelConfig::default();
        config.mtu = 16;
        assert!(config.validate().is_err());

        let mut config = TunnelConfig::default();
        config.data_shards = 200;
        config.parity_shards = 56;
        assert!(config.validate().is_err());

        let mut config = TunnelConfig::default();
        config.dedup_window = 1000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_mtu_boundary() {
        let mut config = TunnelConfig {
            method: "aes-128-cfb".to_string(),
            authenticated: true,
            data_shards: 2,
            parity_shards: 1,
            ..TunnelConfig::default()
        };
        // 16 IV + 16 MAC + 8 identity + 10 shard
        config.mtu = 50;
        assert!(config.validate().is_err());
        config.mtu = 51;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_half_configured_fec_is_disabled() {
        let mut config = TunnelConfig::default();
        config.data_shards = 4;
        assert!(!config.fec_enabled());
        assert_eq!(config.tunnel_overhead(), PACKET_ID_LEN);
        assert!(config.validate().is_ok());
    }
}
