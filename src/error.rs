//! Error types for the tunnel core.

use thiserror::Error;

/// Result type alias for tunnel operations.
pub type Result<T> = std::result::Result<T, TunnelError>;

/// Errors surfaced to callers of the tunnel layers.
///
/// Malformed, forged or duplicated packets never show up here: the read
/// path discards them and keeps reading (see [`crate::crypto::Decoded`]).
#[derive(Error, Debug)]
pub enum TunnelError {
    /// The framed packet would not fit in one MTU-sized datagram
    #[error("payload too large: {size} bytes framed, mtu is {mtu}")]
    PayloadTooLarge { size: usize, mtu: usize },

    /// The underlying transport failed to read or write
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// The transport was closed by the other side of a local pipe
    #[error("transport closed")]
    Closed,

    /// Key material could not be derived from the password
    #[error("key derivation failed: {0}")]
    KeyDerivation(String),

    /// The configured cipher method is not known
    #[error("unsupported method: {0}")]
    UnsupportedMethod(String),

    /// Invalid configuration value
    #[error("configuration error: {0}")]
    Config(String),

    /// A cipher instance could not be constructed
    #[error("cryptographic error: {0}")]
    Crypto(String),

    /// The erasure coder rejected a shard group
    #[error("fec error: {0}")]
    Fec(#[from] crate::fec::ErasureError),
}

impl TunnelError {
    /// Create a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        TunnelError::Config(msg.into())
    }

    /// Create a new cryptographic error
    pub fn crypto(msg: impl Into<String>) -> Self {
        TunnelError::Crypto(msg.into())
    }

    /// Errors raised while building a connection; fatal to setup
    pub fn is_setup_error(&self) -> bool {
        matches!(
            self,
            TunnelError::KeyDerivation(_) | TunnelError::UnsupportedMethod(_) | TunnelError::Config(_)
        )
    }

    /// Errors that mean the transport beneath the tunnel is gone
    pub fn is_transport_failure(&self) -> bool {
        matches!(self, TunnelError::Transport(_) | TunnelError::Closed)
    }

    /// Socket errors reported for an earlier datagram, such as ICMP port
    /// unreachable on a connected UDP socket; the socket itself still works
    pub fn is_transient(&self) -> bool {
        match self {
            TunnelError::Transport(e) => matches!(
                e.kind(),
                std::io::ErrorKind::ConnectionRefused | std::io::ErrorKind::ConnectionReset
            ),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = TunnelError::PayloadTooLarge { size: 1401, mtu: 1400 };
        assert_eq!(err.to_string(), "payload too large: 1401 bytes framed, mtu is 1400");

        let err = TunnelError::UnsupportedMethod("des-cbc".into());
        assert_eq!(err.to_string(), "unsupported method: des-cbc");
    }

    #[test]
    fn test_error_classes() {
        assert!(TunnelError::config("bad mtu").is_setup_error());
        assert!(TunnelError::KeyDerivation("x".into()).is_setup_error());
        assert!(!TunnelError::Closed.is_setup_error());

        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        assert!(TunnelError::from(io).is_transport_failure());
        assert!(TunnelError::Closed.is_transport_failure());
        assert!(!TunnelError::crypto("x").is_transport_failure());
    }

    #[test]
    fn test_transient_errors() {
        let refused = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        assert!(TunnelError::from(refused).is_transient());

        let denied = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        assert!(!TunnelError::from(denied).is_transient());
        assert!(!TunnelError::Closed.is_transient());
    }
}
