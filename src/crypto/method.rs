//! Cipher method registry
//!
//! Maps the configured method name onto key/IV sizes and the framing mode
//! used on the wire.

use crate::error::{Result, TunnelError};
use std::fmt;
use std::str::FromStr;

/// Framing mode, fixed for the life of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherMode {
    /// `IV ∥ ciphertext`
    StreamOnly,
    /// `IV ∥ ciphertext ∥ HMAC-MD5(IV ∥ ciphertext)`
    StreamWithMac,
    /// `nonce ∥ ciphertext ∥ tag`
    Aead,
}

/// Supported cipher methods
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    /// Passthrough, no encryption
    None,
    /// Original ChaCha20 with a 64-bit IV
    ChaCha20,
    /// IETF ChaCha20 with a 96-bit IV
    ChaCha20Ietf,
    Salsa20,
    Aes128Cfb,
    Aes192Cfb,
    Aes256Cfb,
    Aes128Ctr,
    Aes192Ctr,
    Aes256Ctr,
    Rc4Md5,
    Aes128Gcm,
    Aes192Gcm,
    Aes256Gcm,
    ChaCha20Poly1305,
}

impl Method {
    /// All known methods, in name order of the CLI help
    pub const ALL: [Method; 15] = [
        Method::None,
        Method::ChaCha20,
        Method::ChaCha20Ietf,
        Method::Salsa20,
        Method::Aes128Cfb,
        Method::Aes192Cfb,
        Method::Aes256Cfb,
        Method::Aes128Ctr,
        Method::Aes192Ctr,
        Method::Aes256Ctr,
        Method::Rc4Md5,
        Method::Aes128Gcm,
        Method::Aes192Gcm,
        Method::Aes256Gcm,
        Method::ChaCha20Poly1305,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::None => "none",
            Method::ChaCha20 => "chacha20",
            Method::ChaCha20Ietf => "chacha20-ietf",
            Method::Salsa20 => "salsa20",
            Method::Aes128Cfb => "aes-128-cfb",
            Method::Aes192Cfb => "aes-192-cfb",
            Method::Aes256Cfb => "aes-256-cfb",
            Method::Aes128Ctr => "aes-128-ctr",
            Method::Aes192Ctr => "aes-192-ctr",
            Method::Aes256Ctr => "aes-256-ctr",
            Method::Rc4Md5 => "rc4-md5",
            Method::Aes128Gcm => "aes-128-gcm",
            Method::Aes192Gcm => "aes-192-gcm",
            Method::Aes256Gcm => "aes-256-gcm",
            Method::ChaCha20Poly1305 => "chacha20-poly1305",
        }
    }

    pub fn is_aead(&self) -> bool {
        matches!(
            self,
            Method::Aes128Gcm | Method::Aes192Gcm | Method::Aes256Gcm | Method::ChaCha20Poly1305
        )
    }

    /// Stream cipher key length, derived from the password per method
    pub fn key_len(&self) -> usize {
        match self {
            Method::None => 0,
            Method::Aes128Cfb | Method::Aes128Ctr | Method::Rc4Md5 => 16,
            Method::Aes192Cfb | Method::Aes192Ctr => 24,
            Method::ChaCha20
            | Method::ChaCha20Ietf
            | Method::Salsa20
            | Method::Aes256Cfb
            | Method::Aes256Ctr => 32,
            // AEAD keys come from the PBKDF2 key material instead.
            Method::Aes128Gcm | Method::Aes192Gcm | Method::Aes256Gcm => 16,
            Method::ChaCha20Poly1305 => 32,
        }
    }

    /// IV length for the stream methods; zero for AEAD and passthrough
    pub fn iv_len(&self) -> usize {
        match self {
            Method::None => 0,
            Method::ChaCha20 | Method::Salsa20 => 8,
            Method::ChaCha20Ietf => 12,
            Method::Aes128Cfb
            | Method::Aes192Cfb
            | Method::Aes256Cfb
            | Method::Aes128Ctr
            | Method::Aes192Ctr
            | Method::Aes256Ctr
            | Method::Rc4Md5 => 16,
            Method::Aes128Gcm | Method::Aes192Gcm | Method::Aes256Gcm | Method::ChaCha20Poly1305 => 0,
        }
    }

    /// Framing mode for this method
    pub fn mode(&self, authenticated: bool) -> CipherMode {
        if self.is_aead() {
            CipherMode::Aead
        } else if authenticated {
            CipherMode::StreamWithMac
        } else {
            CipherMode::StreamOnly
        }
    }
}

impl FromStr for Method {
    type Err = TunnelError;

    fn from_str(s: &str) -> Result<Self> {
        let name = s.trim().to_ascii_lowercase();
        Method::ALL
            .iter()
            .copied()
            .find(|m| m.as_str() == name)
            .ok_or_else(|| TunnelError::UnsupportedMethod(s.to_string()))
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_names() {
        for method in Method::ALL {
            assert_eq!(method.as_str().parse::<Method>().unwrap(), method);
        }
        assert_eq!("AES-256-GCM".parse::<Method>().unwrap(), Method::Aes256Gcm);
        assert!(matches!(
            "blowfish".parse::<Method>(),
            Err(TunnelError::UnsupportedMethod(_))
        ));
    }

    #[test]
    fn test_mode_selection() {
        assert_eq!(Method::ChaCha20.mode(false), CipherMode::StreamOnly);
        assert_eq!(Method::ChaCha20.mode(true), CipherMode::StreamWithMac);
        assert_eq!(Method::None.mode(true), CipherMode::StreamWithMac);
        assert_eq!(Method::Aes128Gcm.mode(false), CipherMode::Aead);
        // authenticated is meaningless for AEAD methods
        assert_eq!(Method::ChaCha20Poly1305.mode(true), CipherMode::Aead);
    }

    #[test]
    fn test_iv_lengths() {
        assert_eq!(Method::ChaCha20.iv_len(), 8);
        assert_eq!(Method::ChaCha20Ietf.iv_len(), 12);
        assert_eq!(Method::Aes192Cfb.iv_len(), 16);
        assert_eq!(Method::Aes256Gcm.iv_len(), 0);
        assert_eq!(Method::None.iv_len(), 0);
    }
}
