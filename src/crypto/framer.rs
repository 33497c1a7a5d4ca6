//! Per-datagram secure framing
//!
//! One logical datagram becomes exactly one wire packet:
//!
//! ```text
//! StreamOnly:     [ IV | ciphertext ]
//! StreamWithMac:  [ IV | ciphertext | HMAC-MD5(IV | ciphertext) ]
//! Aead:           [ nonce | ciphertext | tag ]
//! ```
//!
//! IVs and nonces are freshly random for every packet. Opening never fails
//! loudly on bad input; it returns a [`Decoded::Discarded`] verdict so the
//! read loop can drop the packet and keep the session alive.

use super::kdf::KeyMaterial;
use super::method::{CipherMode, Method};
use super::stream::{Direction, StreamKey};
use crate::error::{Result, TunnelError};
use hmac::{Hmac, Mac};
use md5::Md5;
use rand::rngs::OsRng;
use rand::RngCore;
use ring::aead::{self, Aad, LessSafeKey, Nonce, UnboundKey};
use std::fmt;

type HmacMd5 = Hmac<Md5>;

/// HMAC-MD5 tag length
pub const MAC_LEN: usize = 16;

/// Nonce length shared by every supported AEAD
pub const AEAD_NONCE_LEN: usize = 12;

/// Authentication tag length shared by every supported AEAD
pub const AEAD_TAG_LEN: usize = 16;

/// Why a wire packet was dropped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscardReason {
    /// Larger than the configured MTU
    Oversize,
    /// Shorter than the fixed framing overhead
    Truncated,
    /// HMAC did not match
    BadMac,
    /// AEAD authentication failed
    OpenFailed,
    /// FEC shard header is malformed or inconsistent
    BadShardHeader,
    /// Shard belongs to a group that already left the window
    StaleShard,
    /// Shard claims a group far ahead of the window, unconfirmed
    FutureShard,
}

impl fmt::Display for DiscardReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DiscardReason::Oversize => "oversize",
            DiscardReason::Truncated => "truncated",
            DiscardReason::BadMac => "bad mac",
            DiscardReason::OpenFailed => "aead open failed",
            DiscardReason::BadShardHeader => "bad shard header",
            DiscardReason::StaleShard => "stale shard",
            DiscardReason::FutureShard => "future shard",
        };
        f.write_str(s)
    }
}

/// Outcome of opening one wire packet
#[derive(Debug)]
pub enum Decoded {
    Accepted(Vec<u8>),
    Discarded(DiscardReason),
    /// Not caused by the packet; the connection cannot continue
    Fatal(TunnelError),
}

/// Encrypts and authenticates single datagrams
pub struct SecureFramer {
    method: Method,
    mode: CipherMode,
    mtu: usize,
    stream_key: Option<StreamKey>,
    key: Option<KeyMaterial>,
}

impl SecureFramer {
    /// Build a framer; derives key material once when the mode needs it
    pub fn new(method: Method, password: &str, mtu: usize, authenticated: bool) -> Result<Self> {
        let mode = method.mode(authenticated);
        let overhead = Self::overhead_for(method, authenticated);
        if overhead >= mtu {
            return Err(TunnelError::config(format!(
                "mtu {} leaves no room for payload ({} bytes of {} overhead)",
                mtu, overhead, method
            )));
        }

        let stream_key = match mode {
            CipherMode::Aead => None,
            _ => Some(StreamKey::new(method, password)?),
        };
        let key = match mode {
            CipherMode::StreamOnly => None,
            _ => Some(KeyMaterial::derive(password)?),
        };

        let framer = Self {
            method,
            mode,
            mtu,
            stream_key,
            key,
        };

        log::debug!("secure framer: method={} mode={:?} mtu={}", method, mode, mtu);
        Ok(framer)
    }

    pub fn method(&self) -> Method {
        self.method
    }

    pub fn mode(&self) -> CipherMode {
        self.mode
    }

    pub fn mtu(&self) -> usize {
        self.mtu
    }

    /// Fixed bytes added to every payload
    pub fn overhead(&self) -> usize {
        Self::overhead_for(self.method, self.mode == CipherMode::StreamWithMac)
    }

    /// Framing overhead of `method` without deriving any keys
    pub fn overhead_for(method: Method, authenticated: bool) -> usize {
        match method.mode(authenticated) {
            CipherMode::StreamOnly => method.iv_len(),
            CipherMode::StreamWithMac => method.iv_len() + MAC_LEN,
            CipherMode::Aead => AEAD_NONCE_LEN + AEAD_TAG_LEN,
        }
    }

    /// Largest payload that still fits in one MTU
    pub fn max_payload(&self) -> usize {
        self.mtu - self.overhead()
    }

    /// Frame `payload` into a new wire packet
    pub fn seal(&self, payload: &[u8]) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(payload.len() + self.overhead());
        self.seal_into(payload, &mut out)?;
        Ok(out)
    }

    /// Frame `payload` into `out`, replacing its contents
    pub fn seal_into(&self, payload: &[u8], out: &mut Vec<u8>) -> Result<()> {
        let size = payload.len() + self.overhead();
        if size > self.mtu {
            return Err(TunnelError::PayloadTooLarge {
                size,
                mtu: self.mtu,
            });
        }

        out.clear();
        match self.mode {
            CipherMode::StreamOnly | CipherMode::StreamWithMac => self.seal_stream(payload, out),
            CipherMode::Aead => self.seal_aead(payload, out),
        }
    }

    fn seal_stream(&self, payload: &[u8], out: &mut Vec<u8>) -> Result<()> {
        let stream_key = self.stream_key()?;
        let iv_len = self.method.iv_len();

        out.resize(iv_len, 0);
        OsRng.fill_bytes(&mut out[..iv_len]);
        out.extend_from_slice(payload);

        let (iv, body) = out.split_at_mut(iv_len);
        stream_key.apply(iv, body, Direction::Encrypt)?;

        if self.mode == CipherMode::StreamWithMac {
            let tag = self.compute_mac(out)?;
            out.extend_from_slice(&tag);
        }
        Ok(())
    }

    fn seal_aead(&self, payload: &[u8], out: &mut Vec<u8>) -> Result<()> {
        let key = self.aead_key()?;

        let mut nonce = [0u8; AEAD_NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);

        let mut sealed = payload.to_vec();
        key.seal_in_place_append_tag(Nonce::assume_unique_for_key(nonce), Aad::empty(), &mut sealed)
            .map_err(|_| TunnelError::crypto("aead seal failed"))?;

        out.extend_from_slice(&nonce);
        out.extend_from_slice(&sealed);
        Ok(())
    }

    /// Authenticate and decrypt one wire packet
    pub fn open(&self, packet: &[u8]) -> Decoded {
        if packet.len() > self.mtu {
            return Decoded::Discarded(DiscardReason::Oversize);
        }

        let result = match self.mode {
            CipherMode::StreamOnly | CipherMode::StreamWithMac => self.open_stream(packet),
            CipherMode::Aead => self.open_aead(packet),
        };
        match result {
            Ok(decoded) => decoded,
            Err(e) => Decoded::Fatal(e),
        }
    }

    fn open_stream(&self, packet: &[u8]) -> Result<Decoded> {
        let stream_key = self.stream_key()?;

        let mut body = packet;
        if self.mode == CipherMode::StreamWithMac {
            if body.len() < MAC_LEN {
                return Ok(Decoded::Discarded(DiscardReason::Truncated));
            }
            let (message, tag) = body.split_at(body.len() - MAC_LEN);
            if !self.verify_mac(message, tag)? {
                return Ok(Decoded::Discarded(DiscardReason::BadMac));
            }
            body = message;
        }

        let iv_len = self.method.iv_len();
        if body.len() < iv_len {
            return Ok(Decoded::Discarded(DiscardReason::Truncated));
        }

        let (iv, ciphertext) = body.split_at(iv_len);
        let mut plaintext = ciphertext.to_vec();
        stream_key.apply(iv, &mut plaintext, Direction::Decrypt)?;
        Ok(Decoded::Accepted(plaintext))
    }

    fn open_aead(&self, packet: &[u8]) -> Result<Decoded> {
        let key = self.aead_key()?;

        if packet.len() < AEAD_NONCE_LEN + AEAD_TAG_LEN {
            return Ok(Decoded::Discarded(DiscardReason::Truncated));
        }

        let (nonce, sealed) = packet.split_at(AEAD_NONCE_LEN);
        let nonce = match Nonce::try_assume_unique_for_key(nonce) {
            Ok(nonce) => nonce,
            Err(_) => return Ok(Decoded::Discarded(DiscardReason::OpenFailed)),
        };

        let mut buf = sealed.to_vec();
        let len = match key.open_in_place(nonce, Aad::empty(), &mut buf) {
            Ok(plaintext) => plaintext.len(),
            Err(_) => return Ok(Decoded::Discarded(DiscardReason::OpenFailed)),
        };
        buf.truncate(len);
        Ok(Decoded::Accepted(buf))
    }

    // Built fresh per call; no mutable hash state is shared between packets.
    fn compute_mac(&self, message: &[u8]) -> Result<[u8; MAC_LEN]> {
        let mut mac = self.new_mac()?;
        mac.update(message);
        let mut tag = [0u8; MAC_LEN];
        tag.copy_from_slice(&mac.finalize().into_bytes());
        Ok(tag)
    }

    fn verify_mac(&self, message: &[u8], tag: &[u8]) -> Result<bool> {
        let mut mac = self.new_mac()?;
        mac.update(message);
        Ok(mac.verify_slice(tag).is_ok())
    }

    fn new_mac(&self) -> Result<HmacMd5> {
        let key = self.key_material()?;
        <HmacMd5 as Mac>::new_from_slice(key.as_bytes())
            .map_err(|_| TunnelError::crypto("invalid hmac key"))
    }

    // Every AES-GCM name uses AES-128 keyed with the first 16 bytes, which
    // is what deployed peers speak.
    fn aead_key(&self) -> Result<LessSafeKey> {
        let key = self.key_material()?;
        let (algorithm, key_len) = match self.method {
            Method::ChaCha20Poly1305 => (&aead::CHACHA20_POLY1305, 32),
            Method::Aes128Gcm | Method::Aes192Gcm | Method::Aes256Gcm => (&aead::AES_128_GCM, 16),
            other => {
                return Err(TunnelError::crypto(format!("{} is not an aead method", other)));
            }
        };
        let unbound = UnboundKey::new(algorithm, key.prefix(key_len)?)
            .map_err(|_| TunnelError::crypto("invalid aead key"))?;
        Ok(LessSafeKey::new(unbound))
    }

    fn stream_key(&self) -> Result<&StreamKey> {
        self.stream_key
            .as_ref()
            .ok_or_else(|| TunnelError::crypto("stream key missing"))
    }

    fn key_material(&self) -> Result<&KeyMaterial> {
        self.key
            .as_ref()
            .ok_or_else(|| TunnelError::crypto("key material missing"))
    }
}

impl fmt::Debug for SecureFramer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecureFramer")
            .field("method", &self.method)
            .field("mode", &self.mode)
            .field("mtu", &self.mtu)
            .finish()
    }
}
