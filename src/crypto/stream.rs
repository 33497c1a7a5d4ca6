//! Legacy stream ciphers
//!
//! Every packet carries its own random IV, so a fresh cipher instance is
//! built per packet from the password-derived stream key and that IV.

use super::kdf::evp_bytes_to_key;
use super::method::Method;
use crate::error::{Result, TunnelError};
use aes::{Aes128, Aes192, Aes256};
use chacha20::{ChaCha20, ChaCha20Legacy};
use cipher::consts::U16;
use cipher::{AsyncStreamCipher, KeyInit, KeyIvInit, StreamCipher};
use md5::{Digest, Md5};
use rc4::Rc4;
use salsa20::Salsa20;

type Aes128Ctr = ctr::Ctr128BE<Aes128>;
type Aes192Ctr = ctr::Ctr128BE<Aes192>;
type Aes256Ctr = ctr::Ctr128BE<Aes256>;

// CFB keeps separate encryptor/decryptor types.
macro_rules! cfb {
    ($block:ty, $key:expr, $iv:expr, $buf:expr, $direction:expr) => {
        match $direction {
            Direction::Encrypt => cfb_mode::Encryptor::<$block>::new_from_slices($key, $iv)
                .map(|c| c.encrypt($buf))
                .map_err(invalid_length),
            Direction::Decrypt => cfb_mode::Decryptor::<$block>::new_from_slices($key, $iv)
                .map(|c| c.decrypt($buf))
                .map_err(invalid_length),
        }
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Encrypt,
    Decrypt,
}

/// Password-derived key for one stream method
#[derive(Clone)]
pub struct StreamKey {
    method: Method,
    key: Vec<u8>,
}

impl StreamKey {
    pub fn new(method: Method, password: &str) -> Result<Self> {
        if method.is_aead() {
            return Err(TunnelError::crypto(format!(
                "{} is not a stream method",
                method
            )));
        }
        Ok(Self {
            method,
            key: evp_bytes_to_key(password.as_bytes(), method.key_len()),
        })
    }

    pub fn method(&self) -> Method {
        self.method
    }

    /// Encrypt or decrypt `buf` in place under `iv`
    pub fn apply(&self, iv: &[u8], buf: &mut [u8], direction: Direction) -> Result<()> {
        if iv.len() != self.method.iv_len() {
            return Err(TunnelError::crypto(format!(
                "{} expects a {}-byte iv, got {}",
                self.method,
                self.method.iv_len(),
                iv.len()
            )));
        }

        let key = self.key.as_slice();
        match self.method {
            Method::None => Ok(()),
            Method::ChaCha20 => xor::<ChaCha20Legacy>(key, iv, buf),
            Method::ChaCha20Ietf => xor::<ChaCha20>(key, iv, buf),
            Method::Salsa20 => xor::<Salsa20>(key, iv, buf),
            Method::Aes128Ctr => xor::<Aes128Ctr>(key, iv, buf),
            Method::Aes192Ctr => xor::<Aes192Ctr>(key, iv, buf),
            Method::Aes256Ctr => xor::<Aes256Ctr>(key, iv, buf),
            Method::Aes128Cfb => cfb!(Aes128, key, iv, buf, direction),
            Method::Aes192Cfb => cfb!(Aes192, key, iv, buf, direction),
            Method::Aes256Cfb => cfb!(Aes256, key, iv, buf, direction),
            Method::Rc4Md5 => {
                let mut hasher = Md5::new();
                hasher.update(key);
                hasher.update(iv);
                let session_key = hasher.finalize();
                let mut rc4 = Rc4::<U16>::new_from_slice(&session_key).map_err(invalid_length)?;
                rc4.apply_keystream(buf);
                Ok(())
            }
            Method::Aes128Gcm | Method::Aes192Gcm | Method::Aes256Gcm | Method::ChaCha20Poly1305 => {
                Err(TunnelError::crypto("aead method used as stream cipher"))
            }
        }
    }
}

fn xor<C: KeyIvInit + StreamCipher>(key: &[u8], iv: &[u8], buf: &mut [u8]) -> Result<()> {
    let mut cipher = C::new_from_slices(key, iv).map_err(invalid_length)?;
    cipher.apply_keystream(buf);
    Ok(())
}

fn invalid_length<E: std::fmt::Display>(e: E) -> TunnelError {
    TunnelError::crypto(format!("invalid key or iv length: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream_methods() -> impl Iterator<Item = Method> {
        Method::ALL.into_iter().filter(|m| !m.is_aead())
    }

    #[test]
    fn test_roundtrip_all_methods() {
        let plaintext: Vec<u8> = (0..=255u8).cycle().take(777).collect();

        for method in stream_methods() {
            let key = StreamKey::new(method, "123").unwrap();
            let iv = vec![0x5a; method.iv_len()];

            let mut buf = plaintext.clone();
            key.apply(&iv, &mut buf, Direction::Encrypt).unwrap();
            if method != Method::None {
                assert_ne!(buf, plaintext, "{} left plaintext unchanged", method);
            }
            key.apply(&iv, &mut buf, Direction::Decrypt).unwrap();
            assert_eq!(buf, plaintext, "{} failed to roundtrip", method);
        }
    }

    #[test]
    fn test_iv_changes_ciphertext() {
        let key = StreamKey::new(Method::Aes256Cfb, "pw").unwrap();
        let mut a = vec![0u8; 64];
        let mut b = vec![0u8; 64];
        key.apply(&[1u8; 16], &mut a, Direction::Encrypt).unwrap();
        key.apply(&[2u8; 16], &mut b, Direction::Encrypt).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_wrong_iv_length() {
        let key = StreamKey::new(Method::ChaCha20, "pw").unwrap();
        let mut buf = vec![0u8; 8];
        assert!(key.apply(&[0u8; 12], &mut buf, Direction::Encrypt).is_err());
    }

    #[test]
    fn test_rejects_aead_method() {
        assert!(StreamKey::new(Method::Aes128Gcm, "pw").is_err());
    }
}
