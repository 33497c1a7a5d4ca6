// Password-based key derivation
//
// Two derivations live here:
// - PBKDF2-HMAC-SHA1 key material for the MAC and AEAD modes, derived once
//   per connection
// - the EVP_BytesToKey (MD5) stretch that keys the legacy stream ciphers

use crate::error::{Result, TunnelError};
use md5::{Digest, Md5};
use ring::pbkdf2;
use std::fmt;
use std::num::NonZeroU32;

/// Fixed PBKDF2 salt shared by both ends
pub const KDF_SALT: &[u8] = b"hello";

/// PBKDF2 iteration count
pub const KDF_ITERATIONS: u32 = 4096;

/// Length of the derived key material
pub const KEY_MATERIAL_LEN: usize = 32;

/// Key material derived from the pre-shared password
#[derive(Clone, PartialEq, Eq)]
pub struct KeyMaterial([u8; KEY_MATERIAL_LEN]);

impl KeyMaterial {
    /// Derive key material from a password with the fixed salt
    pub fn derive(password: &str) -> Result<Self> {
        Self::derive_with_salt(password.as_bytes(), KDF_SALT)
    }

    /// Derive key material with an explicit salt
    pub fn derive_with_salt(password: &[u8], salt: &[u8]) -> Result<Self> {
        let iterations = NonZeroU32::new(KDF_ITERATIONS)
            .ok_or_else(|| TunnelError::KeyDerivation("zero iteration count".into()))?;

        let mut out = [0u8; KEY_MATERIAL_LEN];
        pbkdf2::derive(
            pbkdf2::PBKDF2_HMAC_SHA1,
            iterations,
            salt,
            password,
            &mut out,
        );
        Ok(Self(out))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// First `len` bytes, used to key ciphers with shorter keys
    pub fn prefix(&self, len: usize) -> Result<&[u8]> {
        self.0.get(..len).ok_or_else(|| {
            TunnelError::KeyDerivation(format!(
                "requested {} key bytes, only {} derived",
                len, KEY_MATERIAL_LEN
            ))
        })
    }
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("KeyMaterial(..)")
    }
}

/// OpenSSL EVP_BytesToKey with MD5 and a single round, no salt
///
/// `D_i = MD5(D_{i-1} ∥ password)`, concatenated until `key_len` bytes.
pub fn evp_bytes_to_key(password: &[u8], key_len: usize) -> Vec<u8> {
    let mut key = Vec::with_capacity(key_len + 16);
    let mut prev: Vec<u8> = Vec::new();

    while key.len() < key_len {
        let mut hasher = Md5::new();
        hasher.update(&prev);
        hasher.update(password);
        prev = hasher.finalize().to_vec();
        key.extend_from_slice(&prev);
    }

    key.truncate(key_len);
    key
}
