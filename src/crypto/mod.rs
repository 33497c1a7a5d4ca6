// Crypto layer: password-derived keys and per-datagram framing
//
// - kdf: PBKDF2 key material and the stream-cipher password stretch
// - method: cipher method names, key/IV sizes, framing mode
// - stream: per-packet stream cipher instances
// - framer: seal/open of single wire packets

pub mod framer;
pub mod kdf;
pub mod method;
pub mod stream;

pub use framer::{Decoded, DiscardReason, SecureFramer, AEAD_NONCE_LEN, AEAD_TAG_LEN, MAC_LEN};
pub use kdf::{evp_bytes_to_key, KeyMaterial};
pub use method::{CipherMode, Method};
pub use stream::{Direction, StreamKey};
