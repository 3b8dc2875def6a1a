//! Per-file chunk encryption: ChaCha20-Poly1305 with a fresh random nonce per chunk.
//!
//! The key is generated by the sender and travels in the clear inside the file
//! record, so confidentiality rests on the transport's own encryption.

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use rand::RngCore;
use serde::{Deserialize, Serialize};

pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 12;

/// Symmetric key of one shared file.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CipherKey(#[serde(with = "bytes_32")] [u8; KEY_LEN]);

mod bytes_32 {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    pub fn serialize<S: Serializer>(v: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error> {
        v.as_slice().serialize(serializer)
    }
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 32], D::Error> {
        let buf: Vec<u8> = Deserialize::deserialize(d)?;
        buf.try_into()
            .map_err(|_| serde::de::Error::custom("expected 32 bytes"))
    }
}

impl CipherKey {
    /// Generate a fresh random key.
    pub fn generate() -> Self {
        let mut key = [0u8; KEY_LEN];
        rand::thread_rng().fill_bytes(&mut key);
        CipherKey(key)
    }

    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        CipherKey(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

// Never print key material.
impl std::fmt::Debug for CipherKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("CipherKey(..)")
    }
}

/// Encrypt one chunk. Returns (ciphertext, nonce); the nonce is random and must travel with the chunk.
pub fn seal_chunk(
    key: &CipherKey,
    plaintext: &[u8],
) -> Result<(Vec<u8>, [u8; NONCE_LEN]), CipherError> {
    let cipher = ChaCha20Poly1305::new_from_slice(key.as_bytes()).map_err(|_| CipherError::Key)?;
    let mut nonce = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce);
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| CipherError::Encrypt)?;
    Ok((ciphertext, nonce))
}

/// Decrypt one chunk. Fails on a wrong key, wrong nonce or any tampering.
pub fn open_chunk(
    key: &CipherKey,
    nonce: &[u8; NONCE_LEN],
    ciphertext: &[u8],
) -> Result<Vec<u8>, CipherError> {
    let cipher = ChaCha20Poly1305::new_from_slice(key.as_bytes()).map_err(|_| CipherError::Key)?;
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| CipherError::Decrypt)
}

#[derive(Debug, thiserror::Error)]
pub enum CipherError {
    #[error("invalid key")]
    Key,
    #[error("encryption failed")]
    Encrypt,
    #[error("decryption failed")]
    Decrypt,
}
