//! Chunk layout: fixed-size slices of a file, each sealed under the file key with its own nonce.

use crate::cipher::{self, CipherError, CipherKey, NONCE_LEN};
use crate::protocol::Message;

/// Default chunk size in bytes.
pub const DEFAULT_CHUNK_SIZE: usize = 16 * 1024;

/// Number of chunks a file of `total_len` bytes splits into.
pub fn chunk_count(total_len: u64, chunk_size: usize) -> u64 {
    let size = if chunk_size == 0 {
        DEFAULT_CHUNK_SIZE as u64
    } else {
        chunk_size as u64
    };
    total_len.div_ceil(size)
}

/// Byte range `[start, end)` of chunk `chunk_id`.
pub fn chunk_range(chunk_id: u64, total_len: u64, chunk_size: usize) -> (u64, u64) {
    let start = chunk_id.saturating_mul(chunk_size as u64).min(total_len);
    let end = start.saturating_add(chunk_size as u64).min(total_len);
    (start, end)
}

/// An encrypted chunk ready for the wire.
#[derive(Debug, Clone)]
pub struct SealedChunk {
    pub chunk_id: u64,
    pub ciphertext: Vec<u8>,
    pub nonce: [u8; NONCE_LEN],
}

impl SealedChunk {
    /// Encrypt `plaintext` as chunk `chunk_id`.
    pub fn seal(key: &CipherKey, chunk_id: u64, plaintext: &[u8]) -> Result<Self, CipherError> {
        let (ciphertext, nonce) = cipher::seal_chunk(key, plaintext)?;
        Ok(Self {
            chunk_id,
            ciphertext,
            nonce,
        })
    }

    /// Bytes this chunk occupies in the outbound buffer (approximate wire size).
    pub fn wire_len(&self) -> usize {
        self.ciphertext.len() + NONCE_LEN + 8
    }

    pub fn to_message(&self) -> Message {
        Message::FileChunk {
            chunk_id: self.chunk_id,
            ciphertext: self.ciphertext.clone(),
            nonce: self.nonce,
        }
    }
}

/// Whether the receiver acks after writing `chunk_id` (every `ack_interval` chunks).
pub fn is_ack_point(chunk_id: u64, ack_interval: u64) -> bool {
    (chunk_id + 1) % ack_interval.max(1) == 0
}
