//! Framing: length-prefix (4 bytes LE) + bincode payload.
//!
//! Generic over the payload type so a host can wrap [`Message`](crate::Message) in its own envelope.

use serde::de::DeserializeOwned;
use serde::Serialize;

pub const LEN_SIZE: usize = 4;
pub const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024; // 16 MiB

/// Encode a value into a single frame: 4 bytes LE length + bincode payload.
pub fn encode_frame<T: Serialize>(msg: &T) -> Result<Vec<u8>, FrameEncodeError> {
    let payload = bincode::serialize(msg).map_err(FrameEncodeError::Encode)?;
    if payload.len() > MAX_FRAME_LEN as usize {
        return Err(FrameEncodeError::TooLarge);
    }
    let len = payload.len() as u32;
    let mut out = Vec::with_capacity(LEN_SIZE + payload.len());
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
}

/// Error encoding a message into a frame (bincode or size limit).
#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("encode error: {0}")]
    Encode(#[from] bincode::Error),
    #[error("frame too large")]
    TooLarge,
}

/// Read the payload length from a 4-byte prefix, rejecting oversized frames.
pub fn frame_len(prefix: [u8; LEN_SIZE]) -> Result<usize, FrameDecodeError> {
    let len = u32::from_le_bytes(prefix);
    if len > MAX_FRAME_LEN {
        return Err(FrameDecodeError::TooLarge);
    }
    Ok(len as usize)
}

/// Decode one frame from the front of `bytes`. Returns the value and the number of bytes consumed.
/// Call with partial buffer; returns error if not enough bytes (caller should try again after more data).
pub fn decode_frame<T: DeserializeOwned>(bytes: &[u8]) -> Result<(T, usize), FrameDecodeError> {
    if bytes.len() < LEN_SIZE {
        return Err(FrameDecodeError::NeedMore);
    }
    let len = frame_len([bytes[0], bytes[1], bytes[2], bytes[3]])?;
    if bytes.len() < LEN_SIZE + len {
        return Err(FrameDecodeError::NeedMore);
    }
    let msg = decode_payload(&bytes[LEN_SIZE..LEN_SIZE + len])?;
    Ok((msg, LEN_SIZE + len))
}

/// Decode a payload whose length prefix was already consumed.
pub fn decode_payload<T: DeserializeOwned>(payload: &[u8]) -> Result<T, FrameDecodeError> {
    bincode::deserialize(payload).map_err(FrameDecodeError::Decode)
}

/// Error decoding a frame (need more bytes, too large, or bincode failure).
#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("need more bytes")]
    NeedMore,
    #[error("frame too large")]
    TooLarge,
    #[error("decode error: {0}")]
    Decode(#[from] bincode::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cipher::CipherKey;
    use crate::identity::{Fingerprint, PeerId};
    use crate::protocol::{FileRecord, Message};

    fn sample_announce() -> Message {
        Message::FileAnnounce(FileRecord {
            fingerprint: Fingerprint::new("alice-1-abcdef"),
            name: "notes.txt".into(),
            size: 1234,
            sender: PeerId::new("alice"),
            sender_name: "Host".into(),
            encrypted: true,
            key: Some(CipherKey::generate()),
        })
    }

    #[test]
    fn announce_survives_framing() {
        let msg = sample_announce();
        let frame = encode_frame(&msg).unwrap();
        let (decoded, n) = decode_frame::<Message>(&frame).unwrap();
        assert_eq!(n, frame.len());
        match (&msg, &decoded) {
            (Message::FileAnnounce(a), Message::FileAnnounce(b)) => assert_eq!(a, b),
            _ => panic!("expected FileAnnounce"),
        }
    }

    #[test]
    fn partial_read_need_more() {
        let frame = encode_frame(&sample_announce()).unwrap();
        assert!(matches!(
            decode_frame::<Message>(&frame[..2]),
            Err(FrameDecodeError::NeedMore)
        ));
        assert!(matches!(
            decode_frame::<Message>(&frame[..LEN_SIZE]),
            Err(FrameDecodeError::NeedMore)
        ));
    }

    #[test]
    fn multiple_messages() {
        let fa = encode_frame(&sample_announce()).unwrap();
        let fb = encode_frame(&Message::ChunkAck { chunk_id: 41 }).unwrap();
        let mut buf = Vec::new();
        buf.extend_from_slice(&fa);
        buf.extend_from_slice(&fb);
        let (m1, n1) = decode_frame::<Message>(&buf).unwrap();
        assert_eq!(n1, fa.len());
        let (m2, n2) = decode_frame::<Message>(&buf[n1..]).unwrap();
        assert_eq!(n2, fb.len());
        assert!(matches!(m1, Message::FileAnnounce(_)));
        assert!(matches!(m2, Message::ChunkAck { chunk_id: 41 }));
    }

    #[test]
    fn oversized_prefix_rejected() {
        let mut frame = (MAX_FRAME_LEN + 1).to_le_bytes().to_vec();
        frame.extend_from_slice(&[0u8; 8]);
        assert!(matches!(
            decode_frame::<Message>(&frame),
            Err(FrameDecodeError::TooLarge)
        ));
    }

    #[test]
    fn garbage_payload_is_decode_error() {
        let mut frame = 3u32.to_le_bytes().to_vec();
        frame.extend_from_slice(&[0xff, 0xff, 0xff]);
        assert!(matches!(
            decode_frame::<Message>(&frame),
            Err(FrameDecodeError::Decode(_))
        ));
    }
}
