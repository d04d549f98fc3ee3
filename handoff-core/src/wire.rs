//! Framing: length-prefix (4 bytes LE) + JSON envelope.

use crate::protocol::{Envelope, ProtocolError};

const LEN_SIZE: usize = 4;
/// Largest accepted frame.
pub const MAX_FRAME_LEN: u32 = 32 * 1024 * 1024;
/// Room left in a frame for the envelope, chunk header and metadata.
const FRAME_HEADROOM: u64 = 64 * 1024;
/// Largest chunk payload whose base64 form still fits in one frame.
pub const MAX_CHUNK_LEN: u64 = (MAX_FRAME_LEN as u64 / 4) * 3 - FRAME_HEADROOM;

/// Encode an envelope into a single frame: 4 bytes LE length + JSON payload.
pub fn encode_frame(envelope: &Envelope) -> Result<Vec<u8>, FrameEncodeError> {
    let payload = envelope.to_json().map_err(FrameEncodeError::Encode)?;
    let len = u32::try_from(payload.len()).map_err(|_| FrameEncodeError::TooLarge)?;
    if len > MAX_FRAME_LEN {
        return Err(FrameEncodeError::TooLarge);
    }
    let mut out = Vec::with_capacity(LEN_SIZE + payload.len());
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
}

#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("encode error: {0}")]
    Encode(ProtocolError),
    #[error("frame too large")]
    TooLarge,
}

/// Length of the frame at the front of `bytes`, once its header is complete.
pub fn frame_len(header: [u8; LEN_SIZE]) -> Result<usize, FrameDecodeError> {
    let len = u32::from_le_bytes(header);
    if len > MAX_FRAME_LEN {
        return Err(FrameDecodeError::TooLarge);
    }
    Ok(len as usize)
}

/// Decode one frame from the front of `bytes`. Returns the envelope and the number of bytes consumed.
/// With a partial buffer returns [`FrameDecodeError::NeedMore`]; retry after more data arrives.
pub fn decode_frame(bytes: &[u8]) -> Result<(Envelope, usize), FrameDecodeError> {
    if bytes.len() < LEN_SIZE {
        return Err(FrameDecodeError::NeedMore);
    }
    let len = frame_len([bytes[0], bytes[1], bytes[2], bytes[3]])?;
    if bytes.len() < LEN_SIZE + len {
        return Err(FrameDecodeError::NeedMore);
    }
    let envelope = Envelope::from_json(&bytes[LEN_SIZE..LEN_SIZE + len])
        .map_err(FrameDecodeError::Decode)?;
    Ok((envelope, LEN_SIZE + len))
}

#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("need more bytes")]
    NeedMore,
    #[error("frame too large")]
    TooLarge,
    #[error("decode error: {0}")]
    Decode(ProtocolError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::PeerId;
    use crate::protocol::{DataChunk, Message, MessageKind, TransferCancel};
    use crate::task::TaskId;

    fn cancel() -> Envelope {
        Envelope::new(
            &PeerId::from("a"),
            &PeerId::from("b"),
            &Message::Cancel(TransferCancel {
                task_id: TaskId::from("t1"),
            }),
        )
        .unwrap()
    }

    #[test]
    fn partial_read_need_more() {
        let frame = encode_frame(&cancel()).unwrap();
        assert!(matches!(
            decode_frame(&frame[..2]),
            Err(FrameDecodeError::NeedMore)
        ));
        assert!(matches!(
            decode_frame(&frame[..LEN_SIZE]),
            Err(FrameDecodeError::NeedMore)
        ));
        assert!(matches!(
            decode_frame(&frame[..frame.len() - 1]),
            Err(FrameDecodeError::NeedMore)
        ));
    }

    #[test]
    fn multiple_frames_in_one_buffer() {
        let a = cancel();
        let b = Envelope::new(
            &PeerId::from("a"),
            &PeerId::from("b"),
            &Message::DataChunk(DataChunk::plain(TaskId::from("t1"), b"xyz", true)),
        )
        .unwrap();
        let fa = encode_frame(&a).unwrap();
        let fb = encode_frame(&b).unwrap();
        let mut buf = fa.clone();
        buf.extend_from_slice(&fb);
        let (m1, n1) = decode_frame(&buf).unwrap();
        assert_eq!(n1, fa.len());
        let (m2, n2) = decode_frame(&buf[n1..]).unwrap();
        assert_eq!(n2, fb.len());
        assert_eq!(m1.kind, MessageKind::DataTransferCancel);
        assert_eq!(m2.kind, MessageKind::DataChunk);
    }

    #[test]
    fn largest_chunk_fits_in_a_frame() {
        let data = vec![0xA5u8; MAX_CHUNK_LEN as usize];
        let chunk = DataChunk::plain(TaskId::from("t1"), &data, true).with_header(
            "big.bin",
            MAX_CHUNK_LEN,
            &Default::default(),
        );
        let envelope = Envelope::new(
            &PeerId::from("a"),
            &PeerId::from("b"),
            &Message::DataChunk(chunk),
        )
        .unwrap();
        let frame = encode_frame(&envelope).unwrap();
        assert!(frame.len() <= LEN_SIZE + MAX_FRAME_LEN as usize);
    }

    #[test]
    fn oversized_header_rejected() {
        let mut buf = (MAX_FRAME_LEN + 1).to_le_bytes().to_vec();
        buf.extend_from_slice(b"{}");
        assert!(matches!(
            decode_frame(&buf),
            Err(FrameDecodeError::TooLarge)
        ));
    }

    #[test]
    fn garbage_payload_is_decode_error() {
        let mut buf = 3u32.to_le_bytes().to_vec();
        buf.extend_from_slice(b"not");
        assert!(matches!(
            decode_frame(&buf),
            Err(FrameDecodeError::Decode(_))
        ));
    }
}
