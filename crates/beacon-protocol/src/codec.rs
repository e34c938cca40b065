//! Codec for encoding and decoding Beacon frames.
//!
//! Frames travel as MessagePack payloads behind a 4-byte big-endian length
//! prefix, so partial reads can be buffered until a full frame arrives.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::frames::Frame;

/// Maximum frame size (4 MiB). A full channel view for a large room must
/// fit in a single sync frame.
pub const MAX_FRAME_SIZE: usize = 4 * 1024 * 1024;

/// Length prefix size in bytes.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame exceeds maximum size.
    #[error("Frame size {0} exceeds maximum {MAX_FRAME_SIZE}")]
    FrameTooLarge(usize),

    /// Not enough data to decode a frame.
    #[error("Incomplete frame: need {0} more bytes")]
    Incomplete(usize),

    /// MessagePack encoding error.
    #[error("Encoding error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// MessagePack decoding error.
    #[error("Decoding error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
}

/// Encode a frame to bytes: length prefix followed by the MessagePack body.
///
/// # Errors
///
/// Returns an error if the frame is too large or encoding fails.
pub fn encode(frame: &Frame) -> Result<Bytes, ProtocolError> {
    let mut buf = BytesMut::new();
    encode_into(frame, &mut buf)?;
    Ok(buf.freeze())
}

/// Encode a frame into an existing buffer.
///
/// # Errors
///
/// Returns an error if the frame is too large or encoding fails.
pub fn encode_into(frame: &Frame, buf: &mut BytesMut) -> Result<(), ProtocolError> {
    let payload = rmp_serde::to_vec_named(frame)?;

    if payload.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(payload.len()));
    }

    buf.reserve(LENGTH_PREFIX_SIZE + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.extend_from_slice(&payload);

    Ok(())
}

/// Decode a single frame from a byte slice.
///
/// # Errors
///
/// Returns an error if the data is incomplete, too large, or invalid.
pub fn decode(data: &[u8]) -> Result<Frame, ProtocolError> {
    if data.len() < LENGTH_PREFIX_SIZE {
        return Err(ProtocolError::Incomplete(LENGTH_PREFIX_SIZE - data.len()));
    }

    let length = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;

    if length > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(length));
    }

    let total_size = LENGTH_PREFIX_SIZE + length;
    if data.len() < total_size {
        return Err(ProtocolError::Incomplete(total_size - data.len()));
    }

    let frame = rmp_serde::from_slice(&data[LENGTH_PREFIX_SIZE..total_size])?;
    Ok(frame)
}

/// Try to decode a frame from a buffer, consuming it on success.
///
/// Returns `Ok(Some(frame))` if a complete frame was decoded,
/// `Ok(None)` if more data is needed, or `Err` on protocol error.
///
/// # Errors
///
/// Returns an error if the frame is too large or invalid.
pub fn decode_from(buf: &mut BytesMut) -> Result<Option<Frame>, ProtocolError> {
    if buf.len() < LENGTH_PREFIX_SIZE {
        return Ok(None);
    }

    let length = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;

    if length > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(length));
    }

    let total_size = LENGTH_PREFIX_SIZE + length;
    if buf.len() < total_size {
        return Ok(None);
    }

    buf.advance(LENGTH_PREFIX_SIZE);
    let payload = buf.split_to(length);
    let frame = rmp_serde::from_slice(&payload)?;

    Ok(Some(frame))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::presence::{ChannelView, PresenceEntry, StateMap};
    use serde_json::json;

    fn sample_state() -> StateMap {
        let mut state = StateMap::new();
        state.insert("user".into(), json!("u1"));
        state.insert("status".into(), json!("online"));
        state
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let mut view = ChannelView::new();
        view.insert(PresenceEntry::new("user:1", "conn-a", sample_state(), 1));

        let frames = vec![
            Frame::connect(1, Some("token123".to_string())),
            Frame::connected("conn-a", 1, 30000),
            Frame::subscribe(1, "room:lobby", Some("user:1".to_string())),
            Frame::track(2, "room:lobby", sample_state()),
            Frame::untrack(3, "room:lobby"),
            Frame::sync("room:lobby", 1, "user:1", view.clone()),
            Frame::diff(
                "room:lobby",
                2,
                vec![PresenceEntry::new("user:2", "conn-b", sample_state(), 2)],
                vec![],
            ),
            Frame::ack(42),
            Frame::error(1, 1003, "state payload too large"),
            Frame::ping(Some(12345)),
        ];

        for frame in frames {
            let encoded = encode(&frame).unwrap();
            let decoded = decode(&encoded).unwrap();
            assert_eq!(frame, decoded);
        }
    }

    #[test]
    fn test_decode_incomplete() {
        let frame = Frame::subscribe(1, "room:lobby", None);
        let encoded = encode(&frame).unwrap();

        let partial = &encoded[..5];
        match decode(partial) {
            Err(ProtocolError::Incomplete(_)) => {}
            other => panic!("Expected Incomplete error, got {:?}", other),
        }
    }

    #[test]
    fn test_frame_too_large() {
        let mut state = StateMap::new();
        state.insert("blob".into(), json!("x".repeat(MAX_FRAME_SIZE + 1)));
        let frame = Frame::track(1, "room:lobby", state);

        match encode(&frame) {
            Err(ProtocolError::FrameTooLarge(_)) => {}
            other => panic!("Expected FrameTooLarge error, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_from_consumes_exactly_one_frame() {
        let frame1 = Frame::track(1, "room:one", sample_state());
        let frame2 = Frame::ack(2);

        let encoded1 = encode(&frame1).unwrap();
        let encoded2 = encode(&frame2).unwrap();

        let mut buf = BytesMut::new();
        buf.extend_from_slice(&encoded1);
        buf.extend_from_slice(&encoded2);

        // The buffer shrinks by exactly one frame's bytes per decode, so
        // per-frame byte accounting from the length delta is exact.
        let before = buf.len();
        decode_from(&mut buf).unwrap().unwrap();
        assert_eq!(before - buf.len(), encoded1.len());

        let before = buf.len();
        decode_from(&mut buf).unwrap().unwrap();
        assert_eq!(before - buf.len(), encoded2.len());
        assert!(buf.is_empty());
    }

    #[test]
    fn test_streaming_decode() {
        let frame1 = Frame::subscribe(1, "room:one", None);
        let frame2 = Frame::untrack(2, "room:two");

        let mut buf = BytesMut::new();
        encode_into(&frame1, &mut buf).unwrap();
        encode_into(&frame2, &mut buf).unwrap();

        let decoded1 = decode_from(&mut buf).unwrap().unwrap();
        let decoded2 = decode_from(&mut buf).unwrap().unwrap();

        assert_eq!(frame1, decoded1);
        assert_eq!(frame2, decoded2);
        assert!(buf.is_empty());

        // Nothing left to decode
        assert!(decode_from(&mut buf).unwrap().is_none());
    }
}
