//! Segmented-message reassembly
//!
//! The bus caps payload sizes, so logical messages travel as segments. Each
//! segment carries a one-byte envelope flag: `0` means more segments follow,
//! `1` marks the final segment of a logical message.
//!
//! A [`MsgReassembler`] is strictly single-consumer: the subscriber task
//! owns it and feeds segments in arrival order. Parsing never happens inside
//! a bus callback.
//!
//! The acknowledgement protocol lives with the caller: every segment is
//! acked on its reply subject, and for the final segment the ack is sent
//! only after the reassembled payload has been accepted by the downstream
//! queue. A full queue therefore delays the ack and stalls the sender.

use crate::common::error::{ReplayError, Result};
use bytes::{Bytes, BytesMut};

/// Envelope flag marking a non-final segment.
pub const SEGMENT_MORE: u8 = 0;
/// Envelope flag marking the final segment of a logical message.
pub const SEGMENT_FINAL: u8 = 1;

/// Reassembles segmented bus payloads into whole logical messages.
#[derive(Debug, Default)]
pub struct MsgReassembler {
    buf: BytesMut,
}

impl MsgReassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one segment. Returns `true` when the final segment of a
    /// logical message has arrived.
    pub fn handle(&mut self, segment: &[u8]) -> Result<bool> {
        let (&flag, payload) = segment
            .split_first()
            .ok_or_else(|| ReplayError::bad_envelope("empty segment"))?;
        match flag {
            SEGMENT_MORE => {
                self.buf.extend_from_slice(payload);
                Ok(false)
            }
            SEGMENT_FINAL => {
                self.buf.extend_from_slice(payload);
                Ok(true)
            }
            other => Err(ReplayError::bad_envelope(format!(
                "unknown segment flag {other}"
            ))),
        }
    }

    /// The full reassembled payload; valid only immediately after
    /// [`handle`](Self::handle) returned `true`.
    pub fn bytes(&self) -> Bytes {
        Bytes::copy_from_slice(&self.buf)
    }

    /// Number of buffered bytes so far.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Clear the buffer; called by the consumer after taking the payload.
    pub fn reset(&mut self) {
        self.buf.clear();
    }
}

/// Split a logical payload into enveloped segments of at most
/// `max_segment` payload bytes. The sending side of the protocol; also used
/// to drive the reassembler in tests.
///
/// An empty payload still produces one final segment so the receiver
/// observes the message boundary.
pub fn split_segments(payload: &[u8], max_segment: usize) -> Vec<Bytes> {
    assert!(max_segment > 0, "segment size must be positive");
    let mut out = Vec::new();
    let mut chunks = payload.chunks(max_segment).peekable();
    if chunks.peek().is_none() {
        out.push(Bytes::from_static(&[SEGMENT_FINAL]));
        return out;
    }
    while let Some(chunk) = chunks.next() {
        let flag = if chunks.peek().is_none() {
            SEGMENT_FINAL
        } else {
            SEGMENT_MORE
        };
        let mut seg = BytesMut::with_capacity(chunk.len() + 1);
        seg.extend_from_slice(&[flag]);
        seg.extend_from_slice(chunk);
        out.push(seg.freeze());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_single_segment() {
        let mut nmm = MsgReassembler::new();
        let segments = split_segments(b"hello", 64);
        assert_eq!(segments.len(), 1);
        assert!(nmm.handle(&segments[0]).unwrap());
        assert_eq!(&nmm.bytes()[..], b"hello");
    }

    #[test]
    fn test_roundtrip_many_segments() {
        let payload: Vec<u8> = (0..=255u8).cycle().take(10_000).collect();
        let segments = split_segments(&payload, 77);

        let mut nmm = MsgReassembler::new();
        let mut finished_count = 0;
        for seg in &segments {
            if nmm.handle(seg).unwrap() {
                finished_count += 1;
            }
        }
        // finished exactly once, on the last segment
        assert_eq!(finished_count, 1);
        assert_eq!(&nmm.bytes()[..], &payload[..]);

        nmm.reset();
        assert!(nmm.is_empty());
    }

    #[test]
    fn test_empty_payload_still_has_boundary() {
        let segments = split_segments(b"", 64);
        assert_eq!(segments.len(), 1);

        let mut nmm = MsgReassembler::new();
        assert!(nmm.handle(&segments[0]).unwrap());
        assert!(nmm.bytes().is_empty());
    }

    #[test]
    fn test_reuse_after_reset() {
        let mut nmm = MsgReassembler::new();
        for seg in split_segments(b"first", 2) {
            nmm.handle(&seg).unwrap();
        }
        assert_eq!(&nmm.bytes()[..], b"first");
        nmm.reset();

        for seg in split_segments(b"second", 3) {
            nmm.handle(&seg).unwrap();
        }
        assert_eq!(&nmm.bytes()[..], b"second");
    }

    #[test]
    fn test_bad_envelope() {
        let mut nmm = MsgReassembler::new();
        let err = nmm.handle(&[]).unwrap_err();
        assert!(matches!(err, ReplayError::BadEnvelope(_)));

        let err = nmm.handle(&[9, 1, 2, 3]).unwrap_err();
        assert!(matches!(err, ReplayError::BadEnvelope(_)));
    }
}
