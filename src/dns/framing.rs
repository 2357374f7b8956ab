//! TCP DNS message framing (RFC 1035 section 4.2.2)
//!
//! A pure, independently testable byte-buffer state machine for the
//! 2-byte-big-endian-length-prefixed framing classical DNS uses over TCP.
//! Shared between the upstream client's TCP fallback and the stub's TCP
//! ingress listener, both of which see split or concatenated frames
//! depending on how the kernel happens to coalesce reads.

/// Accumulates bytes read from a TCP stream and yields complete,
/// length-prefixed DNS messages as they become available. Feed it
/// arbitrarily chunked input; it does not care where frame boundaries
/// land relative to read boundaries.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    /// Feed newly read bytes into the decoder
    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Pop the next complete frame's payload, if one has fully arrived.
    /// Call repeatedly after each `push` — concatenated frames within a
    /// single read are drained one at a time.
    pub fn pop_frame(&mut self) -> Option<Vec<u8>> {
        if self.buf.len() < 2 {
            return None;
        }
        let len = u16::from_be_bytes([self.buf[0], self.buf[1]]) as usize;
        if self.buf.len() < 2 + len {
            return None;
        }
        let frame = self.buf[2..2 + len].to_vec();
        self.buf.drain(0..2 + len);
        Some(frame)
    }

    /// Bytes currently buffered but not yet forming a complete frame
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

/// Prepend the 2-byte big-endian length prefix TCP DNS framing requires
pub fn frame(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(2 + payload.len());
    out.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    out.extend_from_slice(payload);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_frame_arriving_whole() {
        let mut dec = FrameDecoder::new();
        dec.push(&frame(b"hello"));
        assert_eq!(dec.pop_frame().unwrap(), b"hello");
        assert_eq!(dec.pop_frame(), None);
    }

    #[test]
    fn frame_split_across_pushes() {
        let framed = frame(b"hello world");
        let mut dec = FrameDecoder::new();
        dec.push(&framed[..3]);
        assert_eq!(dec.pop_frame(), None);
        dec.push(&framed[3..]);
        assert_eq!(dec.pop_frame().unwrap(), b"hello world");
    }

    #[test]
    fn length_prefix_split_across_pushes() {
        let framed = frame(b"x");
        let mut dec = FrameDecoder::new();
        dec.push(&framed[..1]);
        assert_eq!(dec.pop_frame(), None);
        dec.push(&framed[1..]);
        assert_eq!(dec.pop_frame().unwrap(), b"x");
    }

    #[test]
    fn two_frames_concatenated_in_one_push() {
        let mut both = frame(b"one");
        both.extend_from_slice(&frame(b"two"));

        let mut dec = FrameDecoder::new();
        dec.push(&both);
        assert_eq!(dec.pop_frame().unwrap(), b"one");
        assert_eq!(dec.pop_frame().unwrap(), b"two");
        assert_eq!(dec.pop_frame(), None);
    }

    #[test]
    fn empty_payload_frame() {
        let mut dec = FrameDecoder::new();
        dec.push(&frame(b""));
        assert_eq!(dec.pop_frame().unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn pending_reports_unconsumed_bytes() {
        let mut dec = FrameDecoder::new();
        dec.push(&[0x00]);
        assert_eq!(dec.pending(), 1);
    }
}
