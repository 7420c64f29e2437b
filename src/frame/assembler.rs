//! # M-Bus Frame Assembly
//!
//! A serial link delivers bytes in arbitrary chunks: half a frame now, the
//! rest plus the start of the next frame later. This module classifies the
//! bytes accumulated so far as a partial frame, a protocol error, or a
//! complete frame, and extracts the content of complete frames.
//!
//! Recognized wire formats:
//!
//! - short/control frame: `0x10, content byte, checksum, 0x16`
//! - long/data frame: `0x68, len, len, 0x68, content[0..len), checksum, 0x16`
//!
//! The checksum is the arithmetic sum of the content bytes modulo 256.
//!
//! Parsing uses `nom` streaming combinators, so a buffer shorter than the
//! length implied by its header surfaces as `Incomplete` and maps directly
//! onto [`FrameStatus::PartialFrame`].

use bytes::BytesMut;
use nom::bytes::streaming::take;
use nom::number::streaming::be_u8;
use nom::Err as NomErr;
use nom::IResult;

use crate::constants::{
    FRAME_START_LONG, FRAME_START_SHORT, FRAME_STOP, LONG_FRAME_OVERHEAD,
    LONG_FRAME_PAYLOAD_OFFSET, SHORT_FRAME_LENGTH,
};
use crate::frame::encoder::wire_checksum;

/// Classification of the bytes currently buffered for one link.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum FrameStatus {
    /// Fewer bytes than the header implies; wait for more input.
    PartialFrame,
    /// Malformed header, checksum mismatch, or wrong stop byte; the whole
    /// buffer must be discarded.
    ErrorInFrame,
    /// A complete, checksum-valid frame starts at the buffer front.
    FullFrame {
        /// Total wire length to remove from the front of the buffer.
        frame_length: usize,
        /// Offset of the content bytes within the frame.
        payload_offset: usize,
        /// Number of content bytes.
        payload_len: usize,
    },
}

/// Structural fields of a frame, before checksum/stop validation.
struct RawFrame<'a> {
    content: &'a [u8],
    checksum: u8,
    stop: u8,
    frame_length: usize,
    payload_offset: usize,
}

fn frame_error<T>(input: &[u8]) -> IResult<&[u8], T> {
    Err(NomErr::Error(nom::error::Error::new(
        input,
        nom::error::ErrorKind::Tag,
    )))
}

fn parse_raw_frame(input: &[u8]) -> IResult<&[u8], RawFrame<'_>> {
    let (rest, start) = be_u8(input)?;
    match start {
        FRAME_START_SHORT => {
            let (rest, content) = take(1usize)(rest)?;
            let (rest, checksum) = be_u8(rest)?;
            let (rest, stop) = be_u8(rest)?;
            Ok((
                rest,
                RawFrame {
                    content,
                    checksum,
                    stop,
                    frame_length: SHORT_FRAME_LENGTH,
                    payload_offset: 1,
                },
            ))
        }
        FRAME_START_LONG => {
            let (rest, length1) = be_u8(rest)?;
            let (rest, length2) = be_u8(rest)?;
            if length1 != length2 {
                return frame_error(input);
            }
            let (rest, start2) = be_u8(rest)?;
            if start2 != FRAME_START_LONG {
                return frame_error(input);
            }
            let (rest, content) = take(length1 as usize)(rest)?;
            let (rest, checksum) = be_u8(rest)?;
            let (rest, stop) = be_u8(rest)?;
            Ok((
                rest,
                RawFrame {
                    content,
                    checksum,
                    stop,
                    frame_length: length1 as usize + LONG_FRAME_OVERHEAD,
                    payload_offset: LONG_FRAME_PAYLOAD_OFFSET,
                },
            ))
        }
        _ => frame_error(input),
    }
}

/// Classify the buffered bytes of one link.
///
/// The buffer is not modified; the caller consumes `frame_length` bytes on
/// [`FrameStatus::FullFrame`] and discards everything on
/// [`FrameStatus::ErrorInFrame`].
pub fn check_frame(buffer: &[u8]) -> FrameStatus {
    match parse_raw_frame(buffer) {
        Ok((_, raw)) => {
            if raw.checksum != wire_checksum(raw.content) || raw.stop != FRAME_STOP {
                FrameStatus::ErrorInFrame
            } else {
                FrameStatus::FullFrame {
                    frame_length: raw.frame_length,
                    payload_offset: raw.payload_offset,
                    payload_len: raw.content.len(),
                }
            }
        }
        Err(NomErr::Incomplete(_)) => FrameStatus::PartialFrame,
        Err(_) => FrameStatus::ErrorInFrame,
    }
}

/// One step of the per-link assembly loop.
#[derive(Debug, PartialEq, Eq)]
pub enum AssembleResult {
    /// Not enough bytes buffered; wait for the next chunk.
    Pending,
    /// The content bytes of one complete frame, removed from the buffer.
    Frame(Vec<u8>),
    /// Protocol violation; carries the discarded bytes for diagnostics.
    Error(Vec<u8>),
}

/// Per-link byte accumulator.
///
/// Bytes are appended as they arrive and consumed frame by frame. After a
/// protocol error the buffer is empty, so the next received bytes start a
/// fresh scan; after a full frame any trailing bytes of a subsequent frame
/// stay in place for the next call.
#[derive(Debug, Default)]
pub struct FrameAssembler {
    buffer: BytesMut,
}

impl FrameAssembler {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::new(),
        }
    }

    /// Append a chunk of received bytes.
    pub fn append(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Number of bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Try to extract the next frame from the front of the buffer.
    ///
    /// Every call either consumes bytes (`Frame`, `Error`) or reports
    /// `Pending`, so a drive loop around this method always terminates.
    pub fn next_frame(&mut self) -> AssembleResult {
        match check_frame(&self.buffer) {
            FrameStatus::PartialFrame => AssembleResult::Pending,
            FrameStatus::ErrorInFrame => AssembleResult::Error(self.buffer.split().to_vec()),
            FrameStatus::FullFrame {
                frame_length,
                payload_offset,
                payload_len,
            } => {
                let frame = self.buffer.split_to(frame_length);
                AssembleResult::Frame(frame[payload_offset..payload_offset + payload_len].to_vec())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::hex::hex_to_bytes;

    #[test]
    fn test_minimal_short_frame() {
        let status = check_frame(&hex_to_bytes("107b7b16"));
        assert_eq!(
            status,
            FrameStatus::FullFrame {
                frame_length: 4,
                payload_offset: 1,
                payload_len: 1,
            }
        );
    }

    #[test]
    fn test_short_frame_bad_checksum() {
        assert_eq!(
            check_frame(&hex_to_bytes("107b7c16")),
            FrameStatus::ErrorInFrame
        );
    }

    #[test]
    fn test_long_frame() {
        // content 01 02 03, checksum 06
        let status = check_frame(&hex_to_bytes("680303680102030616"));
        assert_eq!(
            status,
            FrameStatus::FullFrame {
                frame_length: 9,
                payload_offset: 4,
                payload_len: 3,
            }
        );
    }

    #[test]
    fn test_long_frame_length_mismatch() {
        assert_eq!(
            check_frame(&hex_to_bytes("680304680102030616")),
            FrameStatus::ErrorInFrame
        );
    }

    #[test]
    fn test_long_frame_missing_second_start() {
        assert_eq!(
            check_frame(&hex_to_bytes("680303690102030616")),
            FrameStatus::ErrorInFrame
        );
    }

    #[test]
    fn test_long_frame_bad_stop() {
        assert_eq!(
            check_frame(&hex_to_bytes("680303680102030617")),
            FrameStatus::ErrorInFrame
        );
    }

    #[test]
    fn test_unknown_start_byte() {
        assert_eq!(
            check_frame(&[0xe5, 0x00, 0x00, 0x00]),
            FrameStatus::ErrorInFrame
        );
    }

    #[test]
    fn test_empty_buffer_is_partial() {
        assert_eq!(check_frame(&[]), FrameStatus::PartialFrame);
    }

    #[test]
    fn test_every_proper_prefix_is_partial() {
        let wire = hex_to_bytes("680303680102030616");
        for n in 0..wire.len() {
            assert_eq!(
                check_frame(&wire[..n]),
                FrameStatus::PartialFrame,
                "prefix of {n} bytes"
            );
        }
        assert!(matches!(
            check_frame(&wire),
            FrameStatus::FullFrame { .. }
        ));
    }

    #[test]
    fn test_assembler_extracts_payload() {
        let mut asm = FrameAssembler::new();
        asm.append(&hex_to_bytes("107b7b16"));
        assert_eq!(asm.next_frame(), AssembleResult::Frame(vec![0x7b]));
        assert_eq!(asm.next_frame(), AssembleResult::Pending);
        assert_eq!(asm.buffered(), 0);
    }

    #[test]
    fn test_assembler_two_frames_one_chunk() {
        let mut asm = FrameAssembler::new();
        asm.append(&hex_to_bytes("107b7b16680202680a0b1516"));
        assert_eq!(asm.next_frame(), AssembleResult::Frame(vec![0x7b]));
        assert_eq!(asm.next_frame(), AssembleResult::Frame(vec![0x0a, 0x0b]));
        assert_eq!(asm.next_frame(), AssembleResult::Pending);
    }

    #[test]
    fn test_assembler_discards_on_error() {
        let mut asm = FrameAssembler::new();
        let bad = hex_to_bytes("107b7c16");
        asm.append(&bad);
        assert_eq!(asm.next_frame(), AssembleResult::Error(bad));
        assert_eq!(asm.buffered(), 0);
    }

    #[test]
    fn test_assembler_byte_at_a_time() {
        let wire = hex_to_bytes("680303680102030616");
        let mut asm = FrameAssembler::new();
        for &b in &wire[..wire.len() - 1] {
            asm.append(&[b]);
            assert_eq!(asm.next_frame(), AssembleResult::Pending);
        }
        asm.append(&[*wire.last().unwrap()]);
        assert_eq!(
            asm.next_frame(),
            AssembleResult::Frame(vec![0x01, 0x02, 0x03])
        );
    }
}
