//! # M-Bus Frame Encoding
//!
//! Builds outbound wire frames from content bytes. The inverse of the
//! assembler: `check_frame(build_frame(Long, content))` always yields a full
//! frame whose payload equals `content`.

use crate::constants::{
    FRAME_START_LONG, FRAME_START_SHORT, FRAME_STOP, MAX_FRAME_CONTENT,
};
use crate::error::BusError;

/// Which wire frame to build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStart {
    /// Short/control frame used for polling and acknowledgement.
    Short,
    /// Length-prefixed long/data frame carrying the application payload.
    Long,
}

/// Arithmetic sum of the content bytes, modulo 256.
pub fn wire_checksum(content: &[u8]) -> u8 {
    content.iter().fold(0u8, |sum, b| sum.wrapping_add(*b))
}

/// Build an outbound frame around `content`.
///
/// Content longer than 250 bytes cannot be represented in the single-byte
/// length field and is rejected rather than truncated. Short frames carry
/// exactly one content byte, which keeps their wire length fixed so the
/// assembler can delimit them without out-of-band knowledge.
pub fn build_frame(start: FrameStart, content: &[u8]) -> Result<Vec<u8>, BusError> {
    if content.len() > MAX_FRAME_CONTENT {
        return Err(BusError::ContentTooLong(content.len()));
    }

    let mut msg = Vec::with_capacity(content.len() + 6);
    match start {
        FrameStart::Short => {
            if content.len() != 1 {
                return Err(BusError::FrameEncodeError(format!(
                    "short frame carries exactly one content byte, got {}",
                    content.len()
                )));
            }
            msg.push(FRAME_START_SHORT);
        }
        FrameStart::Long => {
            msg.push(FRAME_START_LONG);
            msg.push(content.len() as u8);
            msg.push(content.len() as u8);
            msg.push(FRAME_START_LONG);
        }
    }
    msg.extend_from_slice(content);
    msg.push(wire_checksum(content));
    msg.push(FRAME_STOP);
    Ok(msg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_short_frame() {
        let wire = build_frame(FrameStart::Short, &[0x7b]).unwrap();
        assert_eq!(wire, vec![0x10, 0x7b, 0x7b, 0x16]);
    }

    #[test]
    fn test_build_long_frame() {
        let wire = build_frame(FrameStart::Long, &[0x01, 0x02, 0x03]).unwrap();
        assert_eq!(
            wire,
            vec![0x68, 0x03, 0x03, 0x68, 0x01, 0x02, 0x03, 0x06, 0x16]
        );
    }

    #[test]
    fn test_build_empty_long_frame() {
        let wire = build_frame(FrameStart::Long, &[]).unwrap();
        assert_eq!(wire, vec![0x68, 0x00, 0x00, 0x68, 0x00, 0x16]);
    }

    #[test]
    fn test_checksum_wraps() {
        assert_eq!(wire_checksum(&[0xff, 0x02]), 0x01);
    }

    #[test]
    fn test_oversized_content_rejected() {
        let content = vec![0u8; 251];
        assert!(matches!(
            build_frame(FrameStart::Long, &content),
            Err(BusError::ContentTooLong(251))
        ));
        assert!(build_frame(FrameStart::Long, &vec![0u8; 250]).is_ok());
    }

    #[test]
    fn test_short_frame_content_must_be_one_byte() {
        assert!(build_frame(FrameStart::Short, &[]).is_err());
        assert!(build_frame(FrameStart::Short, &[0x01, 0x02]).is_err());
    }
}
