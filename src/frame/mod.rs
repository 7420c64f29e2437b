//! The frame module contains the wire-level framing protocol: the
//! byte-accumulation state machine that recognizes complete M-Bus frames in
//! a raw stream, and the encoder that builds outbound frames with checksums.

pub mod assembler;
pub mod encoder;

pub use assembler::{check_frame, AssembleResult, FrameAssembler, FrameStatus};
pub use encoder::{build_frame, wire_checksum, FrameStart};
