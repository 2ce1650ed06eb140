//! Audio compression collaborator
//!
//! The core treats compression as an opaque byte transform. Both directions
//! write into a caller-owned buffer so the capture path can reuse its
//! allocation every period.

pub mod opus;

use serde::{Deserialize, Serialize};

pub use self::opus::OpusCodec;

use crate::audio::frame::StreamFormat;
use crate::config::OpusConfig;
use crate::error::CodecError;

/// Byte-in/byte-out frame transform
pub trait FrameCodec: Send {
    /// Short name for logs
    fn name(&self) -> &'static str;

    /// Compress one raw period into `out` (cleared first)
    fn encode(&mut self, raw: &[u8], out: &mut Vec<u8>) -> Result<(), CodecError>;

    /// Expand one encoded frame into `out` (cleared first)
    fn decode(&mut self, encoded: &[u8], out: &mut Vec<u8>) -> Result<(), CodecError>;
}

/// Identity transform
#[derive(Debug, Default, Clone, Copy)]
pub struct Passthrough;

impl FrameCodec for Passthrough {
    fn name(&self) -> &'static str {
        "passthrough"
    }

    fn encode(&mut self, raw: &[u8], out: &mut Vec<u8>) -> Result<(), CodecError> {
        out.clear();
        out.extend_from_slice(raw);
        Ok(())
    }

    fn decode(&mut self, encoded: &[u8], out: &mut Vec<u8>) -> Result<(), CodecError> {
        out.clear();
        out.extend_from_slice(encoded);
        Ok(())
    }
}

/// Which codec compressed mode uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodecKind {
    #[default]
    Opus,
    Passthrough,
}

/// Build a codec instance for a stream
pub fn build(
    kind: CodecKind,
    format: &StreamFormat,
    period_frames: usize,
    opus: &OpusConfig,
) -> Result<Box<dyn FrameCodec>, CodecError> {
    match kind {
        CodecKind::Passthrough => Ok(Box::new(Passthrough)),
        CodecKind::Opus => Ok(Box::new(OpusCodec::new(format, period_frames, opus)?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_passthrough_reuses_buffer() {
        let mut codec = Passthrough;
        let mut out = vec![9u8; 16];

        codec.encode(&[1, 2, 3], &mut out).unwrap();
        assert_eq!(out, vec![1, 2, 3]);
        assert!(out.capacity() >= 16);

        codec.decode(&[4], &mut out).unwrap();
        assert_eq!(out, vec![4]);
    }

    #[test]
    fn test_build_passthrough() {
        let format = StreamFormat::f32(48000, 2);
        let codec = build(CodecKind::Passthrough, &format, 256, &OpusConfig::default()).unwrap();
        assert_eq!(codec.name(), "passthrough");
    }
}
