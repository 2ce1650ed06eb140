//! Opus implementation of the frame codec
//!
//! Raw frames are little-endian f32 PCM. Opus only accepts 2.5, 5, 10, 20,
//! 40 or 60 ms periods, so the period size is checked up front rather than
//! failing on the first callback.

use ::opus::{Application, Channels, Decoder, Encoder};

use crate::audio::frame::{read_f32_le, write_f32_le, SampleFormat, StreamFormat};
use crate::codec::FrameCodec;
use crate::config::{OpusApplication, OpusConfig};
use crate::error::CodecError;

/// Largest packet Opus will produce for one frame
const MAX_PACKET_BYTES: usize = 4000;

/// Opus encoder and decoder pair for one stream
pub struct OpusCodec {
    encoder: Encoder,
    decoder: Decoder,
    channels: usize,
    frame_size: usize,
    /// Reused sample buffer for both directions
    pcm: Vec<f32>,
    packet: Vec<u8>,
    frames_encoded: u64,
    frames_decoded: u64,
}

impl OpusCodec {
    pub fn new(format: &StreamFormat, period_frames: usize, config: &OpusConfig) -> Result<Self, CodecError> {
        if format.sample_format != SampleFormat::F32 {
            return Err(CodecError::EncoderInit("Opus codec expects f32 PCM".to_string()));
        }

        let channels = match format.channels {
            1 => Channels::Mono,
            2 => Channels::Stereo,
            n => {
                return Err(CodecError::EncoderInit(format!(
                    "Unsupported channel count: {}",
                    n
                )))
            }
        };

        if !is_valid_frame_size(format.sample_rate, period_frames) {
            return Err(CodecError::InvalidFrameSize(period_frames));
        }

        let application = match config.application {
            OpusApplication::Voip => Application::Voip,
            OpusApplication::Audio => Application::Audio,
            OpusApplication::LowDelay => Application::LowDelay,
        };

        let mut encoder = Encoder::new(format.sample_rate, channels, application)
            .map_err(|e| CodecError::EncoderInit(e.to_string()))?;
        Self::configure_encoder(&mut encoder, config)?;

        let decoder = Decoder::new(format.sample_rate, channels)
            .map_err(|e| CodecError::DecoderInit(e.to_string()))?;

        // 120 ms is the longest frame a peer can send
        let max_samples = format.sample_rate as usize * format.channels as usize * 120 / 1000;

        Ok(Self {
            encoder,
            decoder,
            channels: format.channels as usize,
            frame_size: period_frames,
            pcm: vec![0.0; max_samples.max(period_frames * format.channels as usize)],
            packet: vec![0u8; MAX_PACKET_BYTES],
            frames_encoded: 0,
            frames_decoded: 0,
        })
    }

    fn configure_encoder(encoder: &mut Encoder, config: &OpusConfig) -> Result<(), CodecError> {
        encoder
            .set_bitrate(::opus::Bitrate::Bits(config.bitrate as i32))
            .map_err(|e| CodecError::EncoderInit(format!("Failed to set bitrate: {}", e)))?;

        encoder
            .set_vbr(config.vbr)
            .map_err(|e| CodecError::EncoderInit(format!("Failed to set VBR: {}", e)))?;

        encoder
            .set_inband_fec(config.fec)
            .map_err(|e| CodecError::EncoderInit(format!("Failed to set FEC: {}", e)))?;

        if config.fec {
            encoder
                .set_packet_loss_perc(config.packet_loss_perc as i32)
                .map_err(|e| CodecError::EncoderInit(format!("Failed to set packet loss: {}", e)))?;
        }

        Ok(())
    }

    /// Samples per channel in one period
    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    pub fn frames_encoded(&self) -> u64 {
        self.frames_encoded
    }

    pub fn frames_decoded(&self) -> u64 {
        self.frames_decoded
    }
}

impl FrameCodec for OpusCodec {
    fn name(&self) -> &'static str {
        "opus"
    }

    fn encode(&mut self, raw: &[u8], out: &mut Vec<u8>) -> Result<(), CodecError> {
        let expected = self.frame_size * self.channels;
        if raw.len() != expected * 4 {
            return Err(CodecError::InvalidFrameSize(raw.len() / 4 / self.channels.max(1)));
        }

        let samples = read_f32_le(raw, &mut self.pcm[..expected]);
        let size = self
            .encoder
            .encode_float(&self.pcm[..samples], &mut self.packet)
            .map_err(|e| CodecError::EncodingFailed(e.to_string()))?;

        out.clear();
        out.extend_from_slice(&self.packet[..size]);
        self.frames_encoded += 1;
        Ok(())
    }

    fn decode(&mut self, encoded: &[u8], out: &mut Vec<u8>) -> Result<(), CodecError> {
        let per_channel = self
            .decoder
            .decode_float(encoded, &mut self.pcm, false)
            .map_err(|e| CodecError::DecodingFailed(e.to_string()))?;

        out.clear();
        write_f32_le(&self.pcm[..per_channel * self.channels], out);
        self.frames_decoded += 1;
        Ok(())
    }
}

/// Whether Opus accepts `frames` samples per channel at `sample_rate`
pub fn is_valid_frame_size(sample_rate: u32, frames: usize) -> bool {
    // Allowed durations in tenths of a millisecond
    [25u64, 50, 100, 200, 400, 600]
        .iter()
        .any(|tenths| sample_rate as u64 * tenths == frames as u64 * 10_000)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine_bytes(frames: usize, channels: usize) -> Vec<u8> {
        let mut samples = Vec::with_capacity(frames * channels);
        for i in 0..frames {
            let t = i as f32 / 48000.0;
            let val = (t * 440.0 * 2.0 * std::f32::consts::PI).sin() * 0.5;
            for _ in 0..channels {
                samples.push(val);
            }
        }
        let mut bytes = Vec::new();
        write_f32_le(&samples, &mut bytes);
        bytes
    }

    #[test]
    fn test_frame_sizes() {
        assert!(is_valid_frame_size(48000, 480));
        assert!(is_valid_frame_size(48000, 120));
        assert!(is_valid_frame_size(16000, 320));
        assert!(!is_valid_frame_size(48000, 256));
    }

    #[test]
    fn test_rejects_invalid_period() {
        let format = StreamFormat::f32(48000, 2);
        let result = OpusCodec::new(&format, 256, &OpusConfig::default());
        assert!(matches!(result, Err(CodecError::InvalidFrameSize(256))));
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let format = StreamFormat::f32(48000, 2);
        let mut codec = OpusCodec::new(&format, 480, &OpusConfig::default()).unwrap();

        let raw = sine_bytes(480, 2);
        let mut encoded = Vec::new();
        codec.encode(&raw, &mut encoded).unwrap();
        assert!(!encoded.is_empty());
        assert!(encoded.len() < raw.len());

        let mut decoded = Vec::new();
        codec.decode(&encoded, &mut decoded).unwrap();
        assert_eq!(decoded.len(), raw.len());
        assert_eq!(codec.frames_encoded(), 1);
        assert_eq!(codec.frames_decoded(), 1);
    }

    #[test]
    fn test_encode_wrong_length() {
        let format = StreamFormat::f32(48000, 1);
        let mut codec = OpusCodec::new(&format, 480, &OpusConfig::default()).unwrap();
        let mut out = Vec::new();
        assert!(codec.encode(&[0u8; 12], &mut out).is_err());
    }
}
