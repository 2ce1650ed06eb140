//! Audio frame and stream format types

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::AudioError;

/// Sample encoding of a PCM payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SampleFormat {
    /// Signed 16-bit fixed point
    I16,
    /// 32-bit float in [-1.0, 1.0]
    F32,
}

impl SampleFormat {
    /// Bytes per sample
    pub fn width(self) -> usize {
        match self {
            SampleFormat::I16 => 2,
            SampleFormat::F32 => 4,
        }
    }
}

/// Shape of the PCM carried by a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub sample_format: SampleFormat,
}

impl StreamFormat {
    pub fn new(sample_rate: u32, channels: u16, sample_format: SampleFormat) -> Self {
        Self {
            sample_rate,
            channels,
            sample_format,
        }
    }

    /// Float format, which is what the hardware callbacks deliver
    pub fn f32(sample_rate: u32, channels: u16) -> Self {
        Self::new(sample_rate, channels, SampleFormat::F32)
    }

    /// Bytes for one multi-channel sample frame
    pub fn bytes_per_frame(&self) -> usize {
        self.channels as usize * self.sample_format.width()
    }

    /// Bytes for a whole period
    pub fn period_bytes(&self, frame_count: usize) -> usize {
        frame_count * self.bytes_per_frame()
    }

    /// Period duration in microseconds
    pub fn duration_us(&self, frame_count: usize) -> u64 {
        (frame_count as u64 * 1_000_000) / self.sample_rate.max(1) as u64
    }
}

/// A block of interleaved PCM for one period
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    format: StreamFormat,
    frame_count: usize,
    payload: Bytes,
}

impl AudioFrame {
    /// Wrap a payload, checking it holds a whole number of sample frames
    pub fn from_payload(format: StreamFormat, payload: impl Into<Bytes>) -> Result<Self, AudioError> {
        let payload = payload.into();
        let frame_bytes = format.bytes_per_frame();
        if frame_bytes == 0 || payload.len() % frame_bytes != 0 {
            return Err(AudioError::InvalidFrameLength {
                len: payload.len(),
                frame_bytes,
            });
        }

        Ok(Self {
            format,
            frame_count: payload.len() / frame_bytes,
            payload,
        })
    }

    /// Build an f32 frame from interleaved samples
    pub fn from_samples(sample_rate: u32, channels: u16, samples: &[f32]) -> Result<Self, AudioError> {
        let mut payload = Vec::with_capacity(samples.len() * 4);
        write_f32_le(samples, &mut payload);
        Self::from_payload(StreamFormat::f32(sample_rate, channels), payload)
    }

    pub fn format(&self) -> StreamFormat {
        self.format
    }

    pub fn frame_count(&self) -> usize {
        self.frame_count
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Frame duration in microseconds
    pub fn duration_us(&self) -> u64 {
        self.format.duration_us(self.frame_count)
    }

    /// Samples normalized to f32 regardless of the stored format
    pub fn to_f32(&self) -> Vec<f32> {
        match self.format.sample_format {
            SampleFormat::F32 => {
                let mut out = vec![0.0; self.payload.len() / 4];
                read_f32_le(&self.payload, &mut out);
                out
            }
            SampleFormat::I16 => self
                .payload
                .chunks_exact(2)
                .map(|b| i16::from_le_bytes([b[0], b[1]]) as f32 / i16::MAX as f32)
                .collect(),
        }
    }
}

/// Append f32 samples as little-endian bytes
pub fn write_f32_le(samples: &[f32], out: &mut Vec<u8>) {
    for sample in samples {
        out.extend_from_slice(&sample.to_le_bytes());
    }
}

/// Decode little-endian f32 bytes into `out`
///
/// Returns the number of samples written; `out` entries past that are left
/// untouched.
pub fn read_f32_le(bytes: &[u8], out: &mut [f32]) -> usize {
    let mut written = 0;
    for (slot, chunk) in out.iter_mut().zip(bytes.chunks_exact(4)) {
        *slot = f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        written += 1;
    }
    written
}
