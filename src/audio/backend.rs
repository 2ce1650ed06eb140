//! Narrow interface over the platform audio API
//!
//! The engine only ever sees this trait: open a capture or playback stream
//! with a period-driven callback, then start, stop and close it.

use std::fmt;

use crate::error::AudioError;

/// Stream direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Input,
    Output,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Input => f.write_str("capture"),
            Direction::Output => f.write_str("playback"),
        }
    }
}

/// Parameters shared by both stream kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamParams {
    pub sample_rate: u32,
    pub channels: u16,
    pub period_frames: u32,
}

/// Capture callback: receives one period of interleaved f32 samples
pub type CaptureCallback = Box<dyn FnMut(&[f32]) + Send + 'static>;

/// Playback callback: fills one period of interleaved f32 samples
pub type PlaybackCallback = Box<dyn FnMut(&mut [f32]) + Send + 'static>;

/// The two stream variants
pub enum StreamCallback {
    Capture(CaptureCallback),
    Playback(PlaybackCallback),
}

impl StreamCallback {
    pub fn direction(&self) -> Direction {
        match self {
            StreamCallback::Capture(_) => Direction::Input,
            StreamCallback::Playback(_) => Direction::Output,
        }
    }
}

/// An opened stream
pub trait StreamHandle: Send {
    fn start(&mut self) -> Result<(), AudioError>;

    fn stop(&mut self) -> Result<(), AudioError>;

    /// Release the stream; the callback is never invoked afterwards
    fn close(self: Box<Self>);
}

/// Platform audio backend
pub trait AudioBackend: Send {
    /// Acquire the backend. Must be idempotent.
    fn initialize(&mut self) -> Result<(), AudioError>;

    fn is_initialized(&self) -> bool;

    /// Device names for one direction
    fn list_devices(&self, direction: Direction) -> Result<Vec<String>, AudioError>;

    /// Open a stream on `device`, or the default device when `None` or
    /// when the name is unknown
    fn open(
        &mut self,
        device: Option<&str>,
        params: &StreamParams,
        callback: StreamCallback,
    ) -> Result<Box<dyn StreamHandle>, AudioError>;
}
