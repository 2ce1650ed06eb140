//! Audio subsystem module

pub mod backend;
pub mod bridge;
pub mod device;
pub mod engine;
pub mod frame;
pub mod level;

pub use backend::{AudioBackend, Direction, StreamParams};
pub use bridge::{create_shared_bridge, FrameBridge, SharedFrameBridge};
pub use device::CpalBackend;
pub use engine::{AudioEngine, PlaybackFeed, StreamSettings, TransmissionMode};
pub use frame::{AudioFrame, SampleFormat, StreamFormat};
pub use level::{level_from_samples, LevelMonitor};
