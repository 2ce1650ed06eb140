//! # LAN Intercom
//!
//! Low-latency duplex audio between two machines over one TCP link.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────── LOCAL ─────────────────────────────────┐
//! │                                                                        │
//! │  ┌────────────┐  f32   ┌──────────────┐  framed  ┌──────────────────┐  │
//! │  │  Capture   │──────▶ │ level meter  │────────▶ │    Send Queue    │  │
//! │  │  callback  │        │ (+ encoder)  │          │ (network::queue) │  │
//! │  └────────────┘        └──────────────┘          └────────┬─────────┘  │
//! │                                                           │ drain tick │
//! │                                                           ▼            │
//! │  ┌────────────┐        ┌──────────────┐          ┌──────────────────┐  │
//! │  │  Playback  │◀────── │ Frame Bridge │◀──────── │ Connection task  │◀─┼──▶ peer
//! │  │  callback  │ drain  │ (audio::     │ replace  │ (network::       │  │   [tag|len|payload]
//! │  └────────────┘        │   bridge)    │ (decode) │   connection)    │  │
//! │                        └──────────────┘          └──────────────────┘  │
//! └────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The capture and playback callbacks run on backend threads; the connection
//! task runs on tokio. They meet only at the send queue and the bridge.

pub mod audio;
pub mod codec;
pub mod config;
pub mod error;
pub mod network;
pub mod protocol;
pub mod session;

pub use error::{Error, Result};
pub use session::Intercom;

/// Application-wide constants
pub mod constants {
    /// Default sample rate for audio processing
    pub const DEFAULT_SAMPLE_RATE: u32 = 48000;

    /// Default channel count (stereo)
    pub const DEFAULT_CHANNELS: u16 = 2;

    /// Frames per hardware period
    pub const DEFAULT_PERIOD_FRAMES: u32 = 256;

    /// Default Opus bitrate in bits per second
    pub const DEFAULT_BITRATE: u32 = 128_000;

    /// Default TCP port for the intercom link
    pub const DEFAULT_PORT: u16 = 8000;

    pub const PROBE_INTERVAL_MS: u64 = 1000;

    /// Send queue drain period
    pub const DRAIN_INTERVAL_MS: u64 = 10;

    /// Packets written per drain tick
    pub const DRAIN_BATCH: usize = 10;

    /// Send queue depth before the oldest packet is dropped
    pub const SEND_QUEUE_CAPACITY: usize = 32;

    pub const CONNECT_TIMEOUT_MS: u64 = 5000;

    pub const WRITE_TIMEOUT_MS: u64 = 1000;

    /// How often the level meter falls back to zero while audio is stopped
    pub const LEVEL_IDLE_RESET_MS: u64 = 100;
}
