//! Error types for the intercom

use thiserror::Error;

/// Main error type for the crate
#[derive(Error, Debug)]
pub enum Error {
    #[error("Audio error: {0}")]
    Audio(#[from] AudioError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Audio backend errors
#[derive(Error, Debug)]
pub enum AudioError {
    #[error("Audio backend initialization failed: {0}")]
    BackendInit(String),

    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Failed to open stream: {0}")]
    StreamOpen(String),

    #[error("Failed to start stream: {0}")]
    StreamStart(String),

    #[error("Invalid frame length: {len} bytes is not a multiple of {frame_bytes}")]
    InvalidFrameLength { len: usize, frame_bytes: usize },

    #[error("Codec setup failed: {0}")]
    Codec(#[from] CodecError),
}

/// Codec errors
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Encoder initialization failed: {0}")]
    EncoderInit(String),

    #[error("Decoder initialization failed: {0}")]
    DecoderInit(String),

    #[error("Encoding failed: {0}")]
    EncodingFailed(String),

    #[error("Decoding failed: {0}")]
    DecodingFailed(String),

    #[error("Invalid frame size: {0}")]
    InvalidFrameSize(usize),
}

/// Transport errors
///
/// Messages are captured as strings so the error can be cloned into
/// status notifications.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Failed to bind port {port}: {reason}")]
    BindFailed { port: u16, reason: String },

    #[error("Connection to {address} failed: {reason}")]
    ConnectFailed { address: String, reason: String },

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    #[error("Connection manager is not running")]
    NotRunning,
}

/// Wire protocol errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Unknown packet type tag 0x{0:02x}")]
    UnknownPacketType(u8),

    #[error("Probe payload must be 8 bytes, got {0}")]
    MalformedProbe(usize),

    #[error("Payload too large: {0} bytes")]
    PayloadTooLarge(usize),
}

/// Result type alias for the crate
pub type Result<T> = std::result::Result<T, Error>;
