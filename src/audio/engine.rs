//! Audio engine: one capture stream, one playback stream
//!
//! The capture callback meters each period, optionally compresses it and
//! pushes it into the send queue. The playback callback drains the frame
//! bridge. Both run on backend real-time threads and only touch the queue,
//! the bridge and atomics.
//!
//! Received audio goes through [`PlaybackFeed`] on the network side, which
//! decodes before touching the bridge so no codec work happens under its
//! lock.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::audio::backend::{
    AudioBackend, CaptureCallback, Direction, PlaybackCallback, StreamCallback, StreamHandle,
    StreamParams,
};
use crate::audio::bridge::{BridgeStats, SharedFrameBridge};
use crate::audio::frame::{read_f32_le, write_f32_le, AudioFrame, StreamFormat};
use crate::audio::level::LevelMonitor;
use crate::codec::{self, CodecKind, FrameCodec};
use crate::config::OpusConfig;
use crate::error::AudioError;
use crate::network::queue::SharedSendQueue;
use crate::network::AudioSink;
use crate::protocol::PacketType;

/// How audio is carried on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransmissionMode {
    /// f32 PCM as captured, lowest latency
    #[default]
    Raw,
    /// Passed through the configured codec
    Compressed,
}

/// Devices and stream shape for a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamSettings {
    pub input_device: Option<String>,
    pub output_device: Option<String>,
    pub sample_rate: u32,
    pub channels: u16,
    pub period_frames: u32,
    pub mode: TransmissionMode,
}

impl StreamSettings {
    pub fn params(&self) -> StreamParams {
        StreamParams {
            sample_rate: self.sample_rate,
            channels: self.channels,
            period_frames: self.period_frames,
        }
    }

    pub fn format(&self) -> StreamFormat {
        StreamFormat::f32(self.sample_rate, self.channels)
    }

    pub fn period_bytes(&self) -> usize {
        self.format().period_bytes(self.period_frames as usize)
    }
}

/// State shared between the engine, its callbacks and the playback feed
struct EngineShared {
    running: AtomicBool,
    /// Receive-side codec; `None` in raw mode
    decoder: Mutex<Option<Box<dyn FrameCodec>>>,
    /// Bytes per sample frame of the running stream, 0 when stopped
    frame_bytes: AtomicUsize,
    format: Mutex<Option<StreamFormat>>,
    periods_captured: AtomicU64,
    encode_errors: AtomicU64,
    decode_errors: AtomicU64,
}

impl EngineShared {
    fn new() -> Self {
        Self {
            running: AtomicBool::new(false),
            decoder: Mutex::new(None),
            frame_bytes: AtomicUsize::new(0),
            format: Mutex::new(None),
            periods_captured: AtomicU64::new(0),
            encode_errors: AtomicU64::new(0),
            decode_errors: AtomicU64::new(0),
        }
    }
}

/// Owner of the capture and playback streams
pub struct AudioEngine {
    backend: Box<dyn AudioBackend>,
    send_queue: SharedSendQueue,
    bridge: SharedFrameBridge,
    levels: Arc<LevelMonitor>,
    shared: Arc<EngineShared>,
    codec_kind: CodecKind,
    opus: OpusConfig,
    capture: Option<Box<dyn StreamHandle>>,
    playback: Option<Box<dyn StreamHandle>>,
    settings: Option<StreamSettings>,
    mode: TransmissionMode,
}

impl AudioEngine {
    pub fn new(
        backend: Box<dyn AudioBackend>,
        send_queue: SharedSendQueue,
        bridge: SharedFrameBridge,
        codec_kind: CodecKind,
        opus: OpusConfig,
    ) -> Self {
        Self {
            backend,
            send_queue,
            bridge,
            levels: Arc::new(LevelMonitor::new()),
            shared: Arc::new(EngineShared::new()),
            codec_kind,
            opus,
            capture: None,
            playback: None,
            settings: None,
            mode: TransmissionMode::Raw,
        }
    }

    /// Acquire the backend; repeated calls are no-ops
    pub fn initialize(&mut self) -> Result<(), AudioError> {
        if self.backend.is_initialized() {
            return Ok(());
        }
        self.backend.initialize()
    }

    pub fn list_devices(&mut self, direction: Direction) -> Result<Vec<String>, AudioError> {
        self.initialize()?;
        self.backend.list_devices(direction)
    }

    /// Open and start both streams
    ///
    /// A running engine is stopped first, but only once the codecs for the
    /// new settings have been built: a codec error leaves it running. If
    /// either stream fails, whatever was opened is closed again before the
    /// error is returned.
    pub fn start(&mut self, settings: StreamSettings) -> Result<(), AudioError> {
        self.initialize()?;

        let format = settings.format();
        let params = settings.params();
        let period_frames = settings.period_frames as usize;

        let (encoder, decoder) = match settings.mode {
            TransmissionMode::Raw => (None, None),
            TransmissionMode::Compressed => (
                Some(codec::build(self.codec_kind, &format, period_frames, &self.opus)?),
                Some(codec::build(self.codec_kind, &format, period_frames, &self.opus)?),
            ),
        };

        if self.is_running() {
            self.stop();
        }

        let capture_cb = capture_callback(
            self.send_queue.clone(),
            self.levels.clone(),
            self.shared.clone(),
            encoder,
            settings.period_bytes(),
        );
        let playback_cb = playback_callback(self.bridge.clone(), settings.period_bytes());

        let mut capture = self.backend.open(
            settings.input_device.as_deref(),
            &params,
            StreamCallback::Capture(capture_cb),
        )?;

        let mut playback = match self.backend.open(
            settings.output_device.as_deref(),
            &params,
            StreamCallback::Playback(playback_cb),
        ) {
            Ok(stream) => stream,
            Err(e) => {
                capture.close();
                return Err(e);
            }
        };

        if let Err(e) = capture.start() {
            capture.close();
            playback.close();
            return Err(e);
        }

        if let Err(e) = playback.start() {
            let _ = capture.stop();
            capture.close();
            playback.close();
            return Err(e);
        }

        *self.shared.decoder.lock() = decoder;
        *self.shared.format.lock() = Some(format);
        self.shared.frame_bytes.store(format.bytes_per_frame(), Ordering::Release);
        self.shared.running.store(true, Ordering::Release);

        tracing::info!(
            "Audio engine started: {}Hz, {} channels, {} frames/period, {:?} mode",
            settings.sample_rate,
            settings.channels,
            settings.period_frames,
            settings.mode
        );

        self.capture = Some(capture);
        self.playback = Some(playback);
        self.mode = settings.mode;
        self.settings = Some(settings);
        Ok(())
    }

    /// Stop and release both streams; no-op when idle
    pub fn stop(&mut self) {
        if self.capture.is_none() && self.playback.is_none() {
            return;
        }

        self.shared.running.store(false, Ordering::Release);

        for mut stream in [self.capture.take(), self.playback.take()].into_iter().flatten() {
            if let Err(e) = stream.stop() {
                tracing::warn!("Failed to stop stream: {}", e);
            }
            stream.close();
        }

        *self.shared.decoder.lock() = None;
        *self.shared.format.lock() = None;
        self.shared.frame_bytes.store(0, Ordering::Release);
        self.bridge.clear();

        tracing::info!("Audio engine stopped");
    }

    /// Switch transmission mode, restarting the streams if running
    ///
    /// The restart reuses the devices of the previous `start`. When the
    /// codec for `mode` cannot be built the engine keeps running in its
    /// current mode. While stopped the mode is only recorded and applies to
    /// the next [`start_with_mode`](Self::start_with_mode).
    pub fn set_mode(&mut self, mode: TransmissionMode) -> Result<(), AudioError> {
        if mode == self.mode {
            return Ok(());
        }

        match (self.is_running(), self.settings.clone()) {
            (true, Some(mut settings)) => {
                settings.mode = mode;
                self.start(settings)
            }
            _ => {
                self.mode = mode;
                Ok(())
            }
        }
    }

    /// Start with `settings` in the currently selected mode
    pub fn start_with_mode(&mut self, mut settings: StreamSettings) -> Result<(), AudioError> {
        settings.mode = self.mode;
        self.start(settings)
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    pub fn mode(&self) -> TransmissionMode {
        self.mode
    }

    pub fn settings(&self) -> Option<&StreamSettings> {
        self.settings.as_ref()
    }

    pub fn levels(&self) -> Arc<LevelMonitor> {
        self.levels.clone()
    }

    /// Receive-side handle for the connection manager
    pub fn playback_feed(&self) -> PlaybackFeed {
        PlaybackFeed {
            bridge: self.bridge.clone(),
            shared: self.shared.clone(),
            scratch: Vec::new(),
        }
    }

    /// Copy of the most recently received frame
    ///
    /// The whole frame, including any part playback has already consumed.
    /// `None` while stopped or before the first frame arrives.
    pub fn last_received_frame(&self) -> Option<AudioFrame> {
        let format = (*self.shared.format.lock())?;
        let len = self.bridge.frame_len();
        if len == 0 {
            return None;
        }

        let mut bytes = vec![0u8; len];
        let copied = self.bridge.consume_into(&mut bytes);
        bytes.truncate(copied);
        AudioFrame::from_payload(format, bytes).ok()
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            running: self.is_running(),
            mode: self.mode,
            level: self.levels.current(),
            periods_captured: self.shared.periods_captured.load(Ordering::Relaxed),
            encode_errors: self.shared.encode_errors.load(Ordering::Relaxed),
            decode_errors: self.shared.decode_errors.load(Ordering::Relaxed),
            bridge: self.bridge.stats(),
        }
    }
}

impl Drop for AudioEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

fn capture_callback(
    queue: SharedSendQueue,
    levels: Arc<LevelMonitor>,
    shared: Arc<EngineShared>,
    mut encoder: Option<Box<dyn FrameCodec>>,
    period_bytes: usize,
) -> CaptureCallback {
    let mut raw: Vec<u8> = Vec::with_capacity(period_bytes);
    let mut encoded: Vec<u8> = Vec::with_capacity(period_bytes);

    Box::new(move |samples: &[f32]| {
        levels.measure(samples);
        shared.periods_captured.fetch_add(1, Ordering::Relaxed);

        raw.clear();
        write_f32_le(samples, &mut raw);

        let payload = match encoder.as_mut() {
            Some(codec) => match codec.encode(&raw, &mut encoded) {
                Ok(()) => &encoded[..],
                Err(_) => {
                    shared.encode_errors.fetch_add(1, Ordering::Relaxed);
                    return;
                }
            },
            None => &raw[..],
        };

        queue.enqueue(PacketType::Audio, payload);
    })
}

fn playback_callback(bridge: SharedFrameBridge, period_bytes: usize) -> PlaybackCallback {
    let mut bytes = vec![0u8; period_bytes];

    Box::new(move |out: &mut [f32]| {
        let needed = out.len() * 4;
        if bytes.len() < needed {
            // Only if the backend hands us a larger period than configured
            bytes.resize(needed, 0);
        }

        let buf = &mut bytes[..needed];
        bridge.drain_into(buf);
        read_f32_le(buf, out);
    })
}

/// Receive path into the frame bridge
///
/// Lives on the network event loop. Decodes when the engine runs in
/// compressed mode and swaps the result into the bridge, reusing the
/// displaced buffer for the next frame.
pub struct PlaybackFeed {
    bridge: SharedFrameBridge,
    shared: Arc<EngineShared>,
    scratch: Vec<u8>,
}

impl PlaybackFeed {
    pub fn deliver_payload(&mut self, payload: &[u8]) {
        if !self.shared.running.load(Ordering::Acquire) {
            return;
        }

        {
            let mut decoder = self.shared.decoder.lock();
            match decoder.as_mut() {
                Some(codec) => {
                    if let Err(e) = codec.decode(payload, &mut self.scratch) {
                        self.shared.decode_errors.fetch_add(1, Ordering::Relaxed);
                        tracing::debug!("Dropping undecodable audio frame: {}", e);
                        return;
                    }
                }
                None => {
                    self.scratch.clear();
                    self.scratch.extend_from_slice(payload);
                }
            }
        }

        let frame_bytes = self.shared.frame_bytes.load(Ordering::Acquire);
        if frame_bytes > 0 {
            let whole = self.scratch.len() - self.scratch.len() % frame_bytes;
            if whole != self.scratch.len() {
                tracing::debug!(
                    "Trimming audio frame from {} to {} bytes",
                    self.scratch.len(),
                    whole
                );
                self.scratch.truncate(whole);
            }
        }

        let spare = self.bridge.replace(std::mem::take(&mut self.scratch));
        self.scratch = spare;
    }
}

impl AudioSink for PlaybackFeed {
    fn deliver(&mut self, payload: &[u8]) {
        self.deliver_payload(payload);
    }
}

/// Engine counters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineStats {
    pub running: bool,
    pub mode: TransmissionMode,
    pub level: u8,
    pub periods_captured: u64,
    pub encode_errors: u64,
    pub decode_errors: u64,
    pub bridge: BridgeStats,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::backend::mock::{MockBackend, MockControl};
    use crate::audio::bridge::create_shared_bridge;
    use crate::network::queue::{create_shared_queue, SharedSendQueue};
    use crate::protocol::decode_frame;

    fn settings(mode: TransmissionMode) -> StreamSettings {
        StreamSettings {
            input_device: Some("mic".to_string()),
            output_device: Some("speakers".to_string()),
            sample_rate: 48000,
            channels: 2,
            period_frames: 4,
            mode,
        }
    }

    fn engine() -> (AudioEngine, MockControl, SharedSendQueue, SharedFrameBridge) {
        let (backend, control) = MockBackend::new();
        let queue = create_shared_queue(8);
        let bridge = create_shared_bridge();
        let engine = AudioEngine::new(
            Box::new(backend),
            queue.clone(),
            bridge.clone(),
            CodecKind::Passthrough,
            OpusConfig::default(),
        );
        (engine, control, queue, bridge)
    }

    fn pop_payload(queue: &SharedSendQueue) -> Option<Vec<u8>> {
        let mut batch = Vec::new();
        queue.pop_batch(1, &mut batch);
        batch.pop().map(|packet| {
            let frame = decode_frame(&packet).unwrap();
            assert_eq!(frame.packet_type, PacketType::Audio);
            frame.payload.to_vec()
        })
    }

    fn f32_bytes(samples: &[f32]) -> Vec<u8> {
        let mut bytes = Vec::new();
        write_f32_le(samples, &mut bytes);
        bytes
    }

    #[test]
    fn test_initialize_is_idempotent() {
        let (mut engine, control, _, _) = engine();
        engine.initialize().unwrap();
        engine.initialize().unwrap();
        assert_eq!(control.initialize_calls(), 1);
    }

    #[test]
    fn test_start_opens_both_streams() {
        let (mut engine, control, _, _) = engine();
        engine.start(settings(TransmissionMode::Raw)).unwrap();

        assert!(engine.is_running());
        assert_eq!(control.opened(), 2);
        assert_eq!(control.running(), 2);
        assert_eq!(
            control.devices_requested(),
            vec![Some("mic".to_string()), Some("speakers".to_string())]
        );
    }

    #[test]
    fn test_capture_meters_and_enqueues_raw() {
        let (mut engine, control, queue, _) = engine();
        queue.open();
        engine.start(settings(TransmissionMode::Raw)).unwrap();
        let levels = engine.levels().subscribe();

        let samples = [1.0f32, -1.0, 1.0, -1.0, 1.0, -1.0, 1.0, -1.0];
        assert!(control.capture(&samples));

        assert_eq!(levels.try_recv(), Ok(100));
        assert_eq!(pop_payload(&queue), Some(f32_bytes(&samples)));
        assert_eq!(engine.stats().periods_captured, 1);
    }

    #[test]
    fn test_capture_with_closed_queue_drops() {
        let (mut engine, control, queue, _) = engine();
        engine.start(settings(TransmissionMode::Raw)).unwrap();

        control.capture(&[0.0; 8]);
        assert!(queue.is_empty());
        assert_eq!(queue.stats().rejected, 1);
    }

    #[test]
    fn test_playback_open_failure_closes_capture() {
        let (mut engine, control, _, _) = engine();
        control.fail_open(Direction::Output);

        let err = engine.start(settings(TransmissionMode::Raw)).unwrap_err();
        assert!(matches!(err, AudioError::StreamOpen(_)));
        assert!(!engine.is_running());
        assert_eq!(control.opened(), 1);
        assert_eq!(control.live(), 0);
    }

    #[test]
    fn test_playback_start_failure_releases_both() {
        let (mut engine, control, _, _) = engine();
        control.fail_start(Direction::Output);

        let err = engine.start(settings(TransmissionMode::Raw)).unwrap_err();
        assert!(matches!(err, AudioError::StreamStart(_)));
        assert_eq!(control.live(), 0);
        assert_eq!(control.running(), 0);
    }

    #[test]
    fn test_restart_stops_first() {
        let (mut engine, control, _, _) = engine();
        engine.start(settings(TransmissionMode::Raw)).unwrap();
        engine.start(settings(TransmissionMode::Raw)).unwrap();

        assert_eq!(control.opened(), 4);
        assert_eq!(control.closed(), 2);
        assert_eq!(control.live(), 2);
    }

    #[test]
    fn test_stop_is_idempotent() {
        let (mut engine, control, _, _) = engine();
        engine.stop();
        engine.start(settings(TransmissionMode::Raw)).unwrap();
        engine.stop();
        engine.stop();

        assert!(!engine.is_running());
        assert_eq!(control.live(), 0);
    }

    #[test]
    fn test_playback_plays_received_frame_then_silence() {
        let (mut engine, control, _, _) = engine();
        engine.start(settings(TransmissionMode::Raw)).unwrap();

        let mut feed = engine.playback_feed();
        let samples = [0.25f32, -0.25, 0.5, -0.5];
        feed.deliver(&f32_bytes(&samples));

        let mut out = [9.0f32; 8];
        assert!(control.render(&mut out));
        assert_eq!(out, [0.25, -0.25, 0.5, -0.5, 0.0, 0.0, 0.0, 0.0]);

        // Already played: silence, not a repeat
        control.render(&mut out);
        assert_eq!(out, [0.0; 8]);
    }

    #[test]
    fn test_feed_ignored_while_stopped() {
        let (engine, _, _, bridge) = engine();
        let mut feed = engine.playback_feed();
        feed.deliver(&f32_bytes(&[1.0; 8]));
        assert_eq!(bridge.pending(), 0);
    }

    #[test]
    fn test_feed_trims_partial_sample_frames() {
        let (mut engine, _, _, bridge) = engine();
        engine.start(settings(TransmissionMode::Raw)).unwrap();

        let mut feed = engine.playback_feed();
        feed.deliver(&[0u8; 19]);
        assert_eq!(bridge.pending(), 16);
    }

    #[test]
    fn test_last_received_frame() {
        let (mut engine, _, _, _) = engine();
        engine.start(settings(TransmissionMode::Raw)).unwrap();
        assert!(engine.last_received_frame().is_none());

        engine.playback_feed().deliver(&f32_bytes(&[0.5; 8]));
        let frame = engine.last_received_frame().unwrap();
        assert_eq!(frame.frame_count(), 4);
        assert_eq!(frame.to_f32(), vec![0.5; 8]);
    }

    #[test]
    fn test_last_received_frame_survives_partial_playback() {
        let (mut engine, control, _, _) = engine();
        engine.start(settings(TransmissionMode::Raw)).unwrap();

        let samples = [0.1f32, 0.2, 0.3, 0.4, 0.5, 0.6, 0.7, 0.8, 0.9, 1.0, -0.1, -0.2];
        engine.playback_feed().deliver(&f32_bytes(&samples));

        let mut out = [0.0f32; 8];
        control.render(&mut out);

        let frame = engine.last_received_frame().unwrap();
        assert_eq!(frame.frame_count(), 6);
        assert_eq!(frame.to_f32(), samples.to_vec());
    }

    #[test]
    fn test_set_mode_restarts_with_same_devices() {
        let (mut engine, control, queue, _) = engine();
        queue.open();
        engine.start(settings(TransmissionMode::Raw)).unwrap();

        engine.set_mode(TransmissionMode::Compressed).unwrap();
        assert!(engine.is_running());
        assert_eq!(engine.mode(), TransmissionMode::Compressed);
        assert_eq!(control.opened(), 4);
        assert_eq!(control.live(), 2);

        let requested = control.devices_requested();
        assert_eq!(requested[2], Some("mic".to_string()));
        assert_eq!(requested[3], Some("speakers".to_string()));

        // Passthrough codec: payload still round-trips through encode/decode
        control.capture(&[0.5; 8]);
        let payload = pop_payload(&queue).unwrap();
        engine.playback_feed().deliver(&payload);

        let mut out = [0.0f32; 8];
        control.render(&mut out);
        assert_eq!(out, [0.5; 8]);
    }

    #[test]
    fn test_set_mode_while_stopped_only_records() {
        let (mut engine, control, _, _) = engine();
        engine.set_mode(TransmissionMode::Compressed).unwrap();
        assert_eq!(engine.mode(), TransmissionMode::Compressed);
        assert_eq!(control.opened(), 0);
    }

    #[test]
    fn test_compressed_opus_rejects_bad_period() {
        let (backend, control) = MockBackend::new();
        let mut engine = AudioEngine::new(
            Box::new(backend),
            create_shared_queue(4),
            create_shared_bridge(),
            CodecKind::Opus,
            OpusConfig::default(),
        );

        let err = engine.start(settings(TransmissionMode::Compressed)).unwrap_err();
        assert!(matches!(err, AudioError::Codec(_)));
        assert_eq!(control.opened(), 0);
    }

    #[test]
    fn test_failed_mode_switch_keeps_audio_running() {
        let (backend, control) = MockBackend::new();
        let queue = create_shared_queue(4);
        queue.open();
        let mut engine = AudioEngine::new(
            Box::new(backend),
            queue.clone(),
            create_shared_bridge(),
            CodecKind::Opus,
            OpusConfig::default(),
        );
        engine.start(settings(TransmissionMode::Raw)).unwrap();

        // 4 frames is not an Opus frame size
        let err = engine.set_mode(TransmissionMode::Compressed).unwrap_err();
        assert!(matches!(err, AudioError::Codec(_)));

        assert!(engine.is_running());
        assert_eq!(engine.mode(), TransmissionMode::Raw);
        assert_eq!(control.opened(), 2);
        assert_eq!(control.running(), 2);

        assert!(control.capture(&[0.5; 8]));
        assert_eq!(pop_payload(&queue), Some(f32_bytes(&[0.5; 8])));
    }

    #[test]
    fn test_start_with_mode_uses_recorded_mode() {
        let (mut engine, _, _, _) = engine();
        engine.set_mode(TransmissionMode::Compressed).unwrap();

        engine.start_with_mode(settings(TransmissionMode::Raw)).unwrap();
        assert_eq!(engine.mode(), TransmissionMode::Compressed);
        assert_eq!(engine.settings().map(|s| s.mode), Some(TransmissionMode::Compressed));
    }

    #[test]
    fn test_list_devices_initializes() {
        let (mut engine, control, _, _) = engine();
        let devices = engine.list_devices(Direction::Input).unwrap();
        assert_eq!(devices, vec!["mock capture".to_string()]);
        assert_eq!(control.initialize_calls(), 1);
    }
}
