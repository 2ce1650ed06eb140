//! One intercom session
//!
//! Owns the send queue, the frame bridge, the audio engine and the
//! connection manager, and wires them together:
//!
//! capture → queue → connection task → peer → connection task → bridge → playback

use crossbeam_channel::Receiver;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::audio::backend::{AudioBackend, Direction};
use crate::audio::bridge::create_shared_bridge;
use crate::audio::engine::{AudioEngine, EngineStats, StreamSettings, TransmissionMode};
use crate::audio::frame::AudioFrame;
use crate::audio::level::LevelMonitor;
use crate::config::AppConfig;
use crate::error::{Error, Result};
use crate::network::probe::LatencySample;
use crate::network::queue::{create_shared_queue, SendQueueStats, SharedSendQueue};
use crate::network::{ConnectionManager, ConnectionState, NetworkEvent};

/// Audio engine and network link for one peer
pub struct Intercom {
    config: AppConfig,
    queue: SharedSendQueue,
    engine: Arc<Mutex<AudioEngine>>,
    levels: Arc<LevelMonitor>,
    network: ConnectionManager,
    events: Option<mpsc::UnboundedReceiver<NetworkEvent>>,
    idle_reset: JoinHandle<()>,
}

impl Intercom {
    /// Build a session; must be called from within a tokio runtime
    pub fn new(config: AppConfig, backend: Box<dyn AudioBackend>) -> Result<Self> {
        config.validate()?;

        let queue = create_shared_queue(config.network.send_queue_capacity);
        let mut engine = AudioEngine::new(
            backend,
            queue.clone(),
            create_shared_bridge(),
            config.audio.codec,
            config.opus.clone(),
        );
        engine.set_mode(config.audio.mode)?;
        let levels = engine.levels();
        let (network, events) =
            ConnectionManager::spawn(&config.network, queue.clone(), engine.playback_feed());

        let engine = Arc::new(Mutex::new(engine));
        let idle_reset = spawn_idle_reset(
            engine.clone(),
            levels.clone(),
            Duration::from_millis(config.audio.level_idle_reset_ms.max(1)),
        );

        Ok(Self {
            config,
            queue,
            engine,
            levels,
            network,
            events: Some(events),
            idle_reset,
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn list_devices(&self, direction: Direction) -> Result<Vec<String>> {
        Ok(self.engine.lock().list_devices(direction)?)
    }

    /// Start capture and playback with the configured devices
    ///
    /// Uses the mode last chosen with [`set_mode`](Self::set_mode), or the
    /// configured one.
    pub fn start_audio(&self) -> Result<()> {
        let settings = self.config.audio.stream_settings();
        Ok(self.engine.lock().start_with_mode(settings)?)
    }

    pub fn start_audio_with(&self, settings: StreamSettings) -> Result<()> {
        Ok(self.engine.lock().start(settings)?)
    }

    pub fn stop_audio(&self) {
        self.engine.lock().stop();
    }

    pub fn is_audio_running(&self) -> bool {
        self.engine.lock().is_running()
    }

    pub fn set_mode(&self, mode: TransmissionMode) -> Result<()> {
        Ok(self.engine.lock().set_mode(mode)?)
    }

    pub fn mode(&self) -> TransmissionMode {
        self.engine.lock().mode()
    }

    /// Serve on `port`; returns the bound address
    pub async fn listen(&self, port: u16) -> Result<SocketAddr> {
        Ok(self.network.listen(port).await?)
    }

    pub fn connect(&self, host: &str, port: u16) -> Result<()> {
        Ok(self.network.connect(host, port)?)
    }

    /// Dial `network.peer_address` on `network.port`
    pub fn connect_configured(&self) -> Result<()> {
        let host = self
            .config
            .network
            .peer_address
            .as_deref()
            .ok_or_else(|| Error::Config("network.peer_address is not set".into()))?;
        self.connect(host, self.config.network.port)
    }

    pub fn disconnect(&self) -> Result<()> {
        Ok(self.network.disconnect()?)
    }

    /// Network notifications; available once
    pub fn events(&mut self) -> Option<mpsc::UnboundedReceiver<NetworkEvent>> {
        self.events.take()
    }

    /// Level meter updates in [0, 100]
    pub fn levels(&self) -> Receiver<u8> {
        self.levels.subscribe()
    }

    pub fn level(&self) -> u8 {
        self.levels.current()
    }

    pub fn state(&self) -> ConnectionState {
        self.network.state()
    }

    pub fn latency(&self) -> Option<LatencySample> {
        self.network.latency()
    }

    pub fn last_received_frame(&self) -> Option<AudioFrame> {
        self.engine.lock().last_received_frame()
    }

    pub fn engine_stats(&self) -> EngineStats {
        self.engine.lock().stats()
    }

    pub fn queue_stats(&self) -> SendQueueStats {
        self.queue.stats()
    }

    /// Stop audio and close the link
    pub async fn shutdown(self) {
        self.idle_reset.abort();
        self.engine.lock().stop();
        self.network.shutdown().await;
        tracing::info!("Intercom shut down");
    }
}

impl Drop for Intercom {
    fn drop(&mut self) {
        self.idle_reset.abort();
    }
}

fn spawn_idle_reset(
    engine: Arc<Mutex<AudioEngine>>,
    levels: Arc<LevelMonitor>,
    period: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        loop {
            ticker.tick().await;
            // A start or stop in progress holds the lock; try again next tick
            let idle = engine.try_lock().map(|engine| !engine.is_running());
            if idle == Some(true) {
                levels.reset_idle();
            }
        }
    })
}
