//! Connection manager
//!
//! A single tokio task owns the listener, the pending dial, the stream and
//! both timers, so every state transition happens in one place. The public
//! [`ConnectionManager`] is a thin handle that sends commands to it.
//!
//! ```text
//!  Disconnected ──listen──▶ Listening ──accept──▶ Connected
//!       │                      ▲                     │
//!       └──connect──▶ Connecting ──ok──▶ Connected   │ peer gone
//!                          │ err                     ▼
//!                          └──────────────▶ Disconnected ──(server)──▶ Listening
//! ```

use bytes::{Buf, BytesMut};
use parking_lot::Mutex;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};

use crate::config::NetworkConfig;
use crate::error::TransportError;
use crate::network::probe::{Clock, LatencyProbe, LatencySample, SystemClock};
use crate::network::queue::SharedSendQueue;
use crate::network::socket;
use crate::network::{AudioSink, ConnectionState, ConnectionStatus, NetworkEvent};
use crate::protocol::{decode_frame, DecodeError, PacketType};

/// Initial receive buffer; grows if the peer sends larger frames
const READ_BUFFER_CAPACITY: usize = 16 * 1024;

type PendingConnect = Pin<Box<dyn Future<Output = Result<TcpStream, TransportError>> + Send>>;

enum Command {
    Listen {
        port: u16,
        reply: oneshot::Sender<Result<SocketAddr, TransportError>>,
    },
    Connect {
        host: String,
        port: u16,
    },
    Disconnect,
    Shutdown,
}

/// Timing knobs for one manager, taken from [`NetworkConfig`]
#[derive(Debug, Clone, Copy)]
struct LinkTiming {
    probe_interval: Duration,
    drain_interval: Duration,
    drain_batch: usize,
    connect_timeout: Duration,
    write_timeout: Duration,
}

impl From<&NetworkConfig> for LinkTiming {
    fn from(config: &NetworkConfig) -> Self {
        Self {
            probe_interval: config.probe_interval(),
            drain_interval: config.drain_interval(),
            drain_batch: config.drain_batch.max(1),
            connect_timeout: config.connect_timeout(),
            write_timeout: config.write_timeout(),
        }
    }
}

/// Handle to the connection event loop
///
/// Dropping the handle stops the loop and closes any open socket.
pub struct ConnectionManager {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
    latency: Arc<Mutex<Option<LatencySample>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionManager {
    /// Start the event loop on the current tokio runtime
    ///
    /// Audio payloads from the peer go to `sink`; the returned receiver
    /// yields status, latency and error notifications.
    pub fn spawn<S: AudioSink>(
        config: &NetworkConfig,
        queue: SharedSendQueue,
        sink: S,
    ) -> (Self, mpsc::UnboundedReceiver<NetworkEvent>) {
        Self::spawn_with_clock(config, queue, sink, Arc::new(SystemClock))
    }

    /// Same as [`spawn`](Self::spawn) with an explicit probe clock
    pub fn spawn_with_clock<S: AudioSink>(
        config: &NetworkConfig,
        queue: SharedSendQueue,
        sink: S,
        clock: Arc<dyn Clock>,
    ) -> (Self, mpsc::UnboundedReceiver<NetworkEvent>) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let latency = Arc::new(Mutex::new(None));

        let worker = Worker {
            timing: LinkTiming::from(config),
            commands: command_rx,
            events: event_tx,
            state: state_tx,
            latency: latency.clone(),
            queue,
            sink: Box::new(sink),
            listener: None,
            listen_port: 0,
            pending: None,
            stream: None,
            accumulator: BytesMut::with_capacity(READ_BUFFER_CAPACITY),
            probe: LatencyProbe::with_clock(clock),
            probe_timer: None,
            drain_timer: None,
            batch: Vec::with_capacity(config.drain_batch.max(1)),
            replies: Vec::new(),
        };

        let task = tokio::spawn(worker.run());

        (
            Self {
                commands: command_tx,
                state: state_rx,
                latency,
                task: Mutex::new(Some(task)),
            },
            event_rx,
        )
    }

    /// Bind `port` and wait for a peer
    ///
    /// Any current link is torn down first. Returns the bound address, which
    /// carries the real port when `port` is 0.
    pub async fn listen(&self, port: u16) -> Result<SocketAddr, TransportError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Listen { port, reply })?;
        rx.await.map_err(|_| TransportError::NotRunning)?
    }

    /// Start dialing `host:port`; the outcome arrives as a status event
    pub fn connect(&self, host: &str, port: u16) -> Result<(), TransportError> {
        self.send(Command::Connect {
            host: host.to_string(),
            port,
        })
    }

    /// Drop the link and stop listening
    pub fn disconnect(&self) -> Result<(), TransportError> {
        self.send(Command::Disconnect)
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Most recent round-trip measurement on the current link
    pub fn latency(&self) -> Option<LatencySample> {
        self.latency.lock().clone()
    }

    /// Close everything and wait for the event loop to exit
    pub async fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::warn!("Connection task ended abnormally: {}", e);
            }
        }
    }

    fn send(&self, command: Command) -> Result<(), TransportError> {
        self.commands
            .send(command)
            .map_err(|_| TransportError::NotRunning)
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::Shutdown);
    }
}

struct Worker {
    timing: LinkTiming,
    commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedSender<NetworkEvent>,
    state: watch::Sender<ConnectionState>,
    latency: Arc<Mutex<Option<LatencySample>>>,
    queue: SharedSendQueue,
    sink: Box<dyn AudioSink>,
    listener: Option<TcpListener>,
    listen_port: u16,
    pending: Option<PendingConnect>,
    stream: Option<TcpStream>,
    accumulator: BytesMut,
    probe: LatencyProbe,
    probe_timer: Option<Interval>,
    drain_timer: Option<Interval>,
    batch: Vec<Vec<u8>>,
    replies: Vec<Vec<u8>>,
}

impl Worker {
    async fn run(mut self) {
        loop {
            tokio::select! {
                biased;

                command = self.commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.on_command(command),
                },

                result = finish_connect(&mut self.pending) => {
                    self.pending = None;
                    self.on_dialed(result);
                }

                accepted = accept(&self.listener) => self.on_accept(accepted),

                read = read_into(&mut self.stream, &mut self.accumulator) => self.on_read(read).await,

                _ = tick(&mut self.drain_timer) => self.drain().await,

                _ = tick(&mut self.probe_timer) => self.send_probe().await,
            }
        }

        self.close_all("Shut down");
        tracing::debug!("Connection task exited");
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Listen { port, reply } => {
                let result = self.start_listening(port);
                let _ = reply.send(result);
            }
            Command::Connect { host, port } => self.start_connect(host, port),
            Command::Disconnect => self.close_all("Disconnected locally"),
            Command::Shutdown => {}
        }
    }

    fn start_listening(&mut self, port: u16) -> Result<SocketAddr, TransportError> {
        self.close_all("Restarting listener");

        let bound = socket::bind_listener(port).and_then(|listener| {
            listener
                .local_addr()
                .map(|addr| (listener, addr))
                .map_err(|e| TransportError::BindFailed {
                    port,
                    reason: e.to_string(),
                })
        });

        match bound {
            Ok((listener, addr)) => {
                tracing::info!("Listening on {}", addr);
                self.listener = Some(listener);
                self.listen_port = addr.port();
                self.transition(ConnectionState::Listening, format!("Listening on port {}", addr.port()));
                Ok(addr)
            }
            Err(e) => {
                tracing::error!("{}", e);
                self.emit(NetworkEvent::Error(e.clone()));
                Err(e)
            }
        }
    }

    fn start_connect(&mut self, host: String, port: u16) {
        self.close_all("Reconnecting");

        let timeout = self.timing.connect_timeout;
        let reason = format!("Connecting to {}:{}", host, port);
        tracing::info!("{}", reason);

        self.pending = Some(Box::pin(async move {
            socket::connect(&host, port, timeout).await
        }));
        self.transition(ConnectionState::Connecting, reason);
    }

    fn on_dialed(&mut self, result: Result<TcpStream, TransportError>) {
        match result {
            Ok(stream) => {
                let reason = match stream.peer_addr() {
                    Ok(addr) => format!("Connected to {}", addr),
                    Err(_) => "Connected".to_string(),
                };
                self.enter_connected(stream, reason);
            }
            Err(e) => {
                tracing::warn!("{}", e);
                self.emit(NetworkEvent::Error(e.clone()));
                self.transition(ConnectionState::Disconnected, e.to_string());
            }
        }
    }

    fn on_accept(&mut self, accepted: io::Result<(TcpStream, SocketAddr)>) {
        match accepted {
            Ok((stream, addr)) if self.stream.is_some() => {
                tracing::warn!("Rejecting {}: already connected", addr);
                drop(stream);
            }
            Ok((stream, addr)) => self.enter_connected(stream, format!("Peer {} connected", addr)),
            Err(e) => tracing::warn!("Accept failed: {}", e),
        }
    }

    fn enter_connected(&mut self, stream: TcpStream, reason: String) {
        socket::configure_stream(&stream);
        tracing::info!("{}", reason);

        self.stream = Some(stream);
        self.accumulator.clear();
        self.probe.reset();
        self.queue.open();
        self.drain_timer = Some(periodic(self.timing.drain_interval));
        self.probe_timer = Some(periodic(self.timing.probe_interval));

        self.transition(ConnectionState::Connected, reason);
    }

    /// Tear down the current link, then return to listening if serving
    fn drop_peer(&mut self, reason: &str) {
        self.leave_connected();
        self.transition(ConnectionState::Disconnected, reason.to_string());

        if self.listener.is_some() {
            self.transition(
                ConnectionState::Listening,
                format!("Waiting for peer on port {}", self.listen_port),
            );
        }
    }

    /// Drop every socket, pending dial included
    fn close_all(&mut self, reason: &str) {
        self.pending = None;
        if self.listener.take().is_some() {
            tracing::debug!("Closed listener on port {}", self.listen_port);
        }
        self.leave_connected();
        self.transition(ConnectionState::Disconnected, reason.to_string());
    }

    fn leave_connected(&mut self) {
        if self.stream.take().is_none() {
            return;
        }

        self.probe_timer = None;
        self.drain_timer = None;
        let discarded = self.queue.close();
        if discarded > 0 {
            tracing::debug!("Discarded {} queued packets", discarded);
        }
        self.accumulator.clear();
        self.probe.reset();
        *self.latency.lock() = None;
    }

    async fn on_read(&mut self, read: io::Result<usize>) {
        match read {
            Ok(0) => {
                tracing::info!("Peer closed the connection");
                self.drop_peer("Peer closed the connection");
            }
            Ok(_) => self.dispatch_frames().await,
            Err(e) => {
                let e = TransportError::ReceiveFailed(e.to_string());
                tracing::warn!("{}", e);
                self.emit(NetworkEvent::Error(e.clone()));
                self.drop_peer(&e.to_string());
            }
        }
    }

    async fn dispatch_frames(&mut self) {
        let mut skipped = 0usize;

        loop {
            let consumed = match decode_frame(&self.accumulator) {
                Ok(frame) => {
                    match frame.packet_type {
                        PacketType::Audio => self.sink.deliver(frame.payload),
                        PacketType::ProbeRequest => match self.probe.echo(frame.payload) {
                            Ok(reply) => self.replies.push(reply),
                            Err(e) => tracing::warn!("Cannot echo probe: {}", e),
                        },
                        PacketType::ProbeReply => match self.probe.on_reply(frame.payload) {
                            Ok(Some(sample)) => {
                                tracing::debug!("Round trip {} ms", sample.round_trip_ms);
                                *self.latency.lock() = Some(sample.clone());
                                let _ = self.events.send(NetworkEvent::Latency(sample));
                            }
                            Ok(None) => {}
                            Err(e) => tracing::warn!("Discarding probe reply: {}", e),
                        },
                    }
                    frame.consumed
                }
                Err(DecodeError::NeedMoreData) => break,
                Err(DecodeError::Malformed(e)) => {
                    if skipped == 0 {
                        tracing::warn!("{}; resynchronizing", e);
                    }
                    skipped += 1;
                    1
                }
            };
            self.accumulator.advance(consumed);
        }

        if skipped > 0 {
            tracing::debug!("Skipped {} bytes to resynchronize", skipped);
        }

        let replies = std::mem::take(&mut self.replies);
        for reply in &replies {
            if !self.write(reply).await {
                break;
            }
        }
        self.replies = replies;
        self.replies.clear();
    }

    async fn drain(&mut self) {
        let mut batch = std::mem::take(&mut self.batch);
        self.queue.pop_batch(self.timing.drain_batch, &mut batch);

        let mut ok = true;
        for packet in batch.drain(..) {
            if ok {
                ok = self.write(&packet).await;
            }
            self.queue.recycle(packet);
        }
        self.batch = batch;
    }

    async fn send_probe(&mut self) {
        let request = self.probe.request();
        self.write(&request).await;
    }

    /// Write one framed packet; on failure the link is dropped
    async fn write(&mut self, bytes: &[u8]) -> bool {
        let Some(stream) = self.stream.as_mut() else {
            return false;
        };

        let error = match tokio::time::timeout(self.timing.write_timeout, stream.write_all(bytes)).await {
            Ok(Ok(())) => return true,
            Ok(Err(e)) => TransportError::SendFailed(e.to_string()),
            Err(_) => TransportError::SendFailed(format!(
                "write timed out after {:?}",
                self.timing.write_timeout
            )),
        };

        tracing::warn!("{}", error);
        self.emit(NetworkEvent::Error(error.clone()));
        self.drop_peer(&error.to_string());
        false
    }

    /// Record and announce a state change; repeats are ignored
    fn transition(&mut self, state: ConnectionState, reason: String) {
        let previous = self.state.send_replace(state);
        if previous == state {
            return;
        }

        tracing::debug!("Connection state {} -> {}", previous, state);
        self.emit(NetworkEvent::Status(ConnectionStatus {
            state,
            connected: state == ConnectionState::Connected,
            reason,
        }));
    }

    fn emit(&self, event: NetworkEvent) {
        let _ = self.events.send(event);
    }
}

fn periodic(period: Duration) -> Interval {
    let period = period.max(Duration::from_millis(1));
    let mut timer = interval_at(Instant::now() + period, period);
    timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
    timer
}

async fn tick(timer: &mut Option<Interval>) {
    match timer {
        Some(timer) => {
            timer.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn accept(listener: &Option<TcpListener>) -> io::Result<(TcpStream, SocketAddr)> {
    match listener {
        Some(listener) => listener.accept().await,
        None => std::future::pending().await,
    }
}

async fn read_into(stream: &mut Option<TcpStream>, buf: &mut BytesMut) -> io::Result<usize> {
    match stream {
        Some(stream) => {
            buf.reserve(READ_BUFFER_CAPACITY / 4);
            stream.read_buf(buf).await
        }
        None => std::future::pending().await,
    }
}

async fn finish_connect(pending: &mut Option<PendingConnect>) -> Result<TcpStream, TransportError> {
    match pending {
        Some(dial) => dial.as_mut().await,
        None => std::future::pending().await,
    }
}
