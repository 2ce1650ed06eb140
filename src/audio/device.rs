//! cpal implementation of the audio backend
//!
//! Each stream lives on its own thread. The thread builds the cpal stream,
//! reports the outcome, then serves play/pause/close commands until closed.
//! The stream object therefore never crosses threads.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{BufferSize, HostId, SampleRate, StreamConfig};
use crossbeam_channel::{bounded, Receiver, Sender};
use std::thread::{self, JoinHandle};

use crate::audio::backend::{AudioBackend, Direction, StreamCallback, StreamHandle, StreamParams};
use crate::error::AudioError;

/// Backend on the platform's default cpal host
#[derive(Debug, Default)]
pub struct CpalBackend {
    host_id: Option<HostId>,
}

impl CpalBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn host(&self) -> Result<cpal::Host, AudioError> {
        let id = self
            .host_id
            .ok_or_else(|| AudioError::BackendInit("backend not initialized".to_string()))?;
        cpal::host_from_id(id).map_err(|e| AudioError::BackendInit(e.to_string()))
    }
}

impl AudioBackend for CpalBackend {
    fn initialize(&mut self) -> Result<(), AudioError> {
        if self.host_id.is_some() {
            return Ok(());
        }

        let host = cpal::default_host();
        tracing::info!("Audio backend: {}", host.id().name());
        self.host_id = Some(host.id());
        Ok(())
    }

    fn is_initialized(&self) -> bool {
        self.host_id.is_some()
    }

    fn list_devices(&self, direction: Direction) -> Result<Vec<String>, AudioError> {
        let host = self.host()?;
        let devices = match direction {
            Direction::Input => host.input_devices(),
            Direction::Output => host.output_devices(),
        }
        .map_err(|e| AudioError::BackendInit(e.to_string()))?;

        Ok(devices.filter_map(|d| d.name().ok()).collect())
    }

    fn open(
        &mut self,
        device: Option<&str>,
        params: &StreamParams,
        callback: StreamCallback,
    ) -> Result<Box<dyn StreamHandle>, AudioError> {
        let host_id = self
            .host_id
            .ok_or_else(|| AudioError::BackendInit("backend not initialized".to_string()))?;
        let stream = CpalStream::spawn(host_id, device.map(str::to_string), *params, callback)?;
        Ok(Box::new(stream))
    }
}

/// Find a device by name, falling back to the host default
fn resolve_device(
    host: &cpal::Host,
    direction: Direction,
    name: Option<&str>,
) -> Result<cpal::Device, AudioError> {
    if let Some(name) = name {
        let devices = match direction {
            Direction::Input => host.input_devices(),
            Direction::Output => host.output_devices(),
        }
        .map_err(|e| AudioError::DeviceNotFound(e.to_string()))?;

        for device in devices {
            if device.name().map(|n| n == name).unwrap_or(false) {
                return Ok(device);
            }
        }

        tracing::warn!("{} device '{}' not found, using default", direction, name);
    }

    let default = match direction {
        Direction::Input => host.default_input_device(),
        Direction::Output => host.default_output_device(),
    };
    default.ok_or_else(|| AudioError::DeviceNotFound(format!("no default {} device", direction)))
}

fn build_stream(
    host_id: HostId,
    device: Option<&str>,
    params: &StreamParams,
    callback: StreamCallback,
) -> Result<cpal::Stream, AudioError> {
    let host = cpal::host_from_id(host_id).map_err(|e| AudioError::BackendInit(e.to_string()))?;
    let direction = callback.direction();
    let device = resolve_device(&host, direction, device)?;

    let config = StreamConfig {
        channels: params.channels,
        sample_rate: SampleRate(params.sample_rate),
        buffer_size: BufferSize::Fixed(params.period_frames),
    };

    tracing::info!(
        "Opening {} stream on '{}': {}Hz, {} channels, {} frames/period",
        direction,
        device.name().unwrap_or_else(|_| "Unknown".to_string()),
        params.sample_rate,
        params.channels,
        params.period_frames
    );

    let on_error = move |err: cpal::StreamError| {
        tracing::error!("{} stream error: {}", direction, err);
    };

    let stream = match callback {
        StreamCallback::Capture(mut cb) => device.build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| cb(data),
            on_error,
            None,
        ),
        StreamCallback::Playback(mut cb) => device.build_output_stream(
            &config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| cb(data),
            on_error,
            None,
        ),
    };

    stream.map_err(|e| AudioError::StreamOpen(e.to_string()))
}

enum StreamCommand {
    Play,
    Pause,
    Close,
}

/// Handle to a stream owned by its thread
pub struct CpalStream {
    direction: Direction,
    commands: Sender<StreamCommand>,
    replies: Receiver<Result<(), AudioError>>,
    thread_handle: Option<JoinHandle<()>>,
}

impl CpalStream {
    fn spawn(
        host_id: HostId,
        device: Option<String>,
        params: StreamParams,
        callback: StreamCallback,
    ) -> Result<Self, AudioError> {
        let direction = callback.direction();
        let (ready_tx, ready_rx) = bounded::<Result<(), AudioError>>(1);
        let (command_tx, command_rx) = bounded::<StreamCommand>(4);
        let (reply_tx, reply_rx) = bounded::<Result<(), AudioError>>(4);

        let handle = thread::Builder::new()
            .name(format!("{}-stream", direction))
            .spawn(move || {
                let stream = match build_stream(host_id, device.as_deref(), &params, callback) {
                    Ok(stream) => {
                        let _ = ready_tx.send(Ok(()));
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };

                while let Ok(command) = command_rx.recv() {
                    let reply = match command {
                        StreamCommand::Play => stream
                            .play()
                            .map_err(|e| AudioError::StreamStart(e.to_string())),
                        StreamCommand::Pause => stream
                            .pause()
                            .map_err(|e| AudioError::StreamStart(e.to_string())),
                        StreamCommand::Close => break,
                    };
                    let _ = reply_tx.send(reply);
                }

                // Stream is dropped here, releasing the device
            })
            .map_err(|e| AudioError::StreamOpen(e.to_string()))?;

        let ready = ready_rx
            .recv()
            .map_err(|_| AudioError::StreamOpen(format!("{} stream thread exited", direction)));

        match ready {
            Ok(Ok(())) => Ok(Self {
                direction,
                commands: command_tx,
                replies: reply_rx,
                thread_handle: Some(handle),
            }),
            Ok(Err(e)) | Err(e) => {
                let _ = handle.join();
                Err(e)
            }
        }
    }

    fn request(&self, command: StreamCommand) -> Result<(), AudioError> {
        let gone = || AudioError::StreamStart(format!("{} stream thread exited", self.direction));
        self.commands.send(command).map_err(|_| gone())?;
        self.replies.recv().map_err(|_| gone())?
    }

    fn shutdown(&mut self) {
        let _ = self.commands.send(StreamCommand::Close);
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
    }
}

impl StreamHandle for CpalStream {
    fn start(&mut self) -> Result<(), AudioError> {
        self.request(StreamCommand::Play)
    }

    fn stop(&mut self) -> Result<(), AudioError> {
        self.request(StreamCommand::Pause)
    }

    fn close(mut self: Box<Self>) {
        self.shutdown();
    }
}

impl Drop for CpalStream {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initialize_is_idempotent() {
        let mut backend = CpalBackend::new();
        assert!(!backend.is_initialized());

        backend.initialize().unwrap();
        let first = backend.host_id;
        backend.initialize().unwrap();
        assert_eq!(backend.host_id, first);
        assert!(backend.is_initialized());
    }

    #[test]
    fn test_open_requires_initialize() {
        let mut backend = CpalBackend::new();
        let params = StreamParams {
            sample_rate: 48000,
            channels: 2,
            period_frames: 256,
        };
        let result = backend.open(None, &params, StreamCallback::Capture(Box::new(|_| {})));
        assert!(matches!(result, Err(AudioError::BackendInit(_))));
    }

    #[test]
    fn test_list_devices() {
        // Device availability depends on the machine; only check it does not fail
        let mut backend = CpalBackend::new();
        backend.initialize().unwrap();
        let _ = backend.list_devices(Direction::Input);
    }
}
