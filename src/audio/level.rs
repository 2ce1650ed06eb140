//! Input level meter
//!
//! RMS of one period, converted to dB and mapped from [-60 dB, 0 dB] onto
//! [0, 100]. Published from the capture callback, so publishing never
//! blocks or allocates.

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU8, Ordering};

/// Bottom of the displayed dynamic range
pub const FLOOR_DB: f32 = -60.0;

/// Pending notifications kept per slow observer
const NOTIFY_CAPACITY: usize = 64;

/// Level in [0, 100] for a block of samples
pub fn level_from_samples(samples: &[f32]) -> u8 {
    if samples.is_empty() {
        return 0;
    }

    let sum: f32 = samples.iter().map(|s| s * s).sum();
    let rms = (sum / samples.len() as f32).sqrt();
    if !rms.is_finite() || rms <= 0.0 {
        return 0;
    }

    let db = 20.0 * rms.log10();
    let level = ((db - FLOOR_DB) * 100.0 / -FLOOR_DB) as i32;
    level.clamp(0, 100) as u8
}

/// Latest level plus a lossy notification stream per observer
///
/// Each `subscribe` gets its own bounded channel and sees every update it
/// keeps up with. Publishing never waits: if a subscription is being
/// registered at that moment the notification is skipped, though
/// [`current`](Self::current) is still updated.
pub struct LevelMonitor {
    current: AtomicU8,
    subscribers: Mutex<Vec<Sender<u8>>>,
}

impl LevelMonitor {
    pub fn new() -> Self {
        Self {
            current: AtomicU8::new(0),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Record a level; observers that are behind miss the notification
    pub fn publish(&self, level: u8) {
        self.current.store(level, Ordering::Relaxed);
        self.notify(level);
    }

    fn notify(&self, level: u8) {
        if let Some(mut subscribers) = self.subscribers.try_lock() {
            subscribers.retain(|tx| {
                !matches!(tx.try_send(level), Err(TrySendError::Disconnected(_)))
            });
        }
    }

    /// Meter the samples and publish the result
    pub fn measure(&self, samples: &[f32]) -> u8 {
        let level = level_from_samples(samples);
        self.publish(level);
        level
    }

    /// Drop the meter to zero while no audio is flowing
    pub fn reset_idle(&self) {
        if self.current.swap(0, Ordering::Relaxed) != 0 {
            self.notify(0);
        }
    }

    pub fn current(&self) -> u8 {
        self.current.load(Ordering::Relaxed)
    }

    /// New observer; dropped receivers are forgotten on the next publish
    pub fn subscribe(&self) -> Receiver<u8> {
        let (tx, rx) = bounded(NOTIFY_CAPACITY);
        self.subscribers.lock().push(tx);
        rx
    }
}

impl Default for LevelMonitor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(amplitude: f32, len: usize) -> Vec<f32> {
        (0..len)
            .map(|i| {
                let t = i as f32 / 48000.0;
                (t * 440.0 * 2.0 * std::f32::consts::PI).sin() * amplitude
            })
            .collect()
    }

    #[test]
    fn test_silence_is_zero() {
        assert_eq!(level_from_samples(&[0.0; 512]), 0);
        assert_eq!(level_from_samples(&[]), 0);
    }

    #[test]
    fn test_full_scale_sine_near_top() {
        // RMS of a full-scale sine is about -3 dB
        let level = level_from_samples(&sine(1.0, 4800));
        assert!((93..=100).contains(&level), "level {level}");
    }

    #[test]
    fn test_quiet_signal_is_low() {
        let level = level_from_samples(&sine(0.001, 4800));
        assert_eq!(level, 0);

        let level = level_from_samples(&sine(0.03, 4800));
        assert!(level > 0 && level < 50, "level {level}");
    }

    #[test]
    fn test_clamped_above_full_scale() {
        assert_eq!(level_from_samples(&[4.0; 64]), 100);
    }

    #[test]
    fn test_non_finite_is_zero() {
        assert_eq!(level_from_samples(&[f32::NAN; 8]), 0);
    }

    #[test]
    fn test_monitor_publish_and_reset() {
        let monitor = LevelMonitor::new();
        let rx = monitor.subscribe();

        monitor.measure(&[1.0; 32]);
        assert_eq!(monitor.current(), 100);
        assert_eq!(rx.try_recv(), Ok(100));

        monitor.reset_idle();
        assert_eq!(monitor.current(), 0);
        assert_eq!(rx.try_recv(), Ok(0));

        // Already idle: no repeat notification
        monitor.reset_idle();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_every_subscriber_sees_each_update() {
        let monitor = LevelMonitor::new();
        let first = monitor.subscribe();
        let second = monitor.subscribe();

        monitor.publish(40);
        monitor.publish(70);

        assert_eq!(first.try_iter().collect::<Vec<_>>(), vec![40, 70]);
        assert_eq!(second.try_iter().collect::<Vec<_>>(), vec![40, 70]);
    }

    #[test]
    fn test_dropped_subscriber_is_forgotten() {
        let monitor = LevelMonitor::new();
        let gone = monitor.subscribe();
        let kept = monitor.subscribe();
        drop(gone);

        monitor.publish(10);
        assert_eq!(monitor.subscribers.lock().len(), 1);
        assert_eq!(kept.try_recv(), Ok(10));
    }

    #[test]
    fn test_publish_skips_notify_while_registering() {
        let monitor = LevelMonitor::new();
        let rx = monitor.subscribe();

        let guard = monitor.subscribers.lock();
        monitor.publish(30);
        drop(guard);

        assert_eq!(monitor.current(), 30);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_monitor_never_blocks_when_full() {
        let monitor = LevelMonitor::new();
        let rx = monitor.subscribe();
        for _ in 0..NOTIFY_CAPACITY * 2 {
            monitor.publish(50);
        }
        assert_eq!(monitor.current(), 50);
        assert_eq!(rx.len(), NOTIFY_CAPACITY);
    }
}
