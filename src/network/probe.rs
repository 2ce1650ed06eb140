//! Round-trip latency probe
//!
//! A probe request carries the sender's wall-clock time in milliseconds.
//! The peer echoes it untouched, and the round trip is `now - embedded`.
//! A local `Instant` is kept alongside as a secondary reading.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::ProtocolError;
use crate::protocol::{probe_timestamp, Packet};

/// Source of wall-clock milliseconds
pub trait Clock: Send + Sync {
    fn now_millis(&self) -> i64;
}

/// Unix time from the system clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        Utc::now().timestamp_millis()
    }
}

/// One round-trip measurement
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LatencySample {
    /// Timestamp embedded in the probe, which also identifies it
    pub probe_id: i64,
    pub round_trip_ms: i64,
    /// Local timer reading, when the reply matched the last probe sent
    pub timer_elapsed: Option<Duration>,
    pub measured_at: DateTime<Utc>,
}

impl LatencySample {
    pub fn round_trip(&self) -> Duration {
        Duration::from_millis(self.round_trip_ms.max(0) as u64)
    }
}

/// Probe state for one link
pub struct LatencyProbe {
    clock: Arc<dyn Clock>,
    outstanding: Option<(i64, Instant)>,
    latest: Option<LatencySample>,
    discarded: u64,
}

impl LatencyProbe {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            outstanding: None,
            latest: None,
            discarded: 0,
        }
    }

    /// Framed probe request stamped with the current time
    pub fn request(&mut self) -> Vec<u8> {
        let now = self.clock.now_millis();
        self.outstanding = Some((now, Instant::now()));
        // 8-byte payload always fits the length field
        Packet::probe_request(now).encode().unwrap_or_default()
    }

    /// Framed reply echoing a request payload verbatim
    pub fn echo(&self, payload: &[u8]) -> Result<Vec<u8>, ProtocolError> {
        Packet::probe_reply(payload).encode()
    }

    /// Handle a reply; returns a sample unless the round trip came out negative
    pub fn on_reply(&mut self, payload: &[u8]) -> Result<Option<LatencySample>, ProtocolError> {
        let sent = probe_timestamp(payload)?;
        let round_trip_ms = self.clock.now_millis().saturating_sub(sent);

        if round_trip_ms < 0 {
            self.discarded += 1;
            tracing::debug!("Discarding negative round trip of {} ms", round_trip_ms);
            return Ok(None);
        }

        let timer_elapsed = match self.outstanding {
            Some((id, started)) if id == sent => {
                self.outstanding = None;
                Some(started.elapsed())
            }
            _ => None,
        };

        let sample = LatencySample {
            probe_id: sent,
            round_trip_ms,
            timer_elapsed,
            measured_at: Utc::now(),
        };
        self.latest = Some(sample.clone());
        Ok(Some(sample))
    }

    /// Most recent sample, if any
    pub fn latest(&self) -> Option<&LatencySample> {
        self.latest.as_ref()
    }

    /// Replies thrown away for negative round trips
    pub fn discarded(&self) -> u64 {
        self.discarded
    }

    /// Forget per-link state
    pub fn reset(&mut self) {
        self.outstanding = None;
        self.latest = None;
    }
}

impl Default for LatencyProbe {
    fn default() -> Self {
        Self::new()
    }
}
