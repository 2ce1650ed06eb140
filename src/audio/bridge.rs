//! Latest-value handoff between the network receive path and playback
//!
//! One slot holds the most recently decoded frame. The receive side swaps it
//! wholesale; the playback callback reads from a cursor and pads with
//! silence once the frame is used up. A newer frame overwrites an older one
//! that was not fully played. There is no queueing here: the cell trades
//! jitter tolerance for latency.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

struct Slot {
    bytes: Vec<u8>,
    /// Bytes of `bytes` already handed to playback
    cursor: usize,
}

/// Single-slot frame cell shared by the receive path and playback
pub struct FrameBridge {
    slot: Mutex<Slot>,
    replaced: AtomicU64,
    overwritten: AtomicU64,
    underruns: AtomicU64,
    contended: AtomicU64,
}

impl FrameBridge {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(Slot {
                bytes: Vec::new(),
                cursor: 0,
            }),
            replaced: AtomicU64::new(0),
            overwritten: AtomicU64::new(0),
            underruns: AtomicU64::new(0),
            contended: AtomicU64::new(0),
        }
    }

    /// Install a new frame and return the storage it displaced
    ///
    /// The returned buffer is handed back so the caller can reuse its
    /// allocation; nothing is freed while the lock is held.
    pub fn replace(&self, frame: Vec<u8>) -> Vec<u8> {
        let previous = {
            let mut slot = self.slot.lock();
            if slot.cursor < slot.bytes.len() {
                self.overwritten.fetch_add(1, Ordering::Relaxed);
            }
            slot.cursor = 0;
            std::mem::replace(&mut slot.bytes, frame)
        };
        self.replaced.fetch_add(1, Ordering::Relaxed);
        previous
    }

    /// Copy the current frame into `out` without consuming it
    ///
    /// Longer frames are truncated, shorter ones padded with zeros. Returns
    /// the number of frame bytes copied.
    pub fn consume_into(&self, out: &mut [u8]) -> usize {
        let slot = self.slot.lock();
        let copied = slot.bytes.len().min(out.len());
        out[..copied].copy_from_slice(&slot.bytes[..copied]);
        out[copied..].fill(0);
        copied
    }

    /// Playback read: continue from the cursor, then silence
    ///
    /// Never blocks. If the receive side holds the lock the period is
    /// silence. Returns the number of frame bytes copied.
    pub fn drain_into(&self, out: &mut [u8]) -> usize {
        let Some(mut slot) = self.slot.try_lock() else {
            self.contended.fetch_add(1, Ordering::Relaxed);
            out.fill(0);
            return 0;
        };

        let start = slot.cursor;
        let copied = (slot.bytes.len() - start).min(out.len());
        out[..copied].copy_from_slice(&slot.bytes[start..start + copied]);
        slot.cursor += copied;
        drop(slot);

        if copied < out.len() {
            self.underruns.fetch_add(1, Ordering::Relaxed);
            out[copied..].fill(0);
        }
        copied
    }

    /// Forget the current frame
    pub fn clear(&self) {
        let old = {
            let mut slot = self.slot.lock();
            slot.cursor = 0;
            std::mem::take(&mut slot.bytes)
        };
        drop(old);
    }

    /// Size of the current frame, played or not
    pub fn frame_len(&self) -> usize {
        self.slot.lock().bytes.len()
    }

    /// Bytes not yet handed to playback
    pub fn pending(&self) -> usize {
        let slot = self.slot.lock();
        slot.bytes.len() - slot.cursor
    }

    pub fn stats(&self) -> BridgeStats {
        BridgeStats {
            replaced: self.replaced.load(Ordering::Relaxed),
            overwritten: self.overwritten.load(Ordering::Relaxed),
            underruns: self.underruns.load(Ordering::Relaxed),
            contended: self.contended.load(Ordering::Relaxed),
        }
    }
}

impl Default for FrameBridge {
    fn default() -> Self {
        Self::new()
    }
}

/// Bridge counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BridgeStats {
    /// Frames installed
    pub replaced: u64,
    /// Frames replaced before playback finished them
    pub overwritten: u64,
    /// Playback periods that needed silence padding
    pub underruns: u64,
    /// Playback periods skipped because the slot was locked
    pub contended: u64,
}

/// Thread-safe handle to a bridge
pub type SharedFrameBridge = Arc<FrameBridge>;

pub fn create_shared_bridge() -> SharedFrameBridge {
    Arc::new(FrameBridge::new())
}
