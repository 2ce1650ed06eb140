//! Bounded send queue between the capture callback and the socket
//!
//! The capture thread frames each period straight into a recycled buffer
//! and pushes it; the event loop pops a small batch per drain tick, writes
//! it, and hands the buffers back. When the queue is full the oldest entry
//! is dropped so queued audio never lags more than `capacity` periods.

use crossbeam::queue::ArrayQueue;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crate::protocol::{encode_frame_into, PacketType};

/// What happened to an enqueued packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Queued,
    /// Queued, but the oldest entry was discarded to make room
    DroppedOldest,
    /// Not connected, or the payload could not be framed
    Rejected,
}

/// Lock-free FIFO of framed packets
pub struct SendQueue {
    pending: ArrayQueue<Vec<u8>>,
    /// Spent buffers waiting to be reused by the capture thread
    spare: ArrayQueue<Vec<u8>>,
    open: AtomicBool,
    enqueued: AtomicU64,
    dropped: AtomicU64,
    rejected: AtomicU64,
    discarded: AtomicU64,
}

impl SendQueue {
    /// Create a closed queue holding at most `capacity` packets
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            pending: ArrayQueue::new(capacity),
            spare: ArrayQueue::new(capacity * 2),
            open: AtomicBool::new(false),
            enqueued: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            discarded: AtomicU64::new(0),
        }
    }

    /// Frame `payload` and append it
    ///
    /// Bounded time and non-blocking; safe from the real-time thread.
    pub fn enqueue(&self, packet_type: PacketType, payload: &[u8]) -> EnqueueOutcome {
        if !self.open.load(Ordering::Acquire) {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            return EnqueueOutcome::Rejected;
        }

        let mut buf = self.spare.pop().unwrap_or_default();
        buf.clear();
        if encode_frame_into(packet_type, payload, &mut buf).is_err() {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            self.recycle(buf);
            return EnqueueOutcome::Rejected;
        }

        self.push(buf)
    }

    fn push(&self, buf: Vec<u8>) -> EnqueueOutcome {
        let displaced = self.pending.force_push(buf);

        // Lost a race with close(): its clear may have run before our push
        if !self.open.load(Ordering::SeqCst) {
            if let Some(oldest) = displaced {
                self.recycle(oldest);
            }
            self.clear();
            self.rejected.fetch_add(1, Ordering::Relaxed);
            return EnqueueOutcome::Rejected;
        }

        self.enqueued.fetch_add(1, Ordering::Relaxed);
        match displaced {
            None => EnqueueOutcome::Queued,
            Some(oldest) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                self.recycle(oldest);
                EnqueueOutcome::DroppedOldest
            }
        }
    }

    /// Move up to `max` packets, oldest first, into `out`
    pub fn pop_batch(&self, max: usize, out: &mut Vec<Vec<u8>>) -> usize {
        let mut taken = 0;
        while taken < max {
            match self.pending.pop() {
                Some(packet) => {
                    out.push(packet);
                    taken += 1;
                }
                None => break,
            }
        }
        taken
    }

    /// Return a written buffer for reuse
    pub fn recycle(&self, buf: Vec<u8>) {
        let _ = self.spare.push(buf);
    }

    /// Start accepting packets; anything left from a previous link is dropped
    pub fn open(&self) {
        self.clear();
        self.open.store(true, Ordering::SeqCst);
    }

    /// Stop accepting packets and discard everything queued
    ///
    /// Returns the number of discarded packets.
    pub fn close(&self) -> usize {
        self.open.store(false, Ordering::SeqCst);
        self.clear()
    }

    fn clear(&self) -> usize {
        let mut count = 0;
        while let Some(packet) = self.pending.pop() {
            self.recycle(packet);
            count += 1;
        }
        self.discarded.fetch_add(count as u64, Ordering::Relaxed);
        count
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.pending.capacity()
    }

    pub fn stats(&self) -> SendQueueStats {
        SendQueueStats {
            queued: self.len(),
            enqueued: self.enqueued.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
        }
    }
}

/// Queue counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendQueueStats {
    pub queued: usize,
    pub enqueued: u64,
    /// Overwritten by drop-oldest
    pub dropped: u64,
    /// Refused while closed
    pub rejected: u64,
    /// Thrown away on disconnect
    pub discarded: u64,
}

/// Thread-safe handle to a send queue
pub type SharedSendQueue = Arc<SendQueue>;

pub fn create_shared_queue(capacity: usize) -> SharedSendQueue {
    Arc::new(SendQueue::new(capacity))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::decode_frame;

    fn payload_of(packet: &[u8]) -> Vec<u8> {
        decode_frame(packet).unwrap().payload.to_vec()
    }

    #[test]
    fn test_closed_queue_rejects() {
        let queue = SendQueue::new(4);
        assert_eq!(queue.enqueue(PacketType::Audio, &[1]), EnqueueOutcome::Rejected);
        assert!(queue.is_empty());
        assert_eq!(queue.stats().rejected, 1);
    }

    #[test]
    fn test_fifo_batches() {
        let queue = SendQueue::new(8);
        queue.open();
        for i in 0..5u8 {
            assert_eq!(queue.enqueue(PacketType::Audio, &[i]), EnqueueOutcome::Queued);
        }

        let mut batch = Vec::new();
        assert_eq!(queue.pop_batch(3, &mut batch), 3);
        let payloads: Vec<_> = batch.iter().map(|p| payload_of(p)).collect();
        assert_eq!(payloads, vec![vec![0], vec![1], vec![2]]);

        batch.clear();
        assert_eq!(queue.pop_batch(3, &mut batch), 2);
        assert_eq!(payload_of(&batch[0]), vec![3]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_overflow_drops_oldest() {
        let queue = SendQueue::new(2);
        queue.open();
        queue.enqueue(PacketType::Audio, &[1]);
        queue.enqueue(PacketType::Audio, &[2]);
        assert_eq!(queue.enqueue(PacketType::Audio, &[3]), EnqueueOutcome::DroppedOldest);

        let mut batch = Vec::new();
        queue.pop_batch(10, &mut batch);
        let payloads: Vec<_> = batch.iter().map(|p| payload_of(p)).collect();
        assert_eq!(payloads, vec![vec![2], vec![3]]);
        assert_eq!(queue.stats().dropped, 1);
    }

    #[test]
    fn test_close_discards() {
        let queue = SendQueue::new(4);
        queue.open();
        queue.enqueue(PacketType::Audio, &[1]);
        queue.enqueue(PacketType::Audio, &[2]);

        assert_eq!(queue.close(), 2);
        assert!(queue.is_empty());
        assert!(!queue.is_open());
        assert_eq!(queue.stats().discarded, 2);
    }

    #[test]
    fn test_push_after_close_is_withdrawn() {
        let queue = SendQueue::new(4);
        queue.open();
        queue.close();

        // Producer passed the open check before close() ran
        let mut framed = Vec::new();
        encode_frame_into(PacketType::Audio, &[7], &mut framed).unwrap();
        assert_eq!(queue.push(framed), EnqueueOutcome::Rejected);

        assert!(queue.is_empty());
        assert_eq!(queue.stats().queued, 0);
        assert_eq!(queue.stats().enqueued, 0);
    }

    #[test]
    fn test_close_while_producing_leaves_queue_empty() {
        for _ in 0..50 {
            let queue = create_shared_queue(8);
            queue.open();

            let producer = {
                let queue = queue.clone();
                std::thread::spawn(move || {
                    for i in 0..200u32 {
                        queue.enqueue(PacketType::Audio, &i.to_le_bytes());
                    }
                })
            };

            std::thread::yield_now();
            queue.close();
            producer.join().unwrap();

            assert!(queue.is_empty());
            assert_eq!(queue.stats().queued, 0);
        }
    }

    #[test]
    fn test_buffers_are_recycled() {
        let queue = SendQueue::new(4);
        queue.open();
        queue.enqueue(PacketType::Audio, &[0u8; 1024]);

        let mut batch = Vec::new();
        queue.pop_batch(1, &mut batch);
        let ptr = batch[0].as_ptr();
        queue.recycle(batch.pop().unwrap());

        queue.enqueue(PacketType::Audio, &[1u8; 16]);
        queue.pop_batch(1, &mut batch);
        assert_eq!(batch[0].as_ptr(), ptr);
        assert_eq!(payload_of(&batch[0]), vec![1u8; 16]);
    }

    #[test]
    fn test_concurrent_producer() {
        let queue = create_shared_queue(16);
        queue.open();

        let producer = {
            let queue = queue.clone();
            std::thread::spawn(move || {
                for i in 0..1000u32 {
                    queue.enqueue(PacketType::Audio, &i.to_le_bytes());
                }
            })
        };

        let mut batch = Vec::new();
        let mut last: Option<u32> = None;
        while !producer.is_finished() || !queue.is_empty() {
            batch.clear();
            queue.pop_batch(4, &mut batch);
            for packet in batch.drain(..) {
                let bytes: [u8; 4] = payload_of(&packet).try_into().unwrap();
                let value = u32::from_le_bytes(bytes);
                if let Some(prev) = last {
                    assert!(value > prev, "FIFO order violated: {prev} then {value}");
                }
                last = Some(value);
                queue.recycle(packet);
            }
        }
        producer.join().unwrap();
        assert_eq!(last, Some(999));
    }
}
