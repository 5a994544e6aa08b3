//! Lock-free byte ring buffer for PCM audio
//!
//! Single-producer single-consumer. The producer half lives in the
//! hardware callback and never blocks, allocates or fails loudly: an
//! enqueue that does not fit is rejected whole, counted, and reported on
//! a bounded diagnostic channel that the consumer drains.
//!
//! Cursors are monotonically increasing 64-bit byte totals, so they do
//! not wrap on 32-bit targets; physical positions are the totals modulo
//! capacity. Each side writes only its own cursor.

use crossbeam::utils::CachePadded;
use crossbeam_channel::{bounded, Receiver, Sender};
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::constants::EVENT_CHANNEL_CAPACITY;
use crate::error::BufferError;
use crate::format::AudioFormat;

/// A rejected enqueue, reported to the consumer side
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Overflow {
    /// Bytes the producer tried to write
    pub requested: usize,
    /// Free space at the time of the attempt
    pub free: usize,
}

struct Shared {
    storage: Box<[UnsafeCell<u8>]>,
    capacity: usize,
    /// Total bytes ever written (producer-owned)
    written: CachePadded<AtomicU64>,
    /// Total bytes ever read (consumer-owned)
    read: CachePadded<AtomicU64>,
    overflow_count: AtomicU64,
    dropped_bytes: AtomicU64,
}

// Producer and consumer touch disjoint byte ranges, fenced by the cursors.
unsafe impl Sync for Shared {}

impl Shared {
    #[inline]
    fn fill(&self) -> usize {
        let written = self.written.load(Ordering::Acquire);
        let read = self.read.load(Ordering::Acquire);
        (written - read) as usize
    }

    /// Physical storage index of a cursor total
    #[inline]
    fn position(&self, total: u64) -> usize {
        (total % self.capacity as u64) as usize
    }

    #[inline]
    fn base(&self) -> *mut u8 {
        UnsafeCell::raw_get(self.storage.as_ptr())
    }
}

/// Fixed-capacity byte ring buffer, split into producer and consumer halves
pub struct RingBuffer {
    shared: Arc<Shared>,
    overflow_tx: Sender<Overflow>,
    overflow_rx: Receiver<Overflow>,
}

impl RingBuffer {
    /// Create a ring buffer holding `capacity` bytes
    pub fn new(capacity: usize) -> Result<Self, BufferError> {
        if capacity == 0 {
            return Err(BufferError::ZeroCapacity);
        }

        let storage = (0..capacity).map(|_| UnsafeCell::new(0u8)).collect();
        let (overflow_tx, overflow_rx) = bounded(EVENT_CHANNEL_CAPACITY);

        Ok(Self {
            shared: Arc::new(Shared {
                storage,
                capacity,
                written: CachePadded::new(AtomicU64::new(0)),
                read: CachePadded::new(AtomicU64::new(0)),
                overflow_count: AtomicU64::new(0),
                dropped_bytes: AtomicU64::new(0),
            }),
            overflow_tx,
            overflow_rx,
        })
    }

    /// Create a ring buffer holding `duration` of audio in `format`
    pub fn with_duration(format: &AudioFormat, duration: Duration) -> Result<Self, BufferError> {
        Self::new(format.bytes_for_duration(duration))
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Split into the real-time producer and the draining consumer
    pub fn split(self) -> (RingProducer, RingConsumer) {
        let producer = RingProducer {
            shared: self.shared.clone(),
            overflow_tx: self.overflow_tx,
        };
        let consumer = RingConsumer {
            shared: self.shared,
            overflow_rx: self.overflow_rx,
        };
        (producer, consumer)
    }
}

/// Producer half, owned by the hardware callback
pub struct RingProducer {
    shared: Arc<Shared>,
    overflow_tx: Sender<Overflow>,
}

impl RingProducer {
    /// Copy `bytes` into the buffer
    ///
    /// Returns false, leaving buffered data untouched, if `bytes` does not
    /// fit in the free space. Never blocks and never allocates.
    #[inline]
    pub fn enqueue(&mut self, bytes: &[u8]) -> bool {
        let shared = &*self.shared;
        let len = bytes.len();
        if len == 0 {
            return true;
        }

        let written = shared.written.load(Ordering::Relaxed);
        let read = shared.read.load(Ordering::Acquire);
        let free = shared.capacity - (written - read) as usize;

        if len > free {
            shared.overflow_count.fetch_add(1, Ordering::Relaxed);
            shared.dropped_bytes.fetch_add(len as u64, Ordering::Relaxed);
            // Full diagnostic queue: the counters still carry the loss
            let _ = self.overflow_tx.try_send(Overflow { requested: len, free });
            return false;
        }

        let start = shared.position(written);
        let first = len.min(shared.capacity - start);
        // SAFETY: [start, start + len) modulo capacity is free space, which
        // the consumer never reads until `written` is published below.
        unsafe {
            let base = shared.base();
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), base.add(start), first);
            if first < len {
                std::ptr::copy_nonoverlapping(bytes.as_ptr().add(first), base, len - first);
            }
        }

        shared.written.store(written + len as u64, Ordering::Release);
        true
    }

    /// Current fill count in bytes
    pub fn len(&self) -> usize {
        self.shared.fill()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn free_space(&self) -> usize {
        self.shared.capacity - self.len()
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Number of rejected enqueues since creation
    pub fn overflow_count(&self) -> u64 {
        self.shared.overflow_count.load(Ordering::Relaxed)
    }
}

/// Consumer half, owned by the draining session
pub struct RingConsumer {
    shared: Arc<Shared>,
    overflow_rx: Receiver<Overflow>,
}

impl RingConsumer {
    /// Fill `dest` entirely from the front of the buffer
    ///
    /// Fails without consuming anything if fewer than `dest.len()` bytes
    /// are buffered.
    pub fn dequeue(&mut self, dest: &mut [u8]) -> Result<(), BufferError> {
        let shared = &*self.shared;
        let len = dest.len();
        if len == 0 {
            return Ok(());
        }

        let read = shared.read.load(Ordering::Relaxed);
        let written = shared.written.load(Ordering::Acquire);
        let available = (written - read) as usize;

        if len > available {
            return Err(BufferError::InsufficientData {
                requested: len,
                available,
            });
        }

        let start = shared.position(read);
        let first = len.min(shared.capacity - start);
        // SAFETY: [start, start + len) modulo capacity was published by the
        // producer and will not be overwritten until `read` advances.
        unsafe {
            let base = shared.base();
            std::ptr::copy_nonoverlapping(base.add(start), dest.as_mut_ptr(), first);
            if first < len {
                std::ptr::copy_nonoverlapping(base, dest.as_mut_ptr().add(first), len - first);
            }
        }

        shared.read.store(read + len as u64, Ordering::Release);
        Ok(())
    }

    /// Dequeue as many bytes as are available, up to `dest.len()`
    pub fn dequeue_available(&mut self, dest: &mut [u8]) -> usize {
        let n = dest.len().min(self.len());
        match self.dequeue(&mut dest[..n]) {
            Ok(()) => n,
            Err(_) => 0,
        }
    }

    /// Current fill count in bytes
    pub fn len(&self) -> usize {
        self.shared.fill()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Number of rejected enqueues since creation
    pub fn overflow_count(&self) -> u64 {
        self.shared.overflow_count.load(Ordering::Relaxed)
    }

    /// Bytes dropped by rejected enqueues since creation
    pub fn dropped_bytes(&self) -> u64 {
        self.shared.dropped_bytes.load(Ordering::Relaxed)
    }

    /// Take pending overflow diagnostics without blocking
    pub fn drain_overflows(&self) -> impl Iterator<Item = Overflow> + '_ {
        self.overflow_rx.try_iter()
    }

    /// Cloneable read-only view of the fill level
    pub fn level(&self) -> BufferLevel {
        BufferLevel {
            shared: self.shared.clone(),
        }
    }

    /// Get fill level as a fraction of capacity
    pub fn fill_level(&self) -> f32 {
        self.len() as f32 / self.capacity() as f32
    }
}

/// Fill-level probe that can be shared with a scheduler thread
#[derive(Clone)]
pub struct BufferLevel {
    shared: Arc<Shared>,
}

impl BufferLevel {
    pub fn len(&self) -> usize {
        self.shared.fill()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::VecDeque;
    use std::thread;

    #[test]
    fn test_ring_buffer_basic() {
        let (mut producer, mut consumer) = RingBuffer::new(8).unwrap().split();

        assert!(producer.enqueue(&[1, 2, 3]));
        assert_eq!(consumer.len(), 3);
        assert_eq!(producer.free_space(), 5);

        let mut out = [0u8; 3];
        consumer.dequeue(&mut out).unwrap();
        assert_eq!(out, [1, 2, 3]);
        assert!(consumer.is_empty());
    }

    #[test]
    fn test_wrap_around_preserves_order() {
        let (mut producer, mut consumer) = RingBuffer::new(5).unwrap().split();

        assert!(producer.enqueue(&[1, 2, 3, 4]));
        let mut out = [0u8; 3];
        consumer.dequeue(&mut out).unwrap();
        assert_eq!(out, [1, 2, 3]);

        // Write crosses the physical end of storage
        assert!(producer.enqueue(&[5, 6, 7, 8]));
        assert_eq!(consumer.len(), 5);

        let mut out = [0u8; 5];
        consumer.dequeue(&mut out).unwrap();
        assert_eq!(out, [4, 5, 6, 7, 8]);
    }

    #[test]
    fn test_overflow_is_rejected_whole() {
        let (mut producer, mut consumer) = RingBuffer::new(4).unwrap().split();

        assert!(producer.enqueue(&[9, 8, 7]));
        assert!(!producer.enqueue(&[1, 2]));
        assert_eq!(consumer.len(), 3);
        assert_eq!(consumer.overflow_count(), 1);
        assert_eq!(consumer.dropped_bytes(), 2);

        let events: Vec<_> = consumer.drain_overflows().collect();
        assert_eq!(events, vec![Overflow { requested: 2, free: 1 }]);

        let mut out = [0u8; 3];
        consumer.dequeue(&mut out).unwrap();
        assert_eq!(out, [9, 8, 7]);
    }

    #[test]
    fn test_dequeue_more_than_buffered_fails() {
        let (mut producer, mut consumer) = RingBuffer::new(4).unwrap().split();
        producer.enqueue(&[1, 2]);

        let mut out = [0u8; 3];
        assert_eq!(
            consumer.dequeue(&mut out),
            Err(BufferError::InsufficientData {
                requested: 3,
                available: 2
            })
        );
        // Nothing consumed
        assert_eq!(consumer.len(), 2);
        assert_eq!(consumer.dequeue_available(&mut out), 2);
        assert_eq!(&out[..2], &[1, 2]);
    }

    #[test]
    fn test_zero_capacity_rejected() {
        assert!(matches!(RingBuffer::new(0), Err(BufferError::ZeroCapacity)));
    }

    #[test]
    fn test_with_duration_capacity() {
        let format = AudioFormat::with_sample_rate(48000).unwrap();
        let ring = RingBuffer::with_duration(&format, Duration::from_millis(100)).unwrap();
        assert_eq!(ring.capacity(), 19_200);
    }

    #[test]
    fn test_spsc_threads_fifo() {
        const TOTAL: usize = 200_000;
        let (mut producer, mut consumer) = RingBuffer::new(1000).unwrap().split();

        let writer = thread::spawn(move || {
            let mut next = 0usize;
            while next < TOTAL {
                let chunk_len = (next % 97 + 1).min(TOTAL - next);
                let chunk: Vec<u8> = (next..next + chunk_len).map(|i| i as u8).collect();
                if chunk_len <= producer.free_space() {
                    assert!(producer.enqueue(&chunk));
                    next += chunk_len;
                } else {
                    thread::yield_now();
                }
            }
        });

        let mut received = Vec::with_capacity(TOTAL);
        let mut scratch = [0u8; 128];
        while received.len() < TOTAL {
            let n = consumer.dequeue_available(&mut scratch);
            if n == 0 {
                thread::yield_now();
            }
            received.extend_from_slice(&scratch[..n]);
        }
        writer.join().unwrap();

        assert!(received.iter().enumerate().all(|(i, &b)| b == i as u8));
        assert_eq!(consumer.overflow_count(), 0);
    }

    #[test]
    fn test_level_probe_tracks_fill() {
        let (mut producer, consumer) = RingBuffer::new(16).unwrap().split();
        let level = consumer.level();
        assert!(level.is_empty());
        producer.enqueue(&[0; 10]);
        assert_eq!(level.len(), 10);
    }

    #[test]
    fn test_cursor_totals_past_u32_range() {
        let ring = RingBuffer::new(1000).unwrap();
        // Start just below 2^32 so the stream crosses it
        let origin = u32::MAX as u64 - 300;
        ring.shared.written.store(origin, Ordering::Relaxed);
        ring.shared.read.store(origin, Ordering::Relaxed);
        let (mut producer, mut consumer) = ring.split();

        let mut next = 0u32;
        let mut expected = 0u32;
        for _ in 0..20 {
            let chunk: Vec<u8> = (next..next + 700).map(|i| i as u8).collect();
            assert!(producer.enqueue(&chunk));
            next += 700;
            // A full ring still rejects rather than overwriting
            assert!(!producer.enqueue(&[0; 301]));

            let mut out = vec![0u8; 700];
            consumer.dequeue(&mut out).unwrap();
            assert!(out.iter().all(|&b| {
                let ok = b == expected as u8;
                expected += 1;
                ok
            }));
        }
        assert!(consumer.is_empty());
        assert!(consumer.shared.read.load(Ordering::Relaxed) > u32::MAX as u64);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Enqueue(usize),
        Dequeue(usize),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0usize..96).prop_map(Op::Enqueue),
            (0usize..96).prop_map(Op::Dequeue),
        ]
    }

    proptest! {
        #[test]
        fn test_matches_fifo_model(
            capacity in 1usize..64,
            ops in proptest::collection::vec(op(), 1..200),
        ) {
            let (mut producer, mut consumer) = RingBuffer::new(capacity).unwrap().split();
            let mut model: VecDeque<u8> = VecDeque::new();
            let mut counter = 0u8;
            let mut rejected = 0u64;

            for op in ops {
                match op {
                    Op::Enqueue(n) => {
                        let chunk: Vec<u8> = (0..n)
                            .map(|_| {
                                counter = counter.wrapping_add(1);
                                counter
                            })
                            .collect();
                        let fits = model.len() + n <= capacity;
                        prop_assert_eq!(producer.enqueue(&chunk), fits);
                        if fits {
                            model.extend(chunk);
                        } else {
                            rejected += 1;
                        }
                    }
                    Op::Dequeue(n) => {
                        let mut out = vec![0u8; n];
                        if n <= model.len() {
                            consumer.dequeue(&mut out).unwrap();
                            let want: Vec<u8> = model.drain(..n).collect();
                            prop_assert_eq!(out, want);
                        } else {
                            prop_assert!(consumer.dequeue(&mut out).is_err());
                        }
                    }
                }
                prop_assert_eq!(consumer.len(), model.len());
            }

            prop_assert_eq!(consumer.overflow_count(), rejected);
            // Rejections never disturbed the unread bytes
            let mut rest = vec![0u8; model.len()];
            consumer.dequeue(&mut rest).unwrap();
            prop_assert_eq!(rest, model.into_iter().collect::<Vec<u8>>());
        }
    }
}
