//! Lock-free single-producer single-consumer sample FIFO
//!
//! One ring buffer per output channel bridges the fill thread (producer)
//! and the device callback (consumer). Free-running 64-bit cursors with
//! acquire/release pairing make every operation wait-free; the hot paths
//! never lock or allocate.
//!
//! Short transfers are not errors: a write beyond the available space
//! silently drops the excess (producer-side overrun, counted by the
//! caller), and a read beyond the available data returns fewer samples
//! than requested (the consumer zero-pads the remainder).

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::types::Sample;

/// Bounded SPSC queue of audio samples
///
/// Exactly one thread may call the producer operations (`write`) and
/// exactly one thread the consumer operations (`read`, `read_adding`,
/// `skip`) at any given time. `reset` is only sound while both sides are
/// idle; the controller enforces that with its play/seek epoch guard.
pub struct RingBuffer {
    data: Box<[UnsafeCell<Sample>]>,
    capacity: usize,
    /// Total samples ever written (free-running)
    write_pos: AtomicU64,
    /// Total samples ever read or skipped (free-running)
    read_pos: AtomicU64,
}

// The UnsafeCell storage is only touched in the disjoint regions the two
// cursors delimit; the SPSC discipline above makes that exclusive.
unsafe impl Send for RingBuffer {}
unsafe impl Sync for RingBuffer {}

impl RingBuffer {
    /// Create a buffer holding up to `capacity` samples
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "RingBuffer capacity must be non-zero");
        let data = (0..capacity)
            .map(|_| UnsafeCell::new(0.0))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            data,
            capacity,
            write_pos: AtomicU64::new(0),
            read_pos: AtomicU64::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Samples available to the consumer
    pub fn read_space(&self) -> usize {
        let w = self.write_pos.load(Ordering::Acquire);
        let r = self.read_pos.load(Ordering::Acquire);
        (w - r) as usize
    }

    /// Samples the producer can still write
    pub fn write_space(&self) -> usize {
        self.capacity - self.read_space()
    }

    /// Producer: append samples, returning how many were accepted
    ///
    /// Excess beyond the free space is dropped.
    pub fn write(&self, src: &[Sample]) -> usize {
        let w = self.write_pos.load(Ordering::Relaxed);
        let r = self.read_pos.load(Ordering::Acquire);
        let space = self.capacity - (w - r) as usize;
        let n = src.len().min(space);
        for (i, &s) in src[..n].iter().enumerate() {
            let idx = ((w + i as u64) % self.capacity as u64) as usize;
            unsafe { *self.data[idx].get() = s };
        }
        self.write_pos.store(w + n as u64, Ordering::Release);
        n
    }

    /// Consumer: copy samples out, returning how many were available
    pub fn read(&self, dst: &mut [Sample]) -> usize {
        self.consume(dst.len(), |i, s| dst[i] = s)
    }

    /// Consumer: sum samples into `dst` instead of overwriting
    ///
    /// Used for the ad-hoc mono downmix when the stretcher has been folded
    /// to a single channel.
    pub fn read_adding(&self, dst: &mut [Sample]) -> usize {
        self.consume(dst.len(), |i, s| dst[i] += s)
    }

    /// Consumer: discard up to `n` samples, returning how many were dropped
    pub fn skip(&self, n: usize) -> usize {
        self.consume(n, |_, _| {})
    }

    /// Discard all buffered content
    ///
    /// Caller must guarantee both sides are idle; this simply catches the
    /// read cursor up to the write cursor.
    pub fn reset(&self) {
        let w = self.write_pos.load(Ordering::Acquire);
        self.read_pos.store(w, Ordering::Release);
    }

    fn consume(&self, want: usize, mut sink: impl FnMut(usize, Sample)) -> usize {
        let r = self.read_pos.load(Ordering::Relaxed);
        let w = self.write_pos.load(Ordering::Acquire);
        let avail = (w - r) as usize;
        let n = want.min(avail);
        for i in 0..n {
            let idx = ((r + i as u64) % self.capacity as u64) as usize;
            let s = unsafe { *self.data[idx].get() };
            sink(i, s);
        }
        self.read_pos.store(r + n as u64, Ordering::Release);
        n
    }
}
