//! Playback position estimation
//!
//! The device gives no "current sample" feedback, so the playing frame is
//! reconstructed from the fill counters, the device's reported latency,
//! the last retrieved block and wall-clock time, then folded through the
//! play-range list. The result is deliberately approximate; the clamps
//! below keep it from visibly jittering or rewinding.
//!
//! All inputs live in [`TransportClock`], a block of atomics shared by the
//! three threads (the same role DeckAtomics plays for a deck's UI state):
//! no estimator input ever requires a lock.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use super::range::PlayRangeList;

/// Lock-free transport state shared across the control, fill and device
/// callback threads
///
/// All operations use `Ordering::Relaxed` unless a counter pairs with ring
/// buffer hand-off; visibility, not synchronization, is what's needed.
pub struct TransportClock {
    /// Playback state machine: Stopped(false) / Playing(true)
    pub playing: AtomicBool,
    /// Engine shutdown flag; wakes and terminates the fill thread
    pub exiting: AtomicBool,
    /// Set by the control thread on any state change; consumed by fill
    pub state_changed: AtomicBool,
    /// The mixer returned fewer frames than requested: terminal boundary
    pub draining: AtomicBool,
    /// Loop mode mirror for the estimator
    pub looping: AtomicBool,
    /// Seqlock-style guard: odd while buffers are being reset
    pub epoch: AtomicU64,

    /// Timeline frames mixed since play() (source-rate domain, monotonic
    /// across loop wraps)
    pub write_fill: AtomicU64,
    /// write_fill value at the last unify (read set's fill level)
    pub read_fill: AtomicU64,
    /// Target-rate frames written into the ring buffers since play()
    pub written_tgt: AtomicU64,
    /// Target-rate frames the device callback has consumed since play()
    pub consumed_tgt: AtomicU64,

    /// Frame playback started from
    pub start_frame: AtomicU64,
    /// Wall-clock micros (engine epoch) at play()
    pub started_at_us: AtomicU64,
    /// One-shot guard: the estimate has reached the start frame
    pub start_frame_passed: AtomicBool,
    /// Size of the last block the device retrieved (device frames)
    pub last_block_frames: AtomicU64,
    /// Wall-clock micros of the last retrieval
    pub last_retrieved_us: AtomicU64,
    /// Retrieval timestamps are usable for extrapolation
    pub timestamps_trusted: AtomicBool,
    /// Monotonicity high-water mark for non-looping estimates
    pub high_water: AtomicU64,
    /// Frozen estimate reported while stopped
    pub frozen_frame: AtomicU64,

    /// Negotiated rates (source = timeline, target = device)
    pub source_rate: AtomicU32,
    pub target_rate: AtomicU32,
    /// Device geometry from set_target()
    pub device_block_frames: AtomicU64,
    pub device_latency_frames: AtomicU64,

    /// Stretch ratio (f64 bits; 1.0 = no stretching)
    pub stretch_ratio_bits: AtomicU64,
    /// Stretch engine latency in target frames
    pub stretch_latency_frames: AtomicU64,
    /// Callback requests a mono stretcher after overload
    pub mono_stretch_requested: AtomicBool,
    /// Mono fallback currently active
    pub mono_stretch: AtomicBool,
    /// Auditioning effect enabled (cleared first under overload)
    pub effect_enabled: AtomicBool,

    /// Degradation counters, drained into events by the fill thread
    pub underruns: AtomicU64,
    pub overruns: AtomicU64,
}

impl TransportClock {
    pub fn new() -> Self {
        Self {
            playing: AtomicBool::new(false),
            exiting: AtomicBool::new(false),
            state_changed: AtomicBool::new(false),
            draining: AtomicBool::new(false),
            looping: AtomicBool::new(false),
            epoch: AtomicU64::new(0),
            write_fill: AtomicU64::new(0),
            read_fill: AtomicU64::new(0),
            written_tgt: AtomicU64::new(0),
            consumed_tgt: AtomicU64::new(0),
            start_frame: AtomicU64::new(0),
            started_at_us: AtomicU64::new(0),
            start_frame_passed: AtomicBool::new(false),
            last_block_frames: AtomicU64::new(0),
            last_retrieved_us: AtomicU64::new(0),
            timestamps_trusted: AtomicBool::new(false),
            high_water: AtomicU64::new(0),
            frozen_frame: AtomicU64::new(0),
            source_rate: AtomicU32::new(0),
            target_rate: AtomicU32::new(0),
            device_block_frames: AtomicU64::new(0),
            device_latency_frames: AtomicU64::new(0),
            stretch_ratio_bits: AtomicU64::new(1.0f64.to_bits()),
            stretch_latency_frames: AtomicU64::new(0),
            mono_stretch_requested: AtomicBool::new(false),
            mono_stretch: AtomicBool::new(false),
            effect_enabled: AtomicBool::new(true),
            underruns: AtomicU64::new(0),
            overruns: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn stretch_ratio(&self) -> f64 {
        f64::from_bits(self.stretch_ratio_bits.load(Ordering::Relaxed))
    }

    #[inline]
    pub fn set_stretch_ratio(&self, ratio: f64) {
        self.stretch_ratio_bits.store(ratio.to_bits(), Ordering::Relaxed);
    }

    /// Zero the per-play counters; called under the epoch guard
    pub fn reset_counters(&self, start_frame: usize, now_us: u64) {
        self.write_fill.store(0, Ordering::Relaxed);
        self.read_fill.store(0, Ordering::Relaxed);
        self.written_tgt.store(0, Ordering::Relaxed);
        self.consumed_tgt.store(0, Ordering::Relaxed);
        self.draining.store(false, Ordering::Relaxed);
        self.start_frame.store(start_frame as u64, Ordering::Relaxed);
        self.started_at_us.store(now_us, Ordering::Relaxed);
        self.start_frame_passed.store(false, Ordering::Relaxed);
        self.last_block_frames.store(0, Ordering::Relaxed);
        self.last_retrieved_us.store(now_us, Ordering::Relaxed);
        self.timestamps_trusted.store(false, Ordering::Relaxed);
        self.high_water.store(0, Ordering::Relaxed);
    }
}

impl Default for TransportClock {
    fn default() -> Self {
        Self::new()
    }
}

/// Estimator tunables (subset of EngineTuning, copied so the estimator
/// never touches the engine lock)
#[derive(Debug, Clone, Copy)]
pub struct EstimatorParams {
    pub startup_clamp_ms: u64,
}

/// Estimate the frame currently audible at the device
///
/// `unread_frames` is the minimum read space across the read buffer set
/// (target frames); `now_us` is the caller's engine-epoch timestamp.
pub fn estimate_frame(
    clock: &TransportClock,
    ranges: &PlayRangeList,
    unread_frames: u64,
    params: &EstimatorParams,
    now_us: u64,
) -> usize {
    if !clock.playing.load(Ordering::Relaxed) {
        return clock.frozen_frame.load(Ordering::Relaxed) as usize;
    }

    let source_rate = clock.source_rate.load(Ordering::Relaxed).max(1) as f64;
    let target_rate = clock.target_rate.load(Ordering::Relaxed).max(1) as f64;
    // Target-rate frames map onto the source timeline via k, and
    // device-side frames additionally via the stretch ratio r.
    let k = source_rate / target_rate;
    let r = clock.stretch_ratio().max(0.05);
    let looping = clock.looping.load(Ordering::Relaxed);

    let produced = clock.write_fill.load(Ordering::Relaxed) as f64;
    let unread = unread_frames as f64 * k;
    let last_block = clock.last_block_frames.load(Ordering::Relaxed) as f64 * k * r;
    let device_latency = clock.device_latency_frames.load(Ordering::Relaxed) as f64 * k * r;
    let stretch_latency = clock.stretch_latency_frames.load(Ordering::Relaxed) as f64 * k * r;

    let mut elapsed = produced - unread - last_block - device_latency - stretch_latency;

    // Wall-clock extrapolation folds backwards nonsensically across a loop
    // wrap, so it only applies when not looping.
    if clock.timestamps_trusted.load(Ordering::Relaxed) && !looping {
        let last_us = clock.last_retrieved_us.load(Ordering::Relaxed);
        if now_us > last_us {
            elapsed += (now_us - last_us) as f64 * 1e-6 * source_rate * r;
        }
    }

    let start_frame = clock.start_frame.load(Ordering::Relaxed) as usize;
    let mut frame = ranges.fold(start_frame, elapsed.round() as i64, looping);

    // Before the start frame has been passed, an estimate behind it is
    // startup latency, not a loop wrap - unless enough wall time has gone
    // by that it can't be. Threshold is a tunable, not a contract.
    if !clock.start_frame_passed.load(Ordering::Relaxed) {
        if frame >= start_frame {
            clock.start_frame_passed.store(true, Ordering::Relaxed);
        } else {
            let started = clock.started_at_us.load(Ordering::Relaxed);
            let since_start_ms = now_us.saturating_sub(started) / 1000;
            if since_start_ms < params.startup_clamp_ms {
                frame = start_frame;
            } else {
                clock.start_frame_passed.store(true, Ordering::Relaxed);
            }
        }
    }

    // While not looping the estimate never visibly rewinds.
    if !looping {
        let prev = clock.high_water.fetch_max(frame as u64, Ordering::Relaxed);
        frame = frame.max(prev as usize);
    }

    frame
}
