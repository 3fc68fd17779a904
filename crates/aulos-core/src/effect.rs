//! Auditioning effect interface
//!
//! An optional real-time processor applied in place to the final output
//! block before it reaches the device. Effects run on the device callback
//! thread, so `run` must not block or allocate. The engine skips an effect
//! whose port geometry doesn't match the current channel layout, and drops
//! it entirely (before any other degradation) under CPU overload.

use crate::types::Sample;

/// In-place real-time audio processor with fixed port geometry
pub trait AuditioningEffect: Send {
    /// Number of input ports the effect expects
    fn audio_input_count(&self) -> usize;

    /// Number of output ports the effect produces
    fn audio_output_count(&self) -> usize;

    /// Largest block, in frames, the effect can process in one call
    fn block_size(&self) -> usize;

    /// Process `frames` frames in place
    ///
    /// `frame_time` is the elapsed-playback frame at which this block
    /// begins; effects that schedule internally can use it as a clock.
    fn run(&mut self, frame_time: u64, buffers: &mut [&mut [Sample]], frames: usize);
}

/// Trivial gain effect, used by tests and the demo player
pub struct GainEffect {
    channels: usize,
    block: usize,
    gain: Sample,
}

impl GainEffect {
    pub fn new(channels: usize, block: usize, gain: Sample) -> Self {
        Self {
            channels,
            block,
            gain,
        }
    }
}

impl AuditioningEffect for GainEffect {
    fn audio_input_count(&self) -> usize {
        self.channels
    }

    fn audio_output_count(&self) -> usize {
        self.channels
    }

    fn block_size(&self) -> usize {
        self.block
    }

    fn run(&mut self, _frame_time: u64, buffers: &mut [&mut [Sample]], frames: usize) {
        for ch in buffers.iter_mut() {
            for s in ch[..frames].iter_mut() {
                *s *= self.gain;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gain_effect_scales_in_place() {
        let mut fx = GainEffect::new(2, 1024, 0.5);
        let mut l = vec![1.0; 8];
        let mut r = vec![-1.0; 8];
        fx.run(0, &mut [&mut l[..], &mut r[..]], 8);
        assert!(l.iter().all(|&s| (s - 0.5).abs() < 1e-6));
        assert!(r.iter().all(|&s| (s + 0.5).abs() < 1e-6));
    }
}
