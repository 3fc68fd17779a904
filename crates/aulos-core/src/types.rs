//! Common types for the Aulos playback engine
//!
//! Frame positions are indices into the playback timeline at the engine's
//! negotiated source rate; block sizes and ring-buffer counts are expressed
//! at the device's (target) rate. Both use plain `usize` frames.

/// Audio sample type (32-bit float throughout the processing chain)
pub type Sample = f32;

/// Default sample rate assumed before any source or device has negotiated one
pub const DEFAULT_SAMPLE_RATE: u32 = 44100;

/// Maximum device block size to pre-allocate for real-time safety
/// Covers all common backend configurations (64 .. 4096 frames).
/// Pre-allocating to this size eliminates allocations in the device callback.
pub const MAX_BLOCK_FRAMES: usize = 8192;

/// Allocate a planar (one `Vec` per channel) zeroed buffer
pub fn zeroed_planar(channels: usize, frames: usize) -> Vec<Vec<Sample>> {
    vec![vec![0.0; frames]; channels]
}

/// Interleave planar channel slices into a single `[L, R, L, R, ..]` buffer
///
/// `output` must hold at least `frames * channels.len()` samples.
pub fn interleave(channels: &[&[Sample]], frames: usize, output: &mut [Sample]) {
    let n_ch = channels.len();
    for (ch, data) in channels.iter().enumerate() {
        for i in 0..frames {
            output[i * n_ch + ch] = data[i];
        }
    }
}

/// De-interleave `[L, R, L, R, ..]` samples into planar channel slices
pub fn deinterleave(input: &[Sample], channels: &mut [&mut [Sample]], frames: usize) {
    let n_ch = channels.len();
    for (ch, data) in channels.iter_mut().enumerate() {
        for i in 0..frames {
            data[i] = input[i * n_ch + ch];
        }
    }
}
