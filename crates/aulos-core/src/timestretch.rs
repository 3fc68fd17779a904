//! Time-stretching via signalsmith-stretch
//!
//! Wraps the signalsmith-stretch library behind a push/pull surface: the
//! device callback pushes ring-buffer frames in with `process`, asks
//! `available`/`samples_required` how the pipeline stands, and drains
//! stretched output with `retrieve`. An internal planar FIFO bridges
//! signalsmith's length-ratio API to incremental retrieval.
//!
//! The stretch ratio is the playback speed factor: > 1.0 plays faster
//! (consumes more input per output frame), < 1.0 slower.

use std::collections::VecDeque;

use signalsmith_stretch::Stretch;

use crate::error::{EngineError, EngineResult};
use crate::types::{interleave, Sample};

/// Minimum input frames fed per process call, so tiny requests don't
/// thrash the stretcher
const MIN_FEED_FRAMES: usize = 64;

/// Incremental time stretcher
pub struct TimeStretchEngine {
    stretch: Stretch,
    channels: usize,
    ratio: f64,
    /// Interleaved staging for input to signalsmith
    in_scratch: Vec<Sample>,
    /// Interleaved staging for output from signalsmith
    out_scratch: Vec<Sample>,
    /// Per-channel output FIFO awaiting retrieval
    fifo: Vec<VecDeque<Sample>>,
}

impl TimeStretchEngine {
    /// Create a stretcher with the default (highest-quality) preset
    pub fn new(channels: usize, sample_rate: u32) -> EngineResult<Self> {
        if channels == 0 {
            return Err(EngineError::StretcherInit("zero channels".to_string()));
        }
        let stretch = Stretch::preset_default(channels as u32, sample_rate);
        Ok(Self::from_parts(stretch, channels))
    }

    /// Create a stretcher with the cheaper preset
    ///
    /// 30-50% faster with slightly lower quality; the engine switches to a
    /// single-channel instance of this under CPU overload.
    pub fn new_cheaper(channels: usize, sample_rate: u32) -> EngineResult<Self> {
        if channels == 0 {
            return Err(EngineError::StretcherInit("zero channels".to_string()));
        }
        let stretch = Stretch::preset_cheaper(channels as u32, sample_rate);
        Ok(Self::from_parts(stretch, channels))
    }

    fn from_parts(stretch: Stretch, channels: usize) -> Self {
        Self {
            stretch,
            channels,
            ratio: 1.0,
            in_scratch: Vec::new(),
            out_scratch: Vec::new(),
            fifo: vec![VecDeque::new(); channels],
        }
    }

    pub fn channel_count(&self) -> usize {
        self.channels
    }

    /// Set the playback speed factor
    pub fn set_time_ratio(&mut self, ratio: f64) {
        self.ratio = ratio.clamp(0.1, 10.0);
    }

    pub fn time_ratio(&self) -> f64 {
        self.ratio
    }

    /// Stretched frames buffered and ready to retrieve
    pub fn available(&self) -> usize {
        self.fifo.first().map(|f| f.len()).unwrap_or(0)
    }

    /// Input frames needed to make roughly `want_out` more output frames
    pub fn samples_required(&self, want_out: usize) -> usize {
        ((want_out as f64 * self.ratio).ceil() as usize).max(MIN_FEED_FRAMES)
    }

    /// Total engine latency in frames at the current ratio
    pub fn latency(&self) -> usize {
        self.stretch.input_latency() + self.stretch.output_latency()
    }

    /// Push `frames` frames of planar input through the stretcher
    ///
    /// Output lands in the internal FIFO. Scratch buffers grow
    /// geometrically on demand and are then reused.
    pub fn process(&mut self, input: &[&[Sample]], frames: usize, _last: bool) {
        if frames == 0 || input.len() < self.channels {
            return;
        }
        let out_frames = (frames as f64 / self.ratio).round() as usize;
        if out_frames == 0 {
            return;
        }

        let in_len = frames * self.channels;
        let out_len = out_frames * self.channels;
        if self.in_scratch.len() < in_len {
            self.in_scratch.resize(in_len.next_power_of_two(), 0.0);
        }
        if self.out_scratch.len() < out_len {
            self.out_scratch.resize(out_len.next_power_of_two(), 0.0);
        }

        interleave(&input[..self.channels], frames, &mut self.in_scratch);
        self.out_scratch[..out_len].fill(0.0);
        self.stretch
            .process(&self.in_scratch[..in_len], &mut self.out_scratch[..out_len]);

        for i in 0..out_frames {
            for ch in 0..self.channels {
                self.fifo[ch].push_back(self.out_scratch[i * self.channels + ch]);
            }
        }
    }

    /// Drain up to `frames` stretched frames into the planar output
    ///
    /// When the stretcher runs fewer channels than the output layout (mono
    /// overload fallback), channel 0 is duplicated across the remainder.
    /// Returns the number of frames written.
    pub fn retrieve(&mut self, output: &mut [&mut [Sample]], frames: usize) -> usize {
        let got = frames.min(self.available());
        for i in 0..got {
            for ch in 0..self.channels {
                // pop_front cannot fail inside `available()`
                let s = self.fifo[ch].pop_front().unwrap_or(0.0);
                if ch < output.len() {
                    output[ch][i] = s;
                }
            }
            for ch in self.channels..output.len() {
                let s = output[0][i];
                output[ch][i] = s;
            }
        }
        got
    }

    /// Discard all buffered and internal state; called on every seek
    pub fn reset(&mut self) {
        self.stretch.reset();
        for f in &mut self.fifo {
            f.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed_sine(ts: &mut TimeStretchEngine, frames: usize, phase: &mut f32) {
        let data: Vec<Sample> = (0..frames)
            .map(|_| {
                let s = phase.sin() * 0.5;
                *phase += 2.0 * std::f32::consts::PI * 220.0 / 44100.0;
                s
            })
            .collect();
        let copy = data.clone();
        ts.process(&[&data[..], &copy[..]], frames, false);
    }

    #[test]
    fn test_creation_reports_latency() {
        let ts = TimeStretchEngine::new(2, 44100).unwrap();
        assert!(ts.latency() > 0);
        assert_eq!(ts.available(), 0);
        assert_eq!(ts.time_ratio(), 1.0);
    }

    #[test]
    fn test_zero_channels_rejected() {
        assert!(TimeStretchEngine::new(0, 44100).is_err());
    }

    #[test]
    fn test_unity_ratio_frame_accounting() {
        let mut ts = TimeStretchEngine::new(2, 44100).unwrap();
        let mut phase = 0.0;
        feed_sine(&mut ts, 1024, &mut phase);
        assert_eq!(ts.available(), 1024);

        let mut l = vec![0.0; 512];
        let mut r = vec![0.0; 512];
        let got = ts.retrieve(&mut [&mut l[..], &mut r[..]], 512);
        assert_eq!(got, 512);
        assert_eq!(ts.available(), 512);
    }

    #[test]
    fn test_slow_ratio_yields_more_output() {
        let mut ts = TimeStretchEngine::new(2, 44100).unwrap();
        ts.set_time_ratio(0.5);
        let mut phase = 0.0;
        feed_sine(&mut ts, 1024, &mut phase);
        assert_eq!(ts.available(), 2048);
    }

    #[test]
    fn test_samples_required_scales_with_ratio() {
        let mut ts = TimeStretchEngine::new(2, 44100).unwrap();
        ts.set_time_ratio(2.0);
        assert_eq!(ts.samples_required(1024), 2048);
        ts.set_time_ratio(1.0);
        assert_eq!(ts.samples_required(16), MIN_FEED_FRAMES);
    }

    #[test]
    fn test_mono_fallback_duplicates_channels() {
        let mut ts = TimeStretchEngine::new_cheaper(1, 44100).unwrap();
        let data: Vec<Sample> = (0..256).map(|i| (i as Sample * 0.01).sin()).collect();
        ts.process(&[&data[..]], 256, false);

        let mut l = vec![0.0; 128];
        let mut r = vec![9.0; 128];
        let got = ts.retrieve(&mut [&mut l[..], &mut r[..]], 128);
        assert_eq!(got, 128);
        assert_eq!(l, r);
    }

    #[test]
    fn test_reset_clears_fifo() {
        let mut ts = TimeStretchEngine::new(2, 44100).unwrap();
        let mut phase = 0.0;
        feed_sine(&mut ts, 512, &mut phase);
        assert!(ts.available() > 0);
        ts.reset();
        assert_eq!(ts.available(), 0);
    }
}
