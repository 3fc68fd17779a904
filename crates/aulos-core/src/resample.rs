//! Sample rate conversion via rubato
//!
//! Bridges the negotiated source rate to the device's rate. Two variants
//! are kept behind one wrapper: a windowed-sinc converter for normal
//! playback, and a cheaper polynomial converter the fill engine substitutes
//! while the time-stretch ratio is extreme, bounding the combined CPU cost.
//!
//! Rubato works on planar buffers, so the engine feeds its per-channel
//! scratch straight through with no interleaving round trip.

use rubato::{
    FastFixedIn, PolynomialDegree, Resampler, SincFixedIn, SincInterpolationParameters,
    SincInterpolationType, WindowFunction,
};

use crate::error::{EngineError, EngineResult};
use crate::types::Sample;

enum Inner {
    Sinc(SincFixedIn<Sample>),
    Fast(FastFixedIn<Sample>),
}

/// Streaming sample rate converter with a fixed input chunk
pub struct SampleRateConverter {
    inner: Inner,
    ratio: f64,
    channels: usize,
    chunk: usize,
    fast: bool,
    /// Planar output scratch, sized to the converter's worst-case yield
    output: Vec<Vec<Sample>>,
}

impl SampleRateConverter {
    /// Create a converter from `from_rate` to `to_rate`
    ///
    /// `chunk` is the fixed number of input frames consumed per `process`
    /// call (the engine's natural mixing block).
    pub fn new(from_rate: u32, to_rate: u32, channels: usize, chunk: usize) -> EngineResult<Self> {
        let ratio = to_rate as f64 / from_rate as f64;
        let inner = Self::make_inner(ratio, channels, chunk, false)?;
        let mut conv = Self {
            inner,
            ratio,
            channels,
            chunk,
            fast: false,
            output: Vec::new(),
        };
        conv.size_output();
        Ok(conv)
    }

    fn make_inner(ratio: f64, channels: usize, chunk: usize, fast: bool) -> EngineResult<Inner> {
        if fast {
            let inner = FastFixedIn::<Sample>::new(ratio, 1.0, PolynomialDegree::Cubic, chunk, channels)
                .map_err(|e| EngineError::ConverterInit(e.to_string()))?;
            Ok(Inner::Fast(inner))
        } else {
            let params = SincInterpolationParameters {
                sinc_len: 256,
                f_cutoff: 0.95,
                interpolation: SincInterpolationType::Linear,
                oversampling_factor: 256,
                window: WindowFunction::BlackmanHarris2,
            };
            let inner = SincFixedIn::<Sample>::new(ratio, 1.0, params, chunk, channels)
                .map_err(|e| EngineError::ConverterInit(e.to_string()))?;
            Ok(Inner::Sinc(inner))
        }
    }

    fn size_output(&mut self) {
        let max = match &self.inner {
            Inner::Sinc(r) => r.output_frames_max(),
            Inner::Fast(r) => r.output_frames_max(),
        };
        self.output = vec![vec![0.0; max]; self.channels];
    }

    /// Conversion ratio (output rate / input rate)
    pub fn ratio(&self) -> f64 {
        self.ratio
    }

    /// Fixed input frames consumed per `process` call
    pub fn input_chunk(&self) -> usize {
        self.chunk
    }

    /// Worst-case output frames one `process` call can yield
    pub fn max_output(&self) -> usize {
        self.output.first().map(|c| c.len()).unwrap_or(0)
    }

    pub fn is_fast(&self) -> bool {
        self.fast
    }

    /// Switch between the sinc and polynomial variants
    ///
    /// Rebuilds the inner resampler, discarding its filter history; callers
    /// switch only at block boundaries where the discontinuity is masked.
    pub fn set_fast(&mut self, fast: bool) -> EngineResult<()> {
        if fast == self.fast {
            return Ok(());
        }
        self.inner = Self::make_inner(self.ratio, self.channels, self.chunk, fast)?;
        self.fast = fast;
        self.size_output();
        Ok(())
    }

    /// Convert exactly one input chunk
    ///
    /// `input` must hold `channels` slices of at least `input_chunk`
    /// frames. Returns the produced frame count and the planar output.
    pub fn process(&mut self, input: &[Vec<Sample>]) -> EngineResult<(usize, &[Vec<Sample>])> {
        let produced = match &mut self.inner {
            Inner::Sinc(r) => r.process_into_buffer(input, &mut self.output, None),
            Inner::Fast(r) => r.process_into_buffer(input, &mut self.output, None),
        }
        .map_err(|e| EngineError::ConverterInit(e.to_string()))?
        .1;
        Ok((produced, &self.output))
    }

    /// Discard all internal filter state
    pub fn reset(&mut self) -> EngineResult<()> {
        self.inner = Self::make_inner(self.ratio, self.channels, self.chunk, self.fast)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine_chunk(frames: usize, channels: usize, phase: &mut f64) -> Vec<Vec<Sample>> {
        let mut out = vec![Vec::with_capacity(frames); channels];
        for _ in 0..frames {
            let s = (*phase).sin() as Sample * 0.5;
            *phase += 2.0 * std::f64::consts::PI * 440.0 / 44100.0;
            for ch in out.iter_mut() {
                ch.push(s);
            }
        }
        out
    }

    #[test]
    fn test_frame_count_conservation() {
        let chunk = 1024;
        let chunks = 64;
        let mut conv = SampleRateConverter::new(44100, 48000, 2, chunk).unwrap();
        let mut phase = 0.0;

        let mut total_out = 0usize;
        for _ in 0..chunks {
            let input = sine_chunk(chunk, 2, &mut phase);
            let (produced, _) = conv.process(&input).unwrap();
            total_out += produced;
        }

        let expected = (chunk * chunks) as f64 * conv.ratio();
        // Per-call rounding plus up to one chunk of startup delay
        let tolerance = (chunks * 2) as f64 + chunk as f64 * conv.ratio();
        assert!(
            (total_out as f64 - expected).abs() < tolerance,
            "expected ~{} frames, got {}",
            expected,
            total_out
        );
    }

    #[test]
    fn test_downsampling_produces_fewer_frames() {
        let chunk = 1024;
        let mut conv = SampleRateConverter::new(48000, 44100, 1, chunk).unwrap();
        let mut phase = 0.0;
        let input = sine_chunk(chunk, 1, &mut phase);
        let (produced, out) = conv.process(&input).unwrap();
        assert!(produced < chunk);
        assert!(produced > 0);
        assert!(out[0].len() >= produced);
    }

    #[test]
    fn test_fast_variant_still_converts() {
        let chunk = 512;
        let chunks = 8;
        let mut conv = SampleRateConverter::new(44100, 48000, 2, chunk).unwrap();
        conv.set_fast(true).unwrap();
        assert!(conv.is_fast());

        let mut phase = 0.0;
        let mut total = 0usize;
        for _ in 0..chunks {
            let input = sine_chunk(chunk, 2, &mut phase);
            let (produced, _) = conv.process(&input).unwrap();
            total += produced;
        }
        let expected = (chunk * chunks) as f64 * conv.ratio();
        assert!(
            (total as f64 - expected).abs() < 1024.0,
            "expected ~{} frames, got {}",
            expected,
            total
        );
    }

    #[test]
    fn test_output_is_not_silent() {
        let chunk = 1024;
        let mut conv = SampleRateConverter::new(44100, 48000, 1, chunk).unwrap();
        let mut phase = 0.0;
        // Prime past the sinc filter's startup delay
        let mut peak: Sample = 0.0;
        for _ in 0..4 {
            let input = sine_chunk(chunk, 1, &mut phase);
            let (produced, out) = conv.process(&input).unwrap();
            peak = peak.max(out[0][..produced].iter().fold(0.0, |a: Sample, &s| a.max(s.abs())));
        }
        assert!(peak > 0.2, "converted sine should retain amplitude, peak={}", peak);
    }
}
