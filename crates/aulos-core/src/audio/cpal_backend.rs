//! CPAL output backend
//!
//! Builds an f32 output stream whose callback pulls planar frames from the
//! engine's [`DeviceFeed`] and interleaves them for the device. The engine
//! never blocks the callback; any shortfall has already been zero-filled
//! by the feed.
//!
//! ```text
//! Control thread ──► PlaybackController ──► fill thread ──► ring buffers
//!                                                              │
//! CPAL callback ◄── interleave ◄── DeviceFeed::get_source_samples
//! ```

use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::{BufferSize as CpalBufferSize, SampleFormat, Stream, StreamConfig};

use crate::engine::{DeviceFeed, PlaybackController};
use crate::types::{Sample, MAX_BLOCK_FRAMES};

use super::device::find_output_device;
use super::error::{AudioError, AudioResult};

/// Default device block size when the caller expresses no preference
pub const DEFAULT_BLOCK_FRAMES: u32 = 1024;

/// Output stream preferences
#[derive(Debug, Clone, Default)]
pub struct OutputPrefs {
    /// Device name, or None for the system default
    pub device: Option<String>,
    /// Preferred sample rate, or None for the device's choice
    pub sample_rate: Option<u32>,
    /// Preferred block size in frames
    pub block_frames: Option<u32>,
}

/// Handle keeping the output stream alive; drop it to stop audio
pub struct OutputHandle {
    _stream: Stream,
    sample_rate: u32,
    block_frames: u32,
}

impl OutputHandle {
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn block_frames(&self) -> u32 {
        self.block_frames
    }

    /// One-way output latency in milliseconds
    pub fn latency_ms(&self) -> f32 {
        (self.block_frames as f32 / self.sample_rate as f32) * 1000.0
    }
}

/// Start the output stream, wiring the device callback to the engine
///
/// Negotiates an f32 stereo-or-wider config, records the result with
/// `controller.set_target`, and moves `feed` into the stream callback.
pub fn start_output(
    controller: &PlaybackController,
    mut feed: DeviceFeed,
    prefs: &OutputPrefs,
) -> AudioResult<OutputHandle> {
    let device = find_output_device(prefs.device.as_deref())?;
    let device_name = device.name().unwrap_or_else(|_| "Unknown".to_string());
    log::info!("Using audio device: {}", device_name);

    let (supported, block_frames) = get_output_config(&device, prefs)?;
    let sample_rate = supported.sample_rate().0;
    let channels = supported.channels().max(2);

    let stream_config = StreamConfig {
        channels,
        sample_rate: supported.sample_rate(),
        buffer_size: CpalBufferSize::Fixed(block_frames),
    };

    log::info!(
        "Audio config: {} channels, {}Hz, {} frames (~{:.1}ms latency)",
        channels,
        sample_rate,
        block_frames,
        (block_frames as f32 / sample_rate as f32) * 1000.0
    );

    // The engine mixes for this geometry; the reported latency is the
    // block the device holds at any moment
    controller.set_target(sample_rate, block_frames as usize, block_frames as usize);
    let engine_channels = controller.channel_count();

    let n_ch = channels as usize;
    let feed_channels = engine_channels.min(n_ch);
    let mut planar: Vec<Vec<Sample>> = vec![vec![0.0; MAX_BLOCK_FRAMES]; feed_channels.max(1)];

    let stream = device
        .build_output_stream(
            &stream_config,
            move |data: &mut [f32], _info: &cpal::OutputCallbackInfo| {
                let frames = (data.len() / n_ch).min(MAX_BLOCK_FRAMES);

                let got = {
                    let mut refs: Vec<&mut [Sample]> = planar
                        .iter_mut()
                        .map(|c| &mut c[..frames])
                        .collect();
                    feed.get_source_samples(frames, &mut refs)
                };

                for (i, frame) in data.chunks_mut(n_ch).enumerate() {
                    if i < got {
                        for (ch, slot) in frame.iter_mut().enumerate() {
                            *slot = if ch < planar.len() { planar[ch][i] } else { 0.0 };
                        }
                    } else {
                        for slot in frame.iter_mut() {
                            *slot = 0.0;
                        }
                    }
                }
            },
            move |err| {
                log::error!("Audio stream error: {}", err);
            },
            None, // No timeout (blocking)
        )
        .map_err(|e| AudioError::StreamBuildError(e.to_string()))?;

    stream
        .play()
        .map_err(|e| AudioError::StreamPlayError(e.to_string()))?;
    log::info!("Audio stream started");

    Ok(OutputHandle {
        _stream: stream,
        sample_rate,
        block_frames,
    })
}

/// Pick the best output configuration for a device
///
/// Returns (SupportedStreamConfig, block size in frames). Prefers f32,
/// at least stereo, and the requested sample rate when in range.
fn get_output_config(
    device: &cpal::Device,
    prefs: &OutputPrefs,
) -> AudioResult<(cpal::SupportedStreamConfig, u32)> {
    let supported_configs: Vec<_> = device
        .supported_output_configs()
        .map_err(|e| AudioError::ConfigError(e.to_string()))?
        .collect();

    if supported_configs.is_empty() {
        return Err(AudioError::ConfigError(
            "No supported output configurations".to_string(),
        ));
    }

    let best = supported_configs
        .iter()
        .filter(|c| c.sample_format() == SampleFormat::F32)
        .filter(|c| c.channels() >= 2)
        .find(|c| match prefs.sample_rate {
            Some(rate) => rate >= c.min_sample_rate().0 && rate <= c.max_sample_rate().0,
            None => true,
        })
        .or_else(|| supported_configs.iter().find(|c| c.channels() >= 2))
        .or_else(|| supported_configs.first())
        .ok_or_else(|| {
            AudioError::ConfigError("No suitable output configuration found".to_string())
        })?;

    if best.sample_format() != SampleFormat::F32 {
        return Err(AudioError::UnsupportedFormat(format!(
            "{:?}",
            best.sample_format()
        )));
    }

    let sample_rate = match prefs.sample_rate {
        Some(rate) if rate >= best.min_sample_rate().0 && rate <= best.max_sample_rate().0 => {
            cpal::SampleRate(rate)
        }
        Some(rate) => {
            let fallback = best.max_sample_rate();
            log::warn!(
                "Audio device doesn't support {}Hz, falling back to {}Hz",
                rate,
                fallback.0
            );
            fallback
        }
        None => best.max_sample_rate(),
    };

    let config = best.clone().with_sample_rate(sample_rate);
    let block_frames = prefs
        .block_frames
        .unwrap_or(DEFAULT_BLOCK_FRAMES)
        .clamp(64, MAX_BLOCK_FRAMES as u32);

    Ok((config, block_frames))
}
