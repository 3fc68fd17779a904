//! Engine tuning parameters and configuration I/O
//!
//! All timing heuristics the engine relies on live in [`EngineTuning`] so
//! they can be adjusted without touching engine code. The struct is passed
//! to the controller at construction and can be replaced at run time via a
//! thread-safe setter; there is no ambient global configuration.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Tunable parameters for the playback engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineTuning {
    /// Ring buffer capacity per channel, in target-rate frames.
    /// Grown automatically if a device negotiates a block size larger
    /// than a quarter of this.
    pub ring_capacity_frames: usize,

    /// Natural mixing block: direct fills are rounded down to a multiple
    /// of this, and it is the converter's fixed input chunk.
    pub source_block_frames: usize,

    /// Nominal fade length applied at selection and loop-wrap boundaries.
    pub boundary_fade_frames: usize,

    /// Fade length used once a selection drops under
    /// `short_selection_frames`.
    pub short_fade_frames: usize,

    /// Selections shorter than this get `short_fade_frames` fades.
    pub short_selection_frames: usize,

    /// Selections shorter than this get no boundary fades at all.
    pub tiny_selection_frames: usize,

    /// Wall-clock window after play() during which an apparent rewind is
    /// treated as startup latency and clamped to the start frame. Past it,
    /// a rewind is assumed to be a loop wrap. Heuristic, not a contract.
    pub startup_clamp_ms: u64,

    /// Stretch ratios further than this from 1.0 (in either direction)
    /// switch the sample rate converter to its fast polynomial variant.
    pub extreme_stretch_ratio: f64,

    /// Consecutive over-budget device callbacks before a degradation step
    /// (first the auditioning effect is dropped, then the stretch goes mono).
    pub overload_trip_blocks: u32,

    /// Bounded capacity of the engine -> control thread event queue.
    pub event_queue_depth: usize,
}

impl Default for EngineTuning {
    fn default() -> Self {
        Self {
            ring_capacity_frames: 131072,
            source_block_frames: 1024,
            boundary_fade_frames: 50,
            short_fade_frames: 10,
            short_selection_frames: 300,
            tiny_selection_frames: 100,
            startup_clamp_ms: 500,
            extreme_stretch_ratio: 2.0,
            overload_trip_blocks: 5,
            event_queue_depth: 64,
        }
    }
}

/// Load configuration from a YAML file
///
/// If the file doesn't exist, or exists but fails to parse, returns the
/// default config (parse failures are logged).
pub fn load_config<T>(path: &Path) -> T
where
    T: DeserializeOwned + Default,
{
    if !path.exists() {
        log::info!("load_config: {:?} doesn't exist, using defaults", path);
        return T::default();
    }

    match std::fs::read_to_string(path) {
        Ok(contents) => match serde_yaml::from_str::<T>(&contents) {
            Ok(config) => config,
            Err(e) => {
                log::warn!("load_config: Failed to parse {:?}: {}, using defaults", path, e);
                T::default()
            }
        },
        Err(e) => {
            log::warn!("load_config: Failed to read {:?}: {}, using defaults", path, e);
            T::default()
        }
    }
}

/// Save configuration to a YAML file, creating parent directories as needed
pub fn save_config<T>(config: &T, path: &Path) -> Result<()>
where
    T: Serialize,
{
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
    }

    let yaml = serde_yaml::to_string(config).context("Failed to serialize config to YAML")?;
    std::fs::write(path, yaml).with_context(|| format!("Failed to write config file: {:?}", path))?;
    Ok(())
}

/// Default path for the engine tuning file
///
/// Returns: `<config dir>/aulos/engine.yaml`
pub fn default_tuning_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("aulos")
        .join("engine.yaml")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_nonexistent_returns_default() {
        let tuning: EngineTuning = load_config(Path::new("/nonexistent/path/engine.yaml"));
        assert_eq!(tuning, EngineTuning::default());
    }

    #[test]
    fn test_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.yaml");

        let tuning = EngineTuning {
            ring_capacity_frames: 65536,
            startup_clamp_ms: 250,
            ..EngineTuning::default()
        };

        save_config(&tuning, &path).unwrap();
        let loaded: EngineTuning = load_config(&path);

        assert_eq!(loaded, tuning);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.yaml");
        std::fs::write(&path, "source_block_frames: 512\n").unwrap();

        let loaded: EngineTuning = load_config(&path);
        assert_eq!(loaded.source_block_frames, 512);
        assert_eq!(loaded.boundary_fade_frames, EngineTuning::default().boundary_fade_frames);
    }

    #[test]
    fn test_default_path_ends_with_engine_yaml() {
        assert!(default_tuning_path().ends_with("aulos/engine.yaml"));
    }
}
