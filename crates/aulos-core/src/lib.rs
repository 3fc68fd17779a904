//! Aulos Core - Real-time audio playback engine for the Aulos analysis suite

pub mod audio;
pub mod config;
pub mod effect;
pub mod engine;
pub mod error;
pub mod model;
pub mod resample;
pub mod selection;
pub mod timestretch;
pub mod types;

pub use config::EngineTuning;
pub use effect::AuditioningEffect;
pub use engine::{DeviceFeed, EngineEvent, PlaybackController};
pub use error::{EngineError, EngineResult};
pub use model::{BufferModel, ModelId, PlayableModel};
pub use selection::{Selection, SelectionSet};
pub use types::*;
