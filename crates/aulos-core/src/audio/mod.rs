//! Audio device layer
//!
//! Device enumeration and the CPAL output backend that drives the engine's
//! [`crate::engine::DeviceFeed`] from the device callback.

mod cpal_backend;
mod device;
mod error;

pub use cpal_backend::{start_output, OutputHandle, OutputPrefs, DEFAULT_BLOCK_FRAMES};
pub use device::{find_output_device, get_output_devices, AudioDevice};
pub use error::{AudioError, AudioResult};
