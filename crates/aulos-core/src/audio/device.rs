//! Audio device enumeration and selection
//!
//! Thin wrappers around CPAL for listing output devices and resolving a
//! configured device name to a handle.

use cpal::traits::{DeviceTrait, HostTrait};

use super::error::{AudioError, AudioResult};

/// Information about an audio output device
#[derive(Debug, Clone)]
pub struct AudioDevice {
    /// Human-readable device name (also the configuration key)
    pub name: String,
    /// Whether this is the system default output
    pub is_default: bool,
    /// Maximum output channels across supported configs
    pub max_channels: u16,
}

/// List the available output devices on the default host
pub fn get_output_devices() -> AudioResult<Vec<AudioDevice>> {
    let host = cpal::default_host();
    let default_name = host
        .default_output_device()
        .and_then(|d| d.name().ok());

    let devices = host
        .output_devices()
        .map_err(|e| AudioError::ConfigError(e.to_string()))?;

    let mut out = Vec::new();
    for device in devices {
        let name = match device.name() {
            Ok(n) => n,
            Err(e) => {
                log::debug!("skipping unnameable device: {}", e);
                continue;
            }
        };
        let max_channels = device
            .supported_output_configs()
            .map(|configs| configs.map(|c| c.channels()).max().unwrap_or(0))
            .unwrap_or(0);
        out.push(AudioDevice {
            is_default: default_name.as_deref() == Some(name.as_str()),
            name,
            max_channels,
        });
    }

    if out.is_empty() {
        return Err(AudioError::NoDevices);
    }
    Ok(out)
}

/// Resolve a device by name, or the default output when `name` is None
pub fn find_output_device(name: Option<&str>) -> AudioResult<cpal::Device> {
    let host = cpal::default_host();
    match name {
        None => host
            .default_output_device()
            .ok_or_else(|| AudioError::NoDefaultDevice("no default output".to_string())),
        Some(wanted) => {
            let devices = host
                .output_devices()
                .map_err(|e| AudioError::ConfigError(e.to_string()))?;
            for device in devices {
                if device.name().map(|n| n == wanted).unwrap_or(false) {
                    return Ok(device);
                }
            }
            Err(AudioError::DeviceNotFound(wanted.to_string()))
        }
    }
}
