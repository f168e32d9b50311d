//! Audio input device records and cpal enumeration

use cpal::traits::{DeviceTrait, HostTrait};
use cpal::DeviceId;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Kind of media device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    #[default]
    AudioInput,
    AudioOutput,
}

/// A cached enumeration result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRecord {
    /// Stable identifier (persists across restarts)
    pub device_id: String,
    /// Human-readable label; may be empty before permission is granted
    pub label: String,
    /// Device kind
    pub kind: DeviceKind,
}

impl DeviceRecord {
    /// Build an audio input record
    pub fn input(device_id: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            label: label.into(),
            kind: DeviceKind::AudioInput,
        }
    }

    /// Whether the label identifies a concrete piece of hardware
    pub fn has_specific_label(&self) -> bool {
        !is_generic_label(&self.label)
    }
}

/// Labels that name a routing alias rather than real hardware
const GENERIC_LABEL_MARKERS: &[&str] = &[
    "default",
    "communications",
    "pulse",
    "pipewire",
    "sysdefault",
];

/// Whether a device label is empty or names a platform alias
pub fn is_generic_label(label: &str) -> bool {
    let lower = label.trim().to_lowercase();
    if lower.is_empty() || lower == "unknown" {
        return true;
    }
    GENERIC_LABEL_MARKERS.iter().any(|marker| {
        lower == *marker
            || lower
                .strip_prefix(marker)
                .is_some_and(|rest| rest.starts_with(' '))
    })
}

/// Get the display name for a device
///
/// Uses `description()` as the primary method (cpal 0.17+), with `name()` as fallback.
/// An empty string means the platform did not expose a label.
pub fn get_device_display_name(device: &cpal::Device) -> String {
    device
        .description()
        .map(|desc| desc.name().to_string())
        .unwrap_or_else(|_| {
            #[allow(deprecated)]
            device.name().unwrap_or_default()
        })
}

/// List all available audio input devices on the default host
pub fn list_input_devices() -> Vec<DeviceRecord> {
    let host = cpal::default_host();
    tracing::debug!("CPAL host: {}", host.id().name());

    let devices: Vec<DeviceRecord> = host
        .input_devices()
        .map(|device_iter| {
            device_iter
                .filter_map(|device| {
                    let device_id = device.id().ok()?.to_string();
                    let label = get_device_display_name(&device);
                    tracing::debug!("Found input device: '{}' (id: {})", label, device_id);
                    Some(DeviceRecord::input(device_id, label))
                })
                .collect()
        })
        .unwrap_or_default();

    tracing::info!("Found {} input devices", devices.len());
    devices
}

/// Find an input device by its stable ID
pub fn find_input_device_by_id(id_str: &str) -> Option<cpal::Device> {
    let host = cpal::default_host();
    let device_id = DeviceId::from_str(id_str).ok()?;
    host.device_by_id(&device_id)
}
