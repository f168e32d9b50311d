//! Microphone permission and input device management

mod manager;

pub use manager::PermissionAndDeviceManager;

use serde::{Deserialize, Serialize};

/// Normalised microphone permission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PermissionState {
    Granted,
    /// Refused; the platform will not prompt again
    Denied,
    /// Not yet asked
    Prompt,
    #[default]
    Unknown,
}

impl std::fmt::Display for PermissionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PermissionState::Granted => write!(f, "granted"),
            PermissionState::Denied => write!(f, "denied"),
            PermissionState::Prompt => write!(f, "prompt"),
            PermissionState::Unknown => write!(f, "unknown"),
        }
    }
}

/// Platform permission API
///
/// Both calls may block (running a helper process or showing a dialog); the
/// device manager runs them on the blocking pool.
pub trait PermissionProvider: Send + Sync {
    /// Current permission without prompting
    fn query(&self) -> PermissionState;

    /// Prompt if the platform allows it and return the outcome
    fn request(&self) -> PermissionState;
}

/// Result of briefly opening a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceLiveness {
    /// Opened and delivered a live track
    Live,
    /// Failed to open, or the track ended during the check
    Dead,
    /// The check did not finish within the liveness timeout
    Unknown,
}
