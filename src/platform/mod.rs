//! Platform-specific functionality

#[cfg(target_os = "linux")]
pub mod linux;

use crate::devices::{PermissionProvider, PermissionState};

/// Microphone permission as reported by the operating system
///
/// Only Linux is checked; other platforms surface refusals through the
/// capture backend when the stream is opened.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemPermissionProvider;

impl PermissionProvider for SystemPermissionProvider {
    fn query(&self) -> PermissionState {
        #[cfg(target_os = "linux")]
        {
            linux::check_microphone_permission()
        }
        #[cfg(not(target_os = "linux"))]
        {
            PermissionState::Granted
        }
    }

    fn request(&self) -> PermissionState {
        // No desktop platform we query shows a dialog, so asking again is a re-check
        tracing::info!("Requesting microphone access");
        self.query()
    }
}
