//! Linux-specific platform functionality
//!
//! Linux has no per-app microphone permission, so access is granted whenever
//! the audio server answers. A server with no capture sources is still
//! "granted": device selection reports the missing microphone as
//! `NoDevice`.

use crate::devices::PermissionState;
use std::process::Command;

/// What the audio server said about capture sources
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SourceScan {
    Found,
    NoSources,
    /// Neither tool answered
    Unavailable,
}

impl SourceScan {
    fn permission(self) -> PermissionState {
        match self {
            SourceScan::Found | SourceScan::NoSources => PermissionState::Granted,
            SourceScan::Unavailable => PermissionState::Unknown,
        }
    }
}

/// Check microphone availability
///
/// Asks PulseAudio for its sources first, then falls back to PipeWire.
pub fn check_microphone_permission() -> PermissionState {
    scan_sources().permission()
}

fn scan_sources() -> SourceScan {
    let output = Command::new("pactl")
        .args(["list", "short", "sources"])
        .output();

    match output {
        Ok(output) if output.status.success() => {
            let stdout = String::from_utf8_lossy(&output.stdout);
            if pactl_lists_input(&stdout) {
                tracing::debug!("Microphone available via PulseAudio/PipeWire");
                SourceScan::Found
            } else {
                tracing::warn!("No microphone sources found");
                SourceScan::NoSources
            }
        }
        Ok(_) => {
            tracing::warn!("pactl command failed, trying pipewire...");
            scan_pipewire()
        }
        Err(e) => {
            tracing::warn!("pactl not available: {}, trying pipewire...", e);
            scan_pipewire()
        }
    }
}

/// Check microphone via PipeWire's pw-cli
fn scan_pipewire() -> SourceScan {
    let output = Command::new("pw-cli").args(["list-objects"]).output();

    match output {
        Ok(output) if output.status.success() => {
            let stdout = String::from_utf8_lossy(&output.stdout);
            if pipewire_lists_capture(&stdout) {
                tracing::debug!("Microphone available via PipeWire");
                SourceScan::Found
            } else {
                tracing::warn!("No PipeWire capture devices found");
                SourceScan::NoSources
            }
        }
        Ok(_) => {
            tracing::warn!("pw-cli command failed");
            SourceScan::Unavailable
        }
        Err(e) => {
            tracing::warn!("pw-cli not available: {}", e);
            SourceScan::Unavailable
        }
    }
}

/// Whether `pactl list short sources` output names an input source
///
/// Monitor sources (loopbacks of outputs) do not count.
fn pactl_lists_input(stdout: &str) -> bool {
    stdout.lines().any(|line| {
        let line = line.trim();
        !line.is_empty() && line.contains("input") && !line.contains(".monitor")
    })
}

/// Whether `pw-cli list-objects` output names a capture node
fn pipewire_lists_capture(stdout: &str) -> bool {
    stdout.contains("Audio/Source") || stdout.contains("capture")
}
