//! Error taxonomy for hands-free capture
//!
//! Every failure that can reach the orchestrator is folded into
//! [`HandsfreeError`], which carries its own retry classification.

use crate::audio::capture::CaptureError;
use crate::audio::vad::VadError;
use crate::preferences::StoreError;
use crate::transcription::SpeechError;
use serde::Serialize;

/// Whether a failure is worth retrying
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Retried internally with a bounded count and fixed backoff
    Transient,
    /// Moves the orchestrator to `Error` and is always surfaced
    Terminal,
}

/// Errors surfaced by the hands-free orchestrator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[serde(tag = "code", content = "detail", rename_all = "snake_case")]
pub enum HandsfreeError {
    /// Microphone permission refused by the user or the OS
    #[error("Microphone permission denied")]
    PermissionDenied,

    /// No usable input device
    #[error("No usable audio input device")]
    NoDevice,

    /// The device exists but another consumer holds it
    #[error("Audio device busy: {0}")]
    DeviceBusy(String),

    /// Stream, processing graph or other platform resource failed
    #[error("Audio resource failure: {0}")]
    ResourceFailure(String),

    /// The speech engine needs connectivity it does not have
    #[error("Speech recognition needs network access: {0}")]
    NetworkDependent(String),

    /// Unclassified platform failure
    #[error("Platform error: {0}")]
    UnknownPlatform(String),

    /// `start_hands_free` called before `init`
    #[error("Hands-free manager not initialised")]
    NotInitialized,

    /// Shutdown raced an in-flight warm-up
    #[error("Operation cancelled by shutdown")]
    Cancelled,

    /// Configuration rejected by validation
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl HandsfreeError {
    /// Classify this error given how many unknown platform errors were seen
    /// before it in the current run.
    ///
    /// Unknown platform errors get one retry, then become terminal.
    pub fn classify(&self, prior_unknown: u32) -> ErrorClass {
        match self {
            HandsfreeError::DeviceBusy(_)
            | HandsfreeError::ResourceFailure(_)
            | HandsfreeError::NetworkDependent(_) => ErrorClass::Transient,
            HandsfreeError::UnknownPlatform(_) if prior_unknown == 0 => ErrorClass::Transient,
            _ => ErrorClass::Terminal,
        }
    }

    /// Stable machine-readable code for observers and logs
    pub fn code(&self) -> &'static str {
        match self {
            HandsfreeError::PermissionDenied => "permission_denied",
            HandsfreeError::NoDevice => "no_device",
            HandsfreeError::DeviceBusy(_) => "device_busy",
            HandsfreeError::ResourceFailure(_) => "resource_failure",
            HandsfreeError::NetworkDependent(_) => "network_dependent",
            HandsfreeError::UnknownPlatform(_) => "unknown_platform",
            HandsfreeError::NotInitialized => "not_initialized",
            HandsfreeError::Cancelled => "cancelled",
            HandsfreeError::InvalidConfig(_) => "invalid_config",
        }
    }
}

impl From<CaptureError> for HandsfreeError {
    fn from(err: CaptureError) -> Self {
        match err {
            CaptureError::PermissionDenied => HandsfreeError::PermissionDenied,
            CaptureError::DeviceNotFound(_) => HandsfreeError::NoDevice,
            CaptureError::DeviceBusy(msg) => HandsfreeError::DeviceBusy(msg),
            CaptureError::Unsupported(msg) => HandsfreeError::ResourceFailure(msg),
            CaptureError::StreamEnded => {
                HandsfreeError::ResourceFailure("capture stream ended".to_string())
            }
            CaptureError::Backend(msg) => HandsfreeError::UnknownPlatform(msg),
        }
    }
}

impl From<VadError> for HandsfreeError {
    fn from(err: VadError) -> Self {
        HandsfreeError::ResourceFailure(err.to_string())
    }
}

impl From<SpeechError> for HandsfreeError {
    fn from(err: SpeechError) -> Self {
        match err {
            SpeechError::PermissionDenied => HandsfreeError::PermissionDenied,
            SpeechError::AudioCapture(msg) => HandsfreeError::DeviceBusy(msg),
            SpeechError::Network(msg) => HandsfreeError::NetworkDependent(msg),
            SpeechError::Unavailable(msg) => HandsfreeError::ResourceFailure(msg),
            SpeechError::Other(msg) => HandsfreeError::UnknownPlatform(msg),
        }
    }
}

impl From<StoreError> for HandsfreeError {
    fn from(err: StoreError) -> Self {
        HandsfreeError::ResourceFailure(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_errors() {
        assert_eq!(HandsfreeError::PermissionDenied.classify(0), ErrorClass::Terminal);
        assert_eq!(HandsfreeError::NoDevice.classify(0), ErrorClass::Terminal);
        assert_eq!(HandsfreeError::Cancelled.classify(0), ErrorClass::Terminal);
    }

    #[test]
    fn test_transient_errors() {
        assert_eq!(
            HandsfreeError::DeviceBusy("held".into()).classify(3),
            ErrorClass::Transient
        );
        assert_eq!(
            HandsfreeError::ResourceFailure("ctx".into()).classify(0),
            ErrorClass::Transient
        );
        assert_eq!(
            HandsfreeError::NetworkDependent("offline".into()).classify(0),
            ErrorClass::Transient
        );
    }

    #[test]
    fn test_unknown_platform_is_transient_once() {
        let err = HandsfreeError::UnknownPlatform("weird".into());
        assert_eq!(err.classify(0), ErrorClass::Transient);
        assert_eq!(err.classify(1), ErrorClass::Terminal);
    }

    #[test]
    fn test_capture_error_mapping() {
        assert_eq!(
            HandsfreeError::from(CaptureError::DeviceNotFound("x".into())),
            HandsfreeError::NoDevice
        );
        assert!(matches!(
            HandsfreeError::from(CaptureError::DeviceBusy("x".into())),
            HandsfreeError::DeviceBusy(_)
        ));
        assert!(matches!(
            HandsfreeError::from(CaptureError::Backend("x".into())),
            HandsfreeError::UnknownPlatform(_)
        ));
    }

    #[test]
    fn test_speech_error_mapping() {
        assert_eq!(
            HandsfreeError::from(SpeechError::PermissionDenied),
            HandsfreeError::PermissionDenied
        );
        assert!(matches!(
            HandsfreeError::from(SpeechError::Network("down".into())),
            HandsfreeError::NetworkDependent(_)
        ));
    }
}
