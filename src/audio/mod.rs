//! Audio subsystem for Parley
//!
//! Capture abstraction, device enumeration, level metering, buffering and
//! voice activity detection.

pub mod capture;
pub mod detector;
pub mod device;
pub mod metering;
pub mod pre_roll;
pub mod ring_buffer;
pub mod session;
pub mod strategy;
pub mod vad;

pub use capture::{
    CaptureBackend, CaptureConstraints, CaptureError, CaptureStream, CpalBackend, SampleTap,
    TrackState,
};
pub use detector::{VadEventReceiver, VoiceActivityDetector};
pub use device::{is_generic_label, list_input_devices, DeviceKind, DeviceRecord};
pub use metering::{LevelSample, LevelSmoother, SILENCE_FLOOR_DB};
pub use pre_roll::{AudioBlock, PreRollBuffer};
pub use ring_buffer::SampleRingBuffer;
pub use session::{CaptureSession, DeviceClaim, ReleaseGate};
pub use strategy::{PollingStrategy, ProcessingStrategy, RealtimeStrategy};
pub use vad::{VadAnalyzer, VadConfig, VadError, VadEvent};
