//! Audio capture abstraction and the cpal backend
//!
//! A [`CaptureBackend`] hands out at most one live [`CaptureStream`] per
//! acquisition. Streams deliver mono samples to a replaceable tap that runs
//! on the platform's real-time audio thread, so taps must not block or
//! allocate.

use super::device::{find_input_device_by_id, get_device_display_name, list_input_devices};
use super::device::DeviceRecord;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Consumer of mono samples, invoked from the capture callback
pub type SampleTap = Box<dyn FnMut(&[f32]) + Send>;

/// Errors reported by capture backends
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CaptureError {
    #[error("Microphone access denied by the platform")]
    PermissionDenied,

    #[error("Audio device not found: {0}")]
    DeviceNotFound(String),

    #[error("Audio device busy: {0}")]
    DeviceBusy(String),

    #[error("Unsupported stream configuration: {0}")]
    Unsupported(String),

    #[error("Capture stream has ended")]
    StreamEnded,

    #[error("Audio backend error: {0}")]
    Backend(String),
}

/// Liveness of a stream's audio track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackState {
    /// Delivering audio
    Live,
    /// Stopped, disconnected, or failed
    Ended,
}

/// Processing requests passed to the platform at acquisition
///
/// Backends without the corresponding processing treat these as advisory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureConstraints {
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
}

impl Default for CaptureConstraints {
    fn default() -> Self {
        Self {
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
        }
    }
}

/// One acquired input stream
pub trait CaptureStream: Send {
    /// Identifier of the device backing this stream, when known
    fn device_id(&self) -> Option<&str>;

    /// Sample rate of the mono samples delivered to the tap
    fn sample_rate(&self) -> u32;

    /// Current liveness of the audio track
    fn track_state(&self) -> TrackState;

    /// Whether taps may do per-block analysis inside the callback
    fn supports_realtime_tap(&self) -> bool;

    /// Install or remove the sample tap
    fn set_tap(&mut self, tap: Option<SampleTap>) -> Result<(), CaptureError>;

    /// Stop the stream and release the device; idempotent
    fn stop(&mut self);
}

/// Platform capture API
pub trait CaptureBackend: Send + Sync {
    /// List input devices; labels may be empty before permission is granted
    fn enumerate_devices(&self) -> Result<Vec<DeviceRecord>, CaptureError>;

    /// Acquire a stream from `device_id`, or the platform default when `None`
    fn acquire(
        &self,
        device_id: Option<&str>,
        constraints: &CaptureConstraints,
    ) -> Result<Box<dyn CaptureStream>, CaptureError>;
}

// =============================================================================
// cpal backend
// =============================================================================

/// Capture backend over the default cpal host
pub struct CpalBackend {
    realtime_taps: bool,
}

impl Default for CpalBackend {
    fn default() -> Self {
        Self::new(true)
    }
}

impl CpalBackend {
    /// Create a backend; `realtime_taps = false` forces the polling VAD path
    pub fn new(realtime_taps: bool) -> Self {
        Self { realtime_taps }
    }
}

impl CaptureBackend for CpalBackend {
    fn enumerate_devices(&self) -> Result<Vec<DeviceRecord>, CaptureError> {
        Ok(list_input_devices())
    }

    fn acquire(
        &self,
        device_id: Option<&str>,
        constraints: &CaptureConstraints,
    ) -> Result<Box<dyn CaptureStream>, CaptureError> {
        let device = match device_id {
            Some(id) => find_input_device_by_id(id)
                .ok_or_else(|| CaptureError::DeviceNotFound(id.to_string()))?,
            None => cpal::default_host()
                .default_input_device()
                .ok_or_else(|| CaptureError::DeviceNotFound("default".to_string()))?,
        };

        tracing::debug!(
            "Capture constraints (advisory on cpal): echo_cancellation={}, noise_suppression={}, auto_gain_control={}",
            constraints.echo_cancellation,
            constraints.noise_suppression,
            constraints.auto_gain_control
        );

        let stream = CpalStream::open(&device, device_id.map(str::to_string), self.realtime_taps)?;
        Ok(Box::new(stream))
    }
}

/// A playing cpal input stream with a swappable mono tap
pub struct CpalStream {
    stream: Option<cpal::Stream>,
    device_id: Option<String>,
    sample_rate: u32,
    tap: Arc<Mutex<Option<SampleTap>>>,
    ended: Arc<AtomicBool>,
    realtime_taps: bool,
}

impl CpalStream {
    fn open(
        device: &cpal::Device,
        device_id: Option<String>,
        realtime_taps: bool,
    ) -> Result<Self, CaptureError> {
        let device_name = get_device_display_name(device);
        let supported_config = device.default_input_config().map_err(map_config_error)?;
        // cpal 0.17 returns u32 directly, not a tuple
        let sample_rate = supported_config.sample_rate();
        let channels = supported_config.channels() as usize;

        tracing::info!(
            "Opening capture stream: device='{}', {}Hz, {} channels, format={:?}",
            device_name,
            sample_rate,
            channels,
            supported_config.sample_format()
        );

        let tap: Arc<Mutex<Option<SampleTap>>> = Arc::new(Mutex::new(None));
        let ended = Arc::new(AtomicBool::new(false));

        let callback_tap = tap.clone();
        let error_ended = ended.clone();
        let mut mono = Vec::with_capacity(4096);

        let stream = device
            .build_input_stream(
                &supported_config.into(),
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    mono.clear();
                    mono.extend(
                        data.chunks(channels.max(1))
                            .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32),
                    );
                    // Never wait on the control thread from the audio thread
                    if let Some(mut guard) = callback_tap.try_lock() {
                        if let Some(tap) = guard.as_mut() {
                            tap(&mono);
                        }
                    }
                },
                move |err| {
                    tracing::error!("Capture stream error: {}", err);
                    if matches!(err, cpal::StreamError::DeviceNotAvailable) {
                        error_ended.store(true, Ordering::SeqCst);
                    }
                },
                None,
            )
            .map_err(map_build_error)?;

        stream
            .play()
            .map_err(|e| CaptureError::DeviceBusy(e.to_string()))?;

        Ok(Self {
            stream: Some(stream),
            device_id,
            sample_rate,
            tap,
            ended,
            realtime_taps,
        })
    }
}

impl CaptureStream for CpalStream {
    fn device_id(&self) -> Option<&str> {
        self.device_id.as_deref()
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn track_state(&self) -> TrackState {
        if self.stream.is_some() && !self.ended.load(Ordering::SeqCst) {
            TrackState::Live
        } else {
            TrackState::Ended
        }
    }

    fn supports_realtime_tap(&self) -> bool {
        self.realtime_taps
    }

    fn set_tap(&mut self, tap: Option<SampleTap>) -> Result<(), CaptureError> {
        if tap.is_some() && self.track_state() == TrackState::Ended {
            return Err(CaptureError::StreamEnded);
        }
        let previous = std::mem::replace(&mut *self.tap.lock(), tap);
        drop(previous);
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(stream) = self.stream.take() {
            if let Err(e) = stream.pause() {
                tracing::debug!("Pausing capture stream before release failed: {}", e);
            }
            drop(stream);
            tracing::info!("Capture stream released");
        }
        self.tap.lock().take();
    }
}

impl Drop for CpalStream {
    fn drop(&mut self) {
        self.stop();
    }
}

fn map_config_error(err: cpal::DefaultStreamConfigError) -> CaptureError {
    match err {
        cpal::DefaultStreamConfigError::DeviceNotAvailable => {
            CaptureError::DeviceNotFound(err.to_string())
        }
        cpal::DefaultStreamConfigError::StreamTypeNotSupported => {
            CaptureError::Unsupported(err.to_string())
        }
        other => CaptureError::Backend(other.to_string()),
    }
}

fn map_build_error(err: cpal::BuildStreamError) -> CaptureError {
    match err {
        cpal::BuildStreamError::DeviceNotAvailable => CaptureError::DeviceBusy(err.to_string()),
        cpal::BuildStreamError::StreamConfigNotSupported
        | cpal::BuildStreamError::InvalidArgument => CaptureError::Unsupported(err.to_string()),
        other => CaptureError::Backend(other.to_string()),
    }
}
