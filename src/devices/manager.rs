//! Permission checks, device enumeration, liveness testing and acquisition
//!
//! Every call into the platform runs on the blocking pool so a slow audio
//! server never stalls the driver task. Acquisitions (liveness checks
//! included) claim the shared [`ReleaseGate`] first and hand the claim to the
//! blocking task, so an open that outlives its timeout keeps the device
//! claimed until it finishes.

use super::{DeviceLiveness, PermissionProvider, PermissionState};
use crate::audio::capture::{CaptureBackend, CaptureConstraints, CaptureError, TrackState};
use crate::audio::device::{DeviceKind, DeviceRecord};
use crate::audio::session::{CaptureSession, ReleaseGate};
use crate::config::DevicesConfig;
use crate::error::HandsfreeError;
use crate::preferences::{PreferenceStore, PREFERRED_INPUT_DEVICE_KEY};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

pub struct PermissionAndDeviceManager {
    backend: Arc<dyn CaptureBackend>,
    permissions: Arc<dyn PermissionProvider>,
    store: Arc<dyn PreferenceStore>,
    gate: Arc<ReleaseGate>,
    config: DevicesConfig,
    constraints: CaptureConstraints,
    permission: Mutex<PermissionState>,
}

impl PermissionAndDeviceManager {
    pub fn new(
        backend: Arc<dyn CaptureBackend>,
        permissions: Arc<dyn PermissionProvider>,
        store: Arc<dyn PreferenceStore>,
        gate: Arc<ReleaseGate>,
        config: DevicesConfig,
        constraints: CaptureConstraints,
    ) -> Self {
        Self {
            backend,
            permissions,
            store,
            gate,
            config,
            constraints,
            permission: Mutex::new(PermissionState::Unknown),
        }
    }

    /// Last permission state seen, without re-querying
    pub fn last_permission(&self) -> PermissionState {
        *self.permission.lock()
    }

    /// Re-query the platform permission
    pub async fn check_permission(&self) -> PermissionState {
        let provider = self.permissions.clone();
        let state = tokio::task::spawn_blocking(move || provider.query())
            .await
            .unwrap_or_else(|e| {
                tracing::error!("Permission query task failed: {}", e);
                PermissionState::Unknown
            });
        *self.permission.lock() = state;
        tracing::debug!("Microphone permission: {}", state);
        state
    }

    /// Ask for permission, prompting only when the platform can still prompt
    pub async fn request_permission(&self) -> PermissionState {
        let current = self.check_permission().await;
        match current {
            PermissionState::Granted => return current,
            PermissionState::Denied => {
                tracing::warn!("Microphone permission previously denied; not prompting");
                return current;
            }
            PermissionState::Prompt | PermissionState::Unknown => {}
        }

        let provider = self.permissions.clone();
        let state = tokio::task::spawn_blocking(move || provider.request())
            .await
            .unwrap_or_else(|e| {
                tracing::error!("Permission request task failed: {}", e);
                PermissionState::Unknown
            });
        *self.permission.lock() = state;
        tracing::info!("Microphone permission after request: {}", state);
        state
    }

    /// Enumerate audio inputs and refresh the cache
    pub async fn enumerate_devices(&self) -> Result<Vec<DeviceRecord>, HandsfreeError> {
        let backend = self.backend.clone();
        let devices = tokio::task::spawn_blocking(move || backend.enumerate_devices())
            .await
            .map_err(|e| HandsfreeError::UnknownPlatform(e.to_string()))??;

        let inputs: Vec<DeviceRecord> = devices
            .into_iter()
            .filter(|d| d.kind == DeviceKind::AudioInput)
            .collect();

        let unlabelled = inputs.iter().filter(|d| d.label.trim().is_empty()).count();
        if unlabelled > 0 {
            tracing::debug!("{} input devices have no label yet", unlabelled);
        }

        Ok(inputs)
    }

    /// Briefly open `device_id` and report whether it delivers a live track
    pub async fn test_device(&self, device_id: &str) -> DeviceLiveness {
        let timeout = Duration::from_millis(self.config.liveness_timeout_ms);
        let Ok(claim) = tokio::time::timeout(timeout + self.gate.min_delay(), self.gate.claim()).await
        else {
            tracing::warn!(
                "Device still held by an earlier acquisition; liveness of {} unknown",
                device_id
            );
            return DeviceLiveness::Unknown;
        };

        let backend = self.backend.clone();
        let constraints = self.constraints.clone();
        let sample = Duration::from_millis(self.config.sample_duration_ms);
        let id = device_id.to_string();

        let check_task = tokio::task::spawn_blocking(move || {
            let stream = backend.acquire(Some(&id), &constraints)?;
            let session = CaptureSession::new(stream, claim);
            if !sample.is_zero() {
                std::thread::sleep(sample);
            }
            Ok::<_, CaptureError>(session.track_state())
        });

        match tokio::time::timeout(timeout, check_task).await {
            Ok(Ok(Ok(TrackState::Live))) => DeviceLiveness::Live,
            Ok(Ok(Ok(TrackState::Ended))) => {
                tracing::debug!("Device {} opened but its track ended", device_id);
                DeviceLiveness::Dead
            }
            Ok(Ok(Err(e))) => {
                tracing::debug!("Device {} failed liveness test: {}", device_id, e);
                DeviceLiveness::Dead
            }
            Ok(Err(e)) => {
                tracing::error!("Liveness check task for {} failed: {}", device_id, e);
                DeviceLiveness::Dead
            }
            Err(_) => {
                tracing::warn!(
                    "Liveness test for {} timed out after {:?}",
                    device_id,
                    timeout
                );
                DeviceLiveness::Unknown
            }
        }
    }

    /// Pick the first device that tests live
    ///
    /// Candidates: the preferred device, then devices with a specific label,
    /// then the rest. The winner becomes the preferred device.
    pub async fn select_best_device(&self) -> Result<DeviceRecord, HandsfreeError> {
        let devices = self.enumerate_devices().await?;
        if devices.is_empty() {
            tracing::error!("No audio input devices found");
            return Err(HandsfreeError::NoDevice);
        }

        let preferred = self.get_preferred_device();
        let candidates = order_candidates(&devices, preferred.as_deref());
        let mut first_unknown: Option<DeviceRecord> = None;

        for candidate in candidates {
            match self.test_device(&candidate.device_id).await {
                DeviceLiveness::Live => {
                    tracing::info!(
                        "Selected input device '{}' ({})",
                        candidate.label,
                        candidate.device_id
                    );
                    if preferred.as_deref() != Some(candidate.device_id.as_str()) {
                        self.set_preferred_device(&candidate.device_id)?;
                    }
                    return Ok(candidate);
                }
                DeviceLiveness::Unknown => {
                    first_unknown.get_or_insert(candidate);
                }
                DeviceLiveness::Dead => {}
            }
        }

        match first_unknown {
            Some(candidate) => {
                tracing::warn!(
                    "No device tested live; using '{}' ({}) whose liveness is unknown",
                    candidate.label,
                    candidate.device_id
                );
                Ok(candidate)
            }
            None => {
                tracing::error!("No input device passed the liveness test");
                Err(HandsfreeError::NoDevice)
            }
        }
    }

    /// Open the real capture session on `device_id`
    ///
    /// Bounded by the acquire timeout; a stream that arrives after the
    /// timeout is released as soon as it opens.
    pub async fn acquire(&self, device_id: Option<&str>) -> Result<CaptureSession, HandsfreeError> {
        let timeout = Duration::from_millis(self.config.acquire_timeout_ms);
        let claim = tokio::time::timeout(timeout + self.gate.min_delay(), self.gate.claim())
            .await
            .map_err(|_| {
                HandsfreeError::DeviceBusy("an earlier acquisition is still pending".to_string())
            })?;

        let backend = self.backend.clone();
        let constraints = self.constraints.clone();
        let id = device_id.map(str::to_string);

        let acquire_task = tokio::task::spawn_blocking(move || {
            let stream = backend.acquire(id.as_deref(), &constraints)?;
            Ok::<_, CaptureError>(CaptureSession::new(stream, claim))
        });

        match tokio::time::timeout(timeout, acquire_task).await {
            Ok(Ok(Ok(session))) => Ok(session),
            Ok(Ok(Err(e))) => Err(e.into()),
            Ok(Err(e)) => Err(HandsfreeError::UnknownPlatform(e.to_string())),
            Err(_) => Err(HandsfreeError::DeviceBusy(format!(
                "acquisition timed out after {timeout:?}"
            ))),
        }
    }

    /// Persisted preferred device, if any
    pub fn get_preferred_device(&self) -> Option<String> {
        match self.store.get(PREFERRED_INPUT_DEVICE_KEY) {
            Ok(value) => value.filter(|id| !id.is_empty()),
            Err(e) => {
                tracing::warn!("Failed to read preferred device: {}", e);
                None
            }
        }
    }

    pub fn set_preferred_device(&self, device_id: &str) -> Result<(), HandsfreeError> {
        self.store.set(PREFERRED_INPUT_DEVICE_KEY, device_id)?;
        tracing::info!("Preferred input device set to {}", device_id);
        Ok(())
    }

    pub fn clear_preferred_device(&self) -> Result<(), HandsfreeError> {
        self.store.remove(PREFERRED_INPUT_DEVICE_KEY)?;
        tracing::info!("Preferred input device cleared");
        Ok(())
    }
}

/// Candidate order: preferred, specific labels, then everything else
fn order_candidates(devices: &[DeviceRecord], preferred: Option<&str>) -> Vec<DeviceRecord> {
    let mut ordered = Vec::with_capacity(devices.len());

    if let Some(preferred_id) = preferred {
        match devices.iter().find(|d| d.device_id == preferred_id) {
            Some(device) => ordered.push(device.clone()),
            None => tracing::info!("Preferred device {} is not present", preferred_id),
        }
    }

    let remaining = devices
        .iter()
        .filter(|d| Some(d.device_id.as_str()) != preferred);
    let (specific, generic): (Vec<&DeviceRecord>, Vec<&DeviceRecord>) =
        remaining.partition(|d| d.has_specific_label());

    ordered.extend(specific.into_iter().cloned());
    ordered.extend(generic.into_iter().cloned());
    ordered
}
