//! The single live capture session and the release gate between sessions

use super::capture::{CaptureStream, TrackState};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use uuid::Uuid;

/// Serialises access to the capture device
///
/// At most one [`DeviceClaim`] exists at a time. A claim is taken before a
/// platform open starts and is dropped only when the open fails or the
/// resulting stream is released, so an open that outlives its caller's
/// timeout still blocks the next one. After a stream is released the gate
/// also enforces a minimum pause, since some platforms report the device as
/// busy for a short while.
#[derive(Debug)]
pub struct ReleaseGate {
    min_delay: Duration,
    state: Mutex<GateState>,
    idle: Notify,
}

#[derive(Debug, Default)]
struct GateState {
    held: bool,
    last_release: Option<Instant>,
}

impl GateState {
    /// Time left before the next acquisition may start
    fn settle_time(&self, min_delay: Duration) -> Duration {
        match self.last_release {
            Some(at) => min_delay.saturating_sub(at.elapsed()),
            None => Duration::ZERO,
        }
    }
}

impl ReleaseGate {
    pub fn new(min_delay: Duration) -> Self {
        Self {
            min_delay,
            state: Mutex::new(GateState::default()),
            idle: Notify::new(),
        }
    }

    /// Minimum pause after a release
    pub fn min_delay(&self) -> Duration {
        self.min_delay
    }

    #[cfg(test)]
    pub(crate) fn is_held(&self) -> bool {
        self.state.lock().held
    }

    #[cfg(test)]
    pub(crate) fn remaining(&self) -> Duration {
        self.state.lock().settle_time(self.min_delay)
    }

    /// Wait for the device to be free, then claim it
    pub async fn claim(self: &Arc<Self>) -> DeviceClaim {
        loop {
            let idle = self.idle.notified();
            tokio::pin!(idle);
            idle.as_mut().enable();

            match self.try_claim() {
                Ok(claim) => return claim,
                Err(Some(remaining)) => {
                    tracing::debug!("Waiting {:?} for device release to settle", remaining);
                    tokio::time::sleep(remaining).await;
                }
                Err(None) => {
                    tracing::debug!("Waiting for an earlier acquisition to finish");
                    idle.await;
                }
            }
        }
    }

    /// `Err(Some(wait))` while settling after a release, `Err(None)` while held
    fn try_claim(self: &Arc<Self>) -> Result<DeviceClaim, Option<Duration>> {
        let mut state = self.state.lock();
        if state.held {
            return Err(None);
        }
        let remaining = state.settle_time(self.min_delay);
        if !remaining.is_zero() {
            return Err(Some(remaining));
        }
        state.held = true;
        Ok(DeviceClaim {
            gate: self.clone(),
            opened: false,
        })
    }

    fn release(&self, opened: bool) {
        {
            let mut state = self.state.lock();
            state.held = false;
            if opened {
                state.last_release = Some(Instant::now());
            }
        }
        self.idle.notify_waiters();
    }
}

/// Exclusive right to open the capture device
///
/// Dropping the claim frees the gate; if a stream was opened under it the
/// release timer starts too.
#[derive(Debug)]
pub struct DeviceClaim {
    gate: Arc<ReleaseGate>,
    opened: bool,
}

impl Drop for DeviceClaim {
    fn drop(&mut self) {
        self.gate.release(self.opened);
    }
}

/// An acquired stream plus its bookkeeping
///
/// The session owns the device claim. Dropping it stops the stream first and
/// then frees the claim, so every exit path releases the device.
pub struct CaptureSession {
    id: Uuid,
    stream: Box<dyn CaptureStream>,
    _claim: DeviceClaim,
}

impl CaptureSession {
    pub fn new(stream: Box<dyn CaptureStream>, mut claim: DeviceClaim) -> Self {
        claim.opened = true;
        let session = Self {
            id: Uuid::new_v4(),
            stream,
            _claim: claim,
        };
        tracing::debug!(
            "Capture session {} opened on {}",
            session.id,
            session.device_id().unwrap_or("default device")
        );
        session
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn device_id(&self) -> Option<&str> {
        self.stream.device_id()
    }

    pub fn track_state(&self) -> TrackState {
        self.stream.track_state()
    }

    pub fn is_live(&self) -> bool {
        self.track_state() == TrackState::Live
    }

    pub fn stream_mut(&mut self) -> &mut dyn CaptureStream {
        self.stream.as_mut()
    }

    /// Stop the stream and release the device
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        // The claim field drops after this, once the stream is stopped
        self.stream.stop();
        tracing::debug!("Capture session {} released", self.id);
    }
}
