//! In-memory stand-ins for every external collaborator, used by unit tests

use crate::audio::capture::{
    CaptureBackend, CaptureConstraints, CaptureError, CaptureStream, SampleTap, TrackState,
};
use crate::audio::device::DeviceRecord;
use crate::devices::{PermissionProvider, PermissionState};
use crate::error::HandsfreeError;
use crate::handsfree::{HandsfreeObserver, StateChange};
use crate::playback::SpeechOutput;
use crate::transcription::{
    SpeechEngine, SpeechError, SpeechEvent, SpeechEventSink, SpeechRequest,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Shared counter
#[derive(Debug, Clone, Default)]
pub struct Counter(Arc<AtomicUsize>);

impl Counter {
    pub fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }

    fn incr(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }

    fn decr(&self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Ordered log of side effects shared between fakes
#[derive(Debug, Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    pub fn push(&self, entry: impl Into<String>) {
        self.0.lock().push(entry.into());
    }

    pub fn len(&self) -> usize {
        self.0.lock().len()
    }

    pub fn entries_since(&self, mark: usize) -> Vec<String> {
        self.0.lock().iter().skip(mark).cloned().collect()
    }

    pub fn contains(&self, entry: &str) -> bool {
        self.0.lock().iter().any(|e| e == entry)
    }

    /// Entries starting with `prefix`, in order
    pub fn matching(&self, prefix: &str) -> Vec<String> {
        self.0
            .lock()
            .iter()
            .filter(|e| e.starts_with(prefix))
            .cloned()
            .collect()
    }
}

/// Poll `condition` until it holds or `timeout` passes
pub async fn wait_for(mut condition: impl FnMut() -> bool, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

// =============================================================================
// Capture
// =============================================================================

#[derive(Default)]
struct StreamShared {
    tap: Mutex<Option<SampleTap>>,
    ended: AtomicBool,
    stopped: AtomicBool,
}

impl StreamShared {
    fn feed(&self, samples: &[f32]) -> bool {
        if self.stopped.load(Ordering::SeqCst) {
            return false;
        }
        match self.tap.lock().as_mut() {
            Some(tap) => {
                tap(samples);
                true
            }
            None => false,
        }
    }
}

/// Capture stream whose samples come from the test
pub struct FakeStream {
    id: String,
    rate: u32,
    realtime: bool,
    shared: Arc<StreamShared>,
    open: Counter,
}

impl FakeStream {
    pub fn new(id: &str, rate: u32, realtime: bool) -> Self {
        Self::counted(id, rate, realtime, Counter::default())
    }

    fn counted(id: &str, rate: u32, realtime: bool, open: Counter) -> Self {
        open.incr();
        Self {
            id: id.to_string(),
            rate,
            realtime,
            shared: Arc::new(StreamShared::default()),
            open,
        }
    }

    /// Counter of streams from the same source that are still open
    pub fn open_counter(&self) -> Counter {
        self.open.clone()
    }

    /// Push samples through the installed tap, as the audio callback would
    pub fn feed(&self, samples: &[f32]) {
        self.shared.feed(samples);
    }

    pub fn has_tap(&self) -> bool {
        self.shared.tap.lock().is_some()
    }

    /// Simulate the device disappearing
    pub fn end(&self) {
        self.shared.ended.store(true, Ordering::SeqCst);
    }
}

impl CaptureStream for FakeStream {
    fn device_id(&self) -> Option<&str> {
        Some(&self.id)
    }

    fn sample_rate(&self) -> u32 {
        self.rate
    }

    fn track_state(&self) -> TrackState {
        if self.shared.ended.load(Ordering::SeqCst) || self.shared.stopped.load(Ordering::SeqCst)
        {
            TrackState::Ended
        } else {
            TrackState::Live
        }
    }

    fn supports_realtime_tap(&self) -> bool {
        self.realtime
    }

    fn set_tap(&mut self, tap: Option<SampleTap>) -> Result<(), CaptureError> {
        if tap.is_some() && self.track_state() == TrackState::Ended {
            return Err(CaptureError::StreamEnded);
        }
        *self.shared.tap.lock() = tap;
        Ok(())
    }

    fn stop(&mut self) {
        if self.shared.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shared.tap.lock().take();
        self.open.decr();
    }
}

impl Drop for FakeStream {
    fn drop(&mut self) {
        self.stop();
    }
}

/// How a fake device responds to acquisition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FakeDevice {
    Live,
    /// Opens, but its track has already ended
    Dead,
    Busy,
    /// Blocks for the duration, then opens live
    Hang(Duration),
    Denied,
}

struct FakeDeviceEntry {
    record: DeviceRecord,
    behaviour: FakeDevice,
}

/// Capture backend over scripted devices
pub struct FakeBackend {
    devices: Mutex<Vec<FakeDeviceEntry>>,
    streams: Mutex<Vec<Arc<StreamShared>>>,
    open: Counter,
    attempts: Counter,
    acquisitions: Counter,
    pending: Counter,
    peak_in_use: AtomicUsize,
    realtime: AtomicBool,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self {
            devices: Mutex::new(Vec::new()),
            streams: Mutex::new(Vec::new()),
            open: Counter::default(),
            attempts: Counter::default(),
            acquisitions: Counter::default(),
            pending: Counter::default(),
            peak_in_use: AtomicUsize::new(0),
            realtime: AtomicBool::new(true),
        }
    }

    pub fn add_device(&self, id: &str, label: &str, behaviour: FakeDevice) {
        self.devices.lock().push(FakeDeviceEntry {
            record: DeviceRecord::input(id, label),
            behaviour,
        });
    }

    pub fn set_behaviour(&self, id: &str, behaviour: FakeDevice) {
        if let Some(entry) = self
            .devices
            .lock()
            .iter_mut()
            .find(|d| d.record.device_id == id)
        {
            entry.behaviour = behaviour;
        }
    }

    /// Whether new streams allow analysis in their callback
    pub fn set_realtime(&self, realtime: bool) {
        self.realtime.store(realtime, Ordering::SeqCst);
    }

    /// Streams acquired and not yet stopped
    pub fn open_streams(&self) -> usize {
        self.open.get()
    }

    /// Successful acquisitions, liveness checks included
    pub fn acquisitions(&self) -> usize {
        self.acquisitions.get()
    }

    /// Every call to `acquire`, failed ones included
    pub fn attempts(&self) -> usize {
        self.attempts.get()
    }

    /// Most opens in flight plus open streams seen at any one time
    pub fn peak_in_use(&self) -> usize {
        self.peak_in_use.load(Ordering::SeqCst)
    }

    /// Feed the most recently opened stream that has a tap installed
    pub fn feed(&self, samples: &[f32]) {
        let target = self
            .streams
            .lock()
            .iter()
            .rev()
            .find(|s| !s.stopped.load(Ordering::SeqCst) && s.tap.lock().is_some())
            .cloned();
        if let Some(stream) = target {
            stream.feed(samples);
        }
    }

    /// End every stream opened so far
    pub fn end_streams(&self) {
        for stream in self.streams.lock().iter() {
            stream.ended.store(true, Ordering::SeqCst);
        }
    }
}

impl Default for FakeBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl CaptureBackend for FakeBackend {
    fn enumerate_devices(&self) -> Result<Vec<DeviceRecord>, CaptureError> {
        Ok(self.devices.lock().iter().map(|d| d.record.clone()).collect())
    }

    fn acquire(
        &self,
        device_id: Option<&str>,
        _constraints: &CaptureConstraints,
    ) -> Result<Box<dyn CaptureStream>, CaptureError> {
        self.attempts.incr();
        self.pending.incr();
        self.peak_in_use
            .fetch_max(self.pending.get() + self.open.get(), Ordering::SeqCst);
        let result = self.open_stream(device_id);
        self.pending.decr();
        result
    }
}

impl FakeBackend {
    fn open_stream(&self, device_id: Option<&str>) -> Result<Box<dyn CaptureStream>, CaptureError> {
        let (id, behaviour) = {
            let devices = self.devices.lock();
            let entry = match device_id {
                Some(id) => devices.iter().find(|d| d.record.device_id == id),
                None => devices.first(),
            };
            match entry {
                Some(entry) => (entry.record.device_id.clone(), entry.behaviour),
                None => {
                    return Err(CaptureError::DeviceNotFound(
                        device_id.unwrap_or("default").to_string(),
                    ))
                }
            }
        };

        match behaviour {
            FakeDevice::Busy => return Err(CaptureError::DeviceBusy(id)),
            FakeDevice::Denied => return Err(CaptureError::PermissionDenied),
            FakeDevice::Hang(delay) => std::thread::sleep(delay),
            FakeDevice::Live | FakeDevice::Dead => {}
        }

        let stream = FakeStream::counted(
            &id,
            16_000,
            self.realtime.load(Ordering::SeqCst),
            self.open.clone(),
        );
        if behaviour == FakeDevice::Dead {
            stream.end();
        }
        self.streams.lock().push(stream.shared.clone());
        self.acquisitions.incr();
        Ok(Box::new(stream))
    }
}

// =============================================================================
// Permission
// =============================================================================

pub struct FakePermission {
    state: Mutex<PermissionState>,
    request_outcome: Mutex<Option<PermissionState>>,
    requests: Counter,
}

impl FakePermission {
    pub fn new(state: PermissionState) -> Self {
        Self {
            state: Mutex::new(state),
            request_outcome: Mutex::new(None),
            requests: Counter::default(),
        }
    }

    /// What the next prompt resolves to; defaults to the current state
    pub fn set_request_outcome(&self, outcome: PermissionState) {
        *self.request_outcome.lock() = Some(outcome);
    }

    pub fn request_count(&self) -> usize {
        self.requests.get()
    }
}

impl PermissionProvider for FakePermission {
    fn query(&self) -> PermissionState {
        *self.state.lock()
    }

    fn request(&self) -> PermissionState {
        self.requests.incr();
        if let Some(outcome) = self.request_outcome.lock().take() {
            *self.state.lock() = outcome;
        }
        *self.state.lock()
    }
}

// =============================================================================
// Speech
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum SpeechCall {
    Start(SpeechRequest),
    Stop,
}

/// Speech engine driven by the test through [`FakeSpeechEngine::emit`]
#[derive(Default)]
pub struct FakeSpeechEngine {
    calls: Mutex<Vec<SpeechCall>>,
    sink: Mutex<Option<SpeechEventSink>>,
    failures: Mutex<(usize, Option<SpeechError>)>,
    journal: Option<Journal>,
}

impl FakeSpeechEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_journal(journal: Journal) -> Self {
        Self {
            journal: Some(journal),
            ..Self::default()
        }
    }

    /// Fail the next `count` calls to `start` with `error`
    pub fn fail_next_starts(&self, count: usize, error: SpeechError) {
        *self.failures.lock() = (count, Some(error));
    }

    /// Calls to `start`, failed ones included
    pub fn start_count(&self) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|c| matches!(c, SpeechCall::Start(_)))
            .count()
    }

    pub fn last_request(&self) -> Option<SpeechRequest> {
        self.calls.lock().iter().rev().find_map(|c| match c {
            SpeechCall::Start(request) => Some(request.clone()),
            SpeechCall::Stop => None,
        })
    }

    pub fn calls(&self) -> Vec<SpeechCall> {
        self.calls.lock().clone()
    }

    /// Deliver `event` to the current session's sink
    pub fn emit(&self, event: SpeechEvent) {
        let sink = self.sink.lock().clone();
        if let Some(sink) = sink {
            sink(event);
        }
    }

    fn note(&self, entry: &str) {
        if let Some(journal) = &self.journal {
            journal.push(entry);
        }
    }
}

impl SpeechEngine for FakeSpeechEngine {
    fn start(&self, request: SpeechRequest, sink: SpeechEventSink) -> Result<(), SpeechError> {
        self.calls.lock().push(SpeechCall::Start(request));

        {
            let mut failures = self.failures.lock();
            if failures.0 > 0 {
                failures.0 -= 1;
                if let Some(error) = failures.1.clone() {
                    self.note("stt-start-failed");
                    return Err(error);
                }
            }
        }

        self.note("stt-start");
        *self.sink.lock() = Some(sink);
        Ok(())
    }

    fn stop(&self) {
        self.calls.lock().push(SpeechCall::Stop);
        self.note("stt-stop");
        self.sink.lock().take();
    }
}

/// Playback that records when it is cut off
#[derive(Default)]
pub struct FakeSpeechOutput {
    speaking: AtomicBool,
    stops: Counter,
    journal: Option<Journal>,
}

impl FakeSpeechOutput {
    pub fn with_journal(journal: Journal) -> Self {
        Self {
            journal: Some(journal),
            ..Self::default()
        }
    }

    pub fn set_speaking(&self, speaking: bool) {
        self.speaking.store(speaking, Ordering::SeqCst);
    }

    pub fn stop_count(&self) -> usize {
        self.stops.get()
    }
}

impl SpeechOutput for FakeSpeechOutput {
    fn is_speaking(&self) -> bool {
        self.speaking.load(Ordering::SeqCst)
    }

    fn stop_playback(&self) {
        self.speaking.store(false, Ordering::SeqCst);
        self.stops.incr();
        if let Some(journal) = &self.journal {
            journal.push("tts-stop");
        }
    }
}

// =============================================================================
// Observer
// =============================================================================

/// Writes every notification except level telemetry into a journal
pub struct RecordingObserver {
    journal: Journal,
}

impl RecordingObserver {
    pub fn new(journal: Journal) -> Self {
        Self { journal }
    }
}

impl HandsfreeObserver for RecordingObserver {
    fn on_state_change(&self, change: &StateChange) {
        self.journal.push(format!("state:{:?}", change.new_state));
    }

    fn on_voice_start(&self, _timestamp_ms: u64, _level_db: f32) {
        self.journal.push("voice-start");
    }

    fn on_voice_end(&self, _timestamp_ms: u64, _duration_ms: u64) {
        self.journal.push("voice-end");
    }

    fn on_transcript(&self, text: &str, _is_final: bool) {
        self.journal.push(format!("transcript:{text}"));
    }

    fn on_error(&self, error: &HandsfreeError) {
        self.journal.push(format!("error:{}", error.code()));
    }

    fn on_barge_in(&self) {
        self.journal.push("barge-in");
    }
}
