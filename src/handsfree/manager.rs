//! Hands-free orchestration
//!
//! [`HandsfreeManager`] is a cloneable handle over one orchestrator. Warm-up,
//! VAD events, speech engine events and timers are all handled on a single
//! driver task fed by a command queue. The intent signals (`pause_for_tts`,
//! `resume_after_tts`, `set_app_visible`, `shutdown`) are applied
//! synchronously under the same lock.
//!
//! Every teardown bumps a generation counter. Commands, timers and warm-ups
//! carry the generation they were created under and are dropped once it no
//! longer matches.

use super::observer::{deliver, HandsfreeNotification, HandsfreeObserver, StateChange};
use super::recovery::{ErrorRecord, RecoveryDecision, RetryState};
use super::state::{HandsfreeEvent, HandsfreeState, HandsfreeStateMachine};
use crate::audio::capture::CaptureBackend;
use crate::audio::detector::{VadEventReceiver, VoiceActivityDetector};
use crate::audio::device::DeviceRecord;
use crate::audio::pre_roll::AudioBlock;
use crate::audio::session::{CaptureSession, ReleaseGate};
use crate::audio::vad::VadEvent;
use crate::config::Config;
use crate::devices::{PermissionAndDeviceManager, PermissionProvider, PermissionState};
use crate::error::HandsfreeError;
use crate::playback::SpeechOutput;
use crate::preferences::PreferenceStore;
use crate::transcription::{
    BridgeOutcome, BridgeState, SpeechBridge, SpeechEngine, SpeechEvent, SpeechEventSink,
};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// External collaborators, supplied by the composition root
#[derive(Clone)]
pub struct HandsfreeDependencies {
    pub backend: Arc<dyn CaptureBackend>,
    pub permissions: Arc<dyn PermissionProvider>,
    pub preferences: Arc<dyn PreferenceStore>,
    pub speech_engine: Arc<dyn SpeechEngine>,
    pub speech_output: Arc<dyn SpeechOutput>,
}

/// Reasons speech recognition is suspended
///
/// The two flags are independent: lifting one never lifts the other.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PauseReasons {
    /// The app is speaking
    pub tts: bool,
    /// The app is hidden
    pub hidden: bool,
}

impl PauseReasons {
    pub fn any(&self) -> bool {
        self.tts || self.hidden
    }
}

#[derive(Debug, Clone, Copy)]
enum PauseKind {
    Tts,
    Hidden,
}

/// Snapshot of the orchestrator for status displays
#[derive(Debug, Clone, Serialize)]
pub struct HandsfreeStatus {
    pub initialized: bool,
    pub state: HandsfreeState,
    pub description: String,
    /// How long the orchestrator has been in `state`
    pub time_in_state_ms: u64,
    pub pauses: PauseReasons,
    pub permission: PermissionState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device: Option<DeviceRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<Uuid>,
    /// VAD processing strategy in use
    pub strategy: &'static str,
    pub speech_bridge: BridgeState,
    /// Smoothed input level in dBFS
    pub level_db: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<ErrorRecord>,
    pub retry_attempts: u32,
}

enum Command {
    Start {
        reply: oneshot::Sender<Result<(), HandsfreeError>>,
    },
    Recover {
        reply: oneshot::Sender<Result<(), HandsfreeError>>,
    },
    Vad {
        generation: u64,
        event: VadEvent,
    },
    Speech {
        generation: u64,
        session: u64,
        event: SpeechEvent,
    },
    RestartBridge {
        generation: u64,
    },
    Retry {
        generation: u64,
    },
    WatchdogTick {
        generation: u64,
    },
}

type Notes = Vec<HandsfreeNotification>;

/// Hands-free orchestrator handle
///
/// Clones share the same orchestrator. Create one with
/// [`HandsfreeManager::new`], then call [`HandsfreeManager::init`] from
/// inside a tokio runtime.
#[derive(Clone)]
pub struct HandsfreeManager {
    inner: Arc<Inner>,
}

struct Inner {
    deps: HandsfreeDependencies,
    core: Mutex<Option<Core>>,
    observer: RwLock<Option<Arc<dyn HandsfreeObserver>>>,
}

/// Everything that changes while hands-free capture runs
struct Core {
    config: Config,
    runtime: Handle,
    commands: mpsc::UnboundedSender<Command>,
    machine: HandsfreeStateMachine,
    devices: Arc<PermissionAndDeviceManager>,
    vad: VoiceActivityDetector,
    bridge: SpeechBridge,
    session: Option<CaptureSession>,
    device: Option<DeviceRecord>,
    forwarder: Option<std::thread::JoinHandle<()>>,
    watchdog: Option<JoinHandle<()>>,
    timers: Vec<JoinHandle<()>>,
    pauses: PauseReasons,
    retry: RetryState,
    last_error: Option<ErrorRecord>,
    generation: u64,
}

impl HandsfreeManager {
    pub fn new(deps: HandsfreeDependencies) -> Self {
        Self {
            inner: Arc::new(Inner {
                deps,
                core: Mutex::new(None),
                observer: RwLock::new(None),
            }),
        }
    }

    /// Validate `config` and spawn the driver task on the current runtime
    ///
    /// Never prompts for permission. A second call is a no-op and keeps the
    /// first configuration.
    pub fn init(&self, config: Config) -> Result<(), HandsfreeError> {
        config
            .validate()
            .map_err(|e| HandsfreeError::InvalidConfig(e.to_string()))?;

        let mut guard = self.inner.core.lock();
        if guard.is_some() {
            tracing::debug!("Hands-free manager already initialised");
            return Ok(());
        }

        let runtime = Handle::try_current()
            .map_err(|e| HandsfreeError::ResourceFailure(format!("no tokio runtime: {e}")))?;

        let deps = &self.inner.deps;
        let gate = Arc::new(ReleaseGate::new(Duration::from_millis(
            config.recovery.min_restart_delay_ms,
        )));
        let devices = Arc::new(PermissionAndDeviceManager::new(
            deps.backend.clone(),
            deps.permissions.clone(),
            deps.preferences.clone(),
            gate,
            config.devices.clone(),
            config.audio.constraints.clone(),
        ));
        let vad = VoiceActivityDetector::new(config.vad.clone(), config.audio.realtime_processing);
        let bridge = SpeechBridge::new(deps.speech_engine.clone(), config.speech.clone());
        let retry = RetryState::new(&config.recovery);

        let (commands, receiver) = mpsc::unbounded_channel();
        runtime.spawn(drive(Arc::downgrade(&self.inner), receiver));

        *guard = Some(Core {
            config,
            runtime,
            commands,
            machine: HandsfreeStateMachine::new(),
            devices,
            vad,
            bridge,
            session: None,
            device: None,
            forwarder: None,
            watchdog: None,
            timers: Vec::new(),
            pauses: PauseReasons::default(),
            retry,
            last_error: None,
            generation: 0,
        });

        tracing::info!("Hands-free manager initialised");
        Ok(())
    }

    /// Start hands-free capture
    ///
    /// Prompts for permission if needed, selects a device, acquires it and
    /// starts listening. Resolves once capture is listening or has failed
    /// for good; transient failures are retried first. A no-op while
    /// capture is already active. From the error state this performs a full
    /// reinitialisation.
    pub async fn start_hands_free(&self) -> Result<(), HandsfreeError> {
        self.request(|reply| Command::Start { reply }).await
    }

    /// Tear everything down and warm up again
    pub async fn recover(&self) -> Result<(), HandsfreeError> {
        self.request(|reply| Command::Recover { reply }).await
    }

    async fn request(
        &self,
        command: impl FnOnce(oneshot::Sender<Result<(), HandsfreeError>>) -> Command,
    ) -> Result<(), HandsfreeError> {
        let commands = self
            .inner
            .core
            .lock()
            .as_ref()
            .map(|core| core.commands.clone())
            .ok_or(HandsfreeError::NotInitialized)?;

        let (reply, response) = oneshot::channel();
        commands
            .send(command(reply))
            .map_err(|_| HandsfreeError::ResourceFailure("driver task stopped".to_string()))?;
        response
            .await
            .map_err(|_| HandsfreeError::ResourceFailure("driver task stopped".to_string()))?
    }

    /// The app started speaking
    pub fn pause_for_tts(&self) {
        self.inner.set_pause(PauseKind::Tts, true);
    }

    /// The app stopped speaking
    pub fn resume_after_tts(&self) {
        self.inner.set_pause(PauseKind::Tts, false);
    }

    /// The app was shown or hidden
    pub fn set_app_visible(&self, visible: bool) {
        self.inner.set_pause(PauseKind::Hidden, !visible);
    }

    /// Stop everything and return to idle
    ///
    /// Releases the capture device, detaches the VAD, stops the speech
    /// bridge, aborts timers and cancels any warm-up in flight. Pause
    /// reasons are kept.
    pub fn shutdown(&self) {
        self.inner.with_core(|core, notes| {
            core.teardown();
            core.transition(HandsfreeEvent::Shutdown, notes);
            core.retry.reset();
            core.bridge.reset_restart_history();
            tracing::info!("Hands-free capture shut down");
        });
    }

    pub fn state(&self) -> HandsfreeState {
        self.inner
            .core
            .lock()
            .as_ref()
            .map(|core| core.machine.state())
            .unwrap_or_default()
    }

    /// Whether capture is listening or recording (paused does not count)
    pub fn is_listening(&self) -> bool {
        self.state().is_listening()
    }

    pub fn status(&self) -> HandsfreeStatus {
        match self.inner.core.lock().as_ref() {
            Some(core) => core.status(),
            None => HandsfreeStatus {
                initialized: false,
                state: HandsfreeState::Idle,
                description: HandsfreeState::Idle.description().to_string(),
                time_in_state_ms: 0,
                pauses: PauseReasons::default(),
                permission: PermissionState::Unknown,
                device: None,
                session_id: None,
                strategy: "none",
                speech_bridge: BridgeState::Stopped,
                level_db: crate::audio::metering::SILENCE_FLOOR_DB,
                last_error: None,
                retry_attempts: 0,
            },
        }
    }

    /// The most recent failure, surfaced or retried
    pub fn last_error(&self) -> Option<ErrorRecord> {
        self.inner
            .core
            .lock()
            .as_ref()
            .and_then(|core| core.last_error.clone())
    }

    /// Audio blocks leading up to (and including) the latest analysed block
    pub fn pre_roll_snapshot(&self) -> Vec<AudioBlock> {
        self.inner
            .core
            .lock()
            .as_ref()
            .map(|core| core.vad.pre_roll_snapshot())
            .unwrap_or_default()
    }

    pub fn set_observer(&self, observer: Arc<dyn HandsfreeObserver>) {
        *self.inner.observer.write() = Some(observer);
    }

    pub fn clear_observer(&self) {
        *self.inner.observer.write() = None;
    }
}

/// Driver task: runs until every manager handle is gone
async fn drive(inner: Weak<Inner>, mut commands: mpsc::UnboundedReceiver<Command>) {
    while let Some(command) = commands.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.handle(command).await;
    }
    tracing::debug!("Hands-free driver task exiting");
}

impl Inner {
    /// Run `f` under the core lock, then deliver what it queued
    fn with_core<R>(&self, f: impl FnOnce(&mut Core, &mut Notes) -> R) -> Option<R> {
        let mut notes = Notes::new();
        let result = {
            let mut guard = self.core.lock();
            guard.as_mut().map(|core| f(core, &mut notes))
        };
        self.dispatch(notes);
        result
    }

    fn dispatch(&self, notes: Notes) {
        if notes.is_empty() {
            return;
        }
        let observer = self.observer.read().clone();
        if let Some(observer) = observer {
            for note in &notes {
                deliver(observer.as_ref(), note);
            }
        }
    }

    fn ensure_current(&self, generation: u64) -> Result<(), HandsfreeError> {
        let current = self.core.lock().as_ref().map(|core| core.generation);
        if current == Some(generation) {
            Ok(())
        } else {
            Err(HandsfreeError::Cancelled)
        }
    }

    async fn handle(&self, command: Command) {
        match command {
            Command::Start { reply } => {
                let result = self.start().await;
                let _ = reply.send(result);
            }
            Command::Recover { reply } => {
                let result = self.recover().await;
                let _ = reply.send(result);
            }
            Command::Vad { generation, event } => self.on_vad_event(generation, event),
            Command::Speech {
                generation,
                session,
                event,
            } => {
                self.with_core(|core, notes| {
                    if core.generation == generation {
                        core.on_speech_event(session, event, notes);
                    }
                });
            }
            Command::RestartBridge { generation } => {
                self.with_core(|core, notes| {
                    if core.generation != generation
                        || !core.machine.state().is_listening()
                        || core.pauses.any()
                    {
                        return;
                    }
                    let sink = core.speech_sink();
                    let device_id = core.session_device();
                    if let Err(e) = core.bridge.restart(device_id, sink) {
                        core.fault(e, notes);
                    }
                });
            }
            Command::Retry { generation } => {
                let next = self
                    .with_core(|core, notes| {
                        if core.generation != generation
                            || core.machine.state() != HandsfreeState::Error
                        {
                            return None;
                        }
                        core.transition(HandsfreeEvent::RecoveryComplete, notes);
                        core.transition(HandsfreeEvent::Start, notes);
                        Some(core.generation)
                    })
                    .flatten();
                if let Some(generation) = next {
                    if let Err(e) = self.run_start_loop(generation).await {
                        tracing::debug!("Automatic recovery ended: {}", e);
                    }
                }
            }
            Command::WatchdogTick { generation } => {
                self.with_core(|core, notes| {
                    if core.generation != generation {
                        return;
                    }
                    match &core.session {
                        Some(session) if !session.is_live() => {
                            tracing::warn!("Capture track ended underneath us");
                            core.fault(
                                HandsfreeError::ResourceFailure("capture track ended".to_string()),
                                notes,
                            );
                        }
                        Some(_) => core.retry.mark_stable(),
                        None => {}
                    }
                });
            }
        }
    }

    async fn start(&self) -> Result<(), HandsfreeError> {
        let generation = self
            .with_core(|core, notes| {
                let state = core.machine.state();
                if state.is_active() {
                    tracing::debug!("Hands-free capture already active ({:?})", state);
                    return None;
                }
                if state == HandsfreeState::Error {
                    core.transition(HandsfreeEvent::RecoveryComplete, notes);
                }
                core.retry.reset();
                core.bridge.reset_restart_history();
                core.transition(HandsfreeEvent::Start, notes);
                Some(core.generation)
            })
            .ok_or(HandsfreeError::NotInitialized)?;

        match generation {
            Some(generation) => self.run_start_loop(generation).await,
            None => Ok(()),
        }
    }

    async fn recover(&self) -> Result<(), HandsfreeError> {
        let generation = self
            .with_core(|core, notes| {
                tracing::info!("Recovering hands-free capture from {:?}", core.machine.state());
                core.teardown();
                match core.machine.state() {
                    HandsfreeState::Idle => {}
                    HandsfreeState::Error => {
                        core.transition(HandsfreeEvent::RecoveryComplete, notes);
                    }
                    _ => {
                        core.transition(HandsfreeEvent::Shutdown, notes);
                    }
                }
                core.retry.reset();
                core.bridge.reset_restart_history();
                core.transition(HandsfreeEvent::Start, notes);
                core.generation
            })
            .ok_or(HandsfreeError::NotInitialized)?;

        self.run_start_loop(generation).await
    }

    /// Warm up, retrying transient failures, until listening or given up
    async fn run_start_loop(&self, mut generation: u64) -> Result<(), HandsfreeError> {
        loop {
            let error = match self.warm_up(generation).await {
                Ok(()) => return Ok(()),
                Err(e) => e,
            };

            let next = self
                .with_core(|core, notes| {
                    if core.generation != generation || error == HandsfreeError::Cancelled {
                        tracing::debug!("Warm-up cancelled");
                        return Err(HandsfreeError::Cancelled);
                    }

                    core.teardown();
                    let (record, decision) = core.retry.decide(error.clone());
                    core.last_error = Some(record);
                    match decision {
                        RecoveryDecision::Retry { attempt, delay } => {
                            tracing::warn!(
                                "Warm-up failed ({}); retry {}/{} in {:?}",
                                error,
                                attempt,
                                core.config.recovery.max_retries,
                                delay
                            );
                            Ok((core.generation, delay))
                        }
                        RecoveryDecision::Surface => {
                            tracing::error!("Warm-up failed: {}", error);
                            core.transition(
                                HandsfreeEvent::WarmupFailed {
                                    message: error.to_string(),
                                },
                                notes,
                            );
                            notes.push(HandsfreeNotification::Error(error.clone()));
                            Err(error.clone())
                        }
                    }
                })
                .unwrap_or(Err(HandsfreeError::NotInitialized));

            let (next_generation, delay) = next?;
            tokio::time::sleep(delay).await;
            self.ensure_current(next_generation)?;
            generation = next_generation;
        }
    }

    /// One warm-up attempt: permission, device selection, acquisition
    async fn warm_up(&self, generation: u64) -> Result<(), HandsfreeError> {
        let devices = self
            .with_core(|core, _| (core.generation == generation).then(|| core.devices.clone()))
            .flatten()
            .ok_or(HandsfreeError::Cancelled)?;

        match devices.request_permission().await {
            PermissionState::Granted => {}
            PermissionState::Unknown => {
                tracing::debug!("Microphone permission unknown; trying capture anyway")
            }
            state => {
                tracing::error!("Microphone permission {}; not acquiring", state);
                return Err(HandsfreeError::PermissionDenied);
            }
        }
        self.ensure_current(generation)?;

        let device = devices.select_best_device().await?;
        self.ensure_current(generation)?;

        let session = devices.acquire(Some(device.device_id.as_str())).await?;

        self.with_core(move |core, notes| {
            if core.generation != generation {
                session.release();
                return Err(HandsfreeError::Cancelled);
            }
            core.attach(session, device, notes)
        })
        .unwrap_or(Err(HandsfreeError::NotInitialized))
    }

    fn on_vad_event(&self, generation: u64, event: VadEvent) {
        let barge_in = self
            .with_core(|core, notes| {
                if core.generation != generation {
                    return false;
                }
                core.on_vad_event(event, notes)
            })
            .unwrap_or(false);

        if !barge_in {
            return;
        }

        // The observer has already seen voice-start; cut playback before
        // recognition comes back
        if self.deps.speech_output.is_speaking() {
            self.deps.speech_output.stop_playback();
        } else {
            tracing::debug!("Barge-in with no playback to stop");
        }

        self.with_core(|core, notes| {
            if core.generation == generation
                && core.machine.state().is_listening()
                && !core.pauses.any()
            {
                if let Err(e) = core.start_bridge() {
                    core.fault(e, notes);
                }
            }
        });
    }

    fn set_pause(&self, kind: PauseKind, paused: bool) {
        let applied = self.with_core(|core, notes| {
            let was_paused = core.pauses.any();
            match kind {
                PauseKind::Tts => core.pauses.tts = paused,
                PauseKind::Hidden => core.pauses.hidden = paused,
            }
            let now_paused = core.pauses.any();
            tracing::debug!("Pause {:?} -> {} ({:?})", kind, paused, core.pauses);

            let state = core.machine.state();
            if !was_paused && now_paused && state.is_listening() {
                core.bridge.stop();
                core.transition(HandsfreeEvent::Pause, notes);
            } else if was_paused && !now_paused && state == HandsfreeState::PausedByTts {
                core.transition(HandsfreeEvent::Resume, notes);
                if let Err(e) = core.start_bridge() {
                    core.fault(e, notes);
                }
            }
        });

        if applied.is_none() {
            tracing::debug!("Pause signal before init ignored");
        }
    }
}

impl Core {
    fn transition(&mut self, event: HandsfreeEvent, notes: &mut Notes) {
        let attempted = format!("{event:?}");
        match self.machine.process_event(event) {
            Some(result) => {
                tracing::info!(
                    "Hands-free: {:?} -> {:?} ({:?})",
                    result.previous_state,
                    result.new_state,
                    result.reason
                );
                notes.push(HandsfreeNotification::StateChange(StateChange {
                    previous_state: result.previous_state,
                    new_state: result.new_state,
                    description: result.new_state.description().to_string(),
                    reason: result.reason,
                }));
            }
            None => {
                tracing::debug!(
                    "Ignoring {} in state {:?}",
                    attempted,
                    self.machine.state()
                );
            }
        }
    }

    /// Install a freshly acquired session and start listening
    fn attach(
        &mut self,
        mut session: CaptureSession,
        device: DeviceRecord,
        notes: &mut Notes,
    ) -> Result<(), HandsfreeError> {
        let events = self.vad.start(session.stream_mut())?;

        let forwarder = match spawn_forwarder(events, self.commands.clone(), self.generation) {
            Ok(handle) => handle,
            Err(e) => {
                self.vad.stop(session.stream_mut());
                return Err(HandsfreeError::ResourceFailure(format!(
                    "failed to spawn VAD event thread: {e}"
                )));
            }
        };

        tracing::info!(
            "Capturing from '{}' ({}), VAD {} strategy",
            device.label,
            device.device_id,
            self.vad.strategy_name()
        );
        self.session = Some(session);
        self.device = Some(device);
        self.forwarder = Some(forwarder);

        if !self.pauses.any() {
            if let Err(e) = self.start_bridge() {
                self.bridge.stop();
                self.release_capture();
                return Err(e);
            }
        }

        self.transition(HandsfreeEvent::WarmupSucceeded, notes);
        if self.pauses.any() {
            self.transition(HandsfreeEvent::Pause, notes);
        }
        self.start_watchdog();
        Ok(())
    }

    /// Returns true when the event was a barge-in
    fn on_vad_event(&mut self, event: VadEvent, notes: &mut Notes) -> bool {
        match event {
            VadEvent::Level(level) => {
                notes.push(HandsfreeNotification::Level(level));
                false
            }
            VadEvent::VoiceStart {
                timestamp_ms,
                level_db,
            } => match self.machine.state() {
                HandsfreeState::Listening => {
                    self.transition(HandsfreeEvent::VoiceStart, notes);
                    notes.push(HandsfreeNotification::VoiceStart {
                        timestamp_ms,
                        level_db,
                    });
                    false
                }
                HandsfreeState::PausedByTts if self.pauses.tts && !self.pauses.hidden => {
                    tracing::info!("Barge-in at {}ms ({:.1} dB)", timestamp_ms, level_db);
                    self.pauses.tts = false;
                    self.transition(HandsfreeEvent::BargeIn, notes);
                    notes.push(HandsfreeNotification::VoiceStart {
                        timestamp_ms,
                        level_db,
                    });
                    notes.push(HandsfreeNotification::BargeIn);
                    true
                }
                state => {
                    tracing::debug!("Voice start ignored in {:?}", state);
                    false
                }
            },
            VadEvent::VoiceEnd {
                timestamp_ms,
                duration_ms,
            } => {
                if self.machine.state() == HandsfreeState::Recording {
                    self.transition(HandsfreeEvent::VoiceEnd, notes);
                    notes.push(HandsfreeNotification::VoiceEnd {
                        timestamp_ms,
                        duration_ms,
                    });
                }
                false
            }
        }
    }

    fn on_speech_event(&mut self, session: u64, event: SpeechEvent, notes: &mut Notes) {
        let may_restart = self.machine.state().is_listening() && !self.pauses.any();
        match self
            .bridge
            .handle_event(session, event, may_restart, Instant::now())
        {
            BridgeOutcome::Transcript { text, is_final } => {
                notes.push(HandsfreeNotification::Transcript { text, is_final });
            }
            BridgeOutcome::RestartAfter(delay) => {
                let generation = self.generation;
                self.schedule(delay, Command::RestartBridge { generation });
            }
            BridgeOutcome::Failed(error) => self.fault(error, notes),
            BridgeOutcome::SessionStarted => tracing::debug!("Speech session {} live", session),
            BridgeOutcome::Ended | BridgeOutcome::Ignored => {}
        }
    }

    /// Runtime failure: tear down, enter error, maybe schedule a retry
    fn fault(&mut self, error: HandsfreeError, notes: &mut Notes) {
        tracing::error!("Hands-free capture failed: {}", error);
        self.teardown();
        self.transition(
            HandsfreeEvent::Fault {
                message: error.to_string(),
            },
            notes,
        );

        let (record, decision) = self.retry.decide(error.clone());
        self.last_error = Some(record);
        match decision {
            RecoveryDecision::Retry { attempt, delay } => {
                tracing::warn!(
                    "Reinitialising in {:?} (retry {}/{})",
                    delay,
                    attempt,
                    self.config.recovery.max_retries
                );
                let generation = self.generation;
                self.schedule(delay, Command::Retry { generation });
            }
            RecoveryDecision::Surface => notes.push(HandsfreeNotification::Error(error)),
        }
    }

    fn speech_sink(&self) -> impl FnOnce(u64) -> SpeechEventSink {
        let generation = self.generation;
        let commands = self.commands.clone();
        move |session| {
            let sink: SpeechEventSink = Arc::new(move |event: SpeechEvent| {
                let _ = commands.send(Command::Speech {
                    generation,
                    session,
                    event,
                });
            });
            sink
        }
    }

    fn session_device(&self) -> Option<String> {
        self.session
            .as_ref()
            .and_then(|session| session.device_id().map(str::to_string))
    }

    fn start_bridge(&mut self) -> Result<(), HandsfreeError> {
        let sink = self.speech_sink();
        let device_id = self.session_device();
        self.bridge.start(device_id, sink)
    }

    fn start_watchdog(&mut self) {
        if let Some(previous) = self.watchdog.take() {
            previous.abort();
        }
        let generation = self.generation;
        let commands = self.commands.clone();
        let period = Duration::from_millis(self.config.recovery.watchdog_interval_ms);
        self.watchdog = Some(self.runtime.spawn(async move {
            let mut interval = tokio::time::interval(period);
            // The first tick completes immediately
            interval.tick().await;
            loop {
                interval.tick().await;
                if commands.send(Command::WatchdogTick { generation }).is_err() {
                    break;
                }
            }
        }));
    }

    fn schedule(&mut self, delay: Duration, command: Command) {
        self.timers.retain(|timer| !timer.is_finished());
        let commands = self.commands.clone();
        self.timers.push(self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = commands.send(command);
        }));
    }

    /// Detach the VAD and release the device
    fn release_capture(&mut self) {
        if let Some(mut session) = self.session.take() {
            self.vad.stop(session.stream_mut());
            session.release();
        }
        if let Some(forwarder) = self.forwarder.take() {
            // Ends once the tap (and its sender) is gone
            let _ = forwarder.join();
        }
        self.device = None;
    }

    /// Release every resource and invalidate outstanding work
    fn teardown(&mut self) {
        self.generation += 1;
        for timer in self.timers.drain(..) {
            timer.abort();
        }
        if let Some(watchdog) = self.watchdog.take() {
            watchdog.abort();
        }
        self.bridge.stop();
        self.release_capture();
    }

    fn status(&self) -> HandsfreeStatus {
        let state = self.machine.state();
        HandsfreeStatus {
            initialized: true,
            state,
            description: state.description().to_string(),
            time_in_state_ms: self.machine.time_in_state().as_millis() as u64,
            pauses: self.pauses,
            permission: self.devices.last_permission(),
            device: self.device.clone(),
            session_id: self.session.as_ref().map(CaptureSession::id),
            strategy: self.vad.strategy_name(),
            speech_bridge: self.bridge.state(),
            level_db: self.vad.level(),
            last_error: self.last_error.clone(),
            retry_attempts: self.retry.attempts(),
        }
    }
}

impl Drop for Core {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Move VAD events from the capture side onto the driver's queue
fn spawn_forwarder(
    events: VadEventReceiver,
    commands: mpsc::UnboundedSender<Command>,
    generation: u64,
) -> std::io::Result<std::thread::JoinHandle<()>> {
    std::thread::Builder::new()
        .name("parley-vad-events".to_string())
        .spawn(move || {
            for event in events.iter() {
                if commands.send(Command::Vad { generation, event }).is_err() {
                    break;
                }
            }
        })
}
