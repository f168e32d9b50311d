//! Hands-free capture state machine
//!
//! Defines the lifecycle states and the only transitions allowed between
//! them. The machine is pure: side effects belong to the manager, which asks
//! the machine first and acts only when a transition is returned.

use serde::{Deserialize, Serialize};
use std::time::Instant;

/// Hands-free lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum HandsfreeState {
    /// Not capturing
    #[default]
    Idle,
    /// Checking permission, selecting a device and opening capture
    WarmingUp,
    /// Capturing; waiting for the user to speak
    Listening,
    /// Capturing an utterance
    Recording,
    /// Capturing, with speech recognition suspended while the app talks
    /// or is hidden
    PausedByTts,
    /// Stopped after a failure
    Error,
}

impl HandsfreeState {
    /// Returns a human-readable description of the state
    pub fn description(&self) -> &'static str {
        match self {
            HandsfreeState::Idle => "Hands-free capture off",
            HandsfreeState::WarmingUp => "Preparing microphone",
            HandsfreeState::Listening => "Listening for speech",
            HandsfreeState::Recording => "Hearing speech",
            HandsfreeState::PausedByTts => "Paused while the app speaks",
            HandsfreeState::Error => "Hands-free capture stopped after an error",
        }
    }

    /// Whether `start_hands_free` has nothing to do in this state
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            HandsfreeState::WarmingUp
                | HandsfreeState::Listening
                | HandsfreeState::Recording
                | HandsfreeState::PausedByTts
        )
    }

    /// Whether speech recognition should be running in this state
    pub fn is_listening(&self) -> bool {
        matches!(self, HandsfreeState::Listening | HandsfreeState::Recording)
    }
}

/// Events that can trigger state transitions
#[derive(Debug, Clone, PartialEq)]
pub enum HandsfreeEvent {
    /// `start_hands_free` (or an automatic retry) began warm-up
    Start,
    /// Permission, device and capture are all ready
    WarmupSucceeded,
    /// Warm-up gave up
    WarmupFailed { message: String },
    /// VAD heard the user start speaking
    VoiceStart,
    /// VAD heard the user stop speaking
    VoiceEnd,
    /// Playback started or the app was hidden
    Pause,
    /// Every pause reason cleared
    Resume,
    /// The user spoke over playback
    BargeIn,
    /// Runtime failure of capture, processing or recognition
    Fault { message: String },
    /// Full teardown finished after an error
    RecoveryComplete,
    /// `shutdown` from any non-idle state
    Shutdown,
}

/// Reason for entering a state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransitionReason {
    /// Hands-free capture requested
    Activation,
    /// Warm-up completed
    CaptureReady,
    /// VAD detected voice activity
    VoiceActivity,
    /// VAD detected end of speech
    EndOfSpeech,
    /// Playback or visibility pause
    Paused,
    /// Pause lifted
    Resumed,
    /// User interrupted playback
    BargeIn,
    /// A failure stopped capture
    Error { message: String },
    /// Reinitialisation after an error
    Recovered,
    /// Shutdown requested
    Shutdown,
}

/// Result of a state transition
#[derive(Debug, Clone, PartialEq)]
pub struct TransitionResult {
    /// State before the transition
    pub previous_state: HandsfreeState,
    /// The new state after the transition
    pub new_state: HandsfreeState,
    /// Reason for the transition
    pub reason: TransitionReason,
}

/// Hands-free state machine
///
/// Thread-safe operations are handled externally by the HandsfreeManager.
#[derive(Debug)]
pub struct HandsfreeStateMachine {
    state: HandsfreeState,
    state_entered_at: Instant,
}

impl HandsfreeStateMachine {
    /// Creates a new state machine in the Idle state
    pub fn new() -> Self {
        Self {
            state: HandsfreeState::Idle,
            state_entered_at: Instant::now(),
        }
    }

    /// Returns the current state
    pub fn state(&self) -> HandsfreeState {
        self.state
    }

    /// Returns how long the machine has been in the current state
    pub fn time_in_state(&self) -> std::time::Duration {
        self.state_entered_at.elapsed()
    }

    /// Process an event and return the transition result if a transition occurred
    ///
    /// Returns `None` if the event is not valid for the current state; the
    /// state is left unchanged.
    pub fn process_event(&mut self, event: HandsfreeEvent) -> Option<TransitionResult> {
        use HandsfreeEvent as E;
        use HandsfreeState as S;

        let (new_state, reason) = match (self.state, event) {
            (S::Idle, E::Start) => (S::WarmingUp, TransitionReason::Activation),

            (S::WarmingUp, E::WarmupSucceeded) => (S::Listening, TransitionReason::CaptureReady),
            (S::WarmingUp, E::WarmupFailed { message }) => {
                (S::Error, TransitionReason::Error { message })
            }

            (S::Listening, E::VoiceStart) => (S::Recording, TransitionReason::VoiceActivity),
            (S::Recording, E::VoiceEnd) => (S::Listening, TransitionReason::EndOfSpeech),

            (S::Listening | S::Recording, E::Pause) => (S::PausedByTts, TransitionReason::Paused),
            (S::PausedByTts, E::Resume) => (S::Listening, TransitionReason::Resumed),
            (S::PausedByTts, E::BargeIn) => (S::Listening, TransitionReason::BargeIn),

            (S::WarmingUp | S::Listening | S::Recording | S::PausedByTts, E::Fault { message }) => {
                (S::Error, TransitionReason::Error { message })
            }
            (S::Error, E::RecoveryComplete) => (S::Idle, TransitionReason::Recovered),

            (state, E::Shutdown) if state != S::Idle => (S::Idle, TransitionReason::Shutdown),

            _ => return None,
        };

        let result = TransitionResult {
            previous_state: self.state,
            new_state,
            reason,
        };
        self.state = new_state;
        self.state_entered_at = Instant::now();
        Some(result)
    }
}

impl Default for HandsfreeStateMachine {
    fn default() -> Self {
        Self::new()
    }
}
