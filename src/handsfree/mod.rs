//! Hands-free voice capture
//!
//! The user turns hands-free mode on once; from then on the microphone stays
//! open, the VAD decides when they are speaking, and a speech engine session
//! runs alongside. Playback of the app's own voice pauses recognition, and
//! speaking over it (barge-in) cuts the playback off.
//!
//! ## States
//!
//! ```text
//! ┌──────┐ start ┌────────────┐ ready ┌───────────┐ voice ┌───────────┐
//! │ IDLE │──────►│ WARMING-UP │──────►│ LISTENING │◄─────►│ RECORDING │
//! └──────┘       └────────────┘       └───────────┘ end   └───────────┘
//!    ▲                 │               ▲    │   pause         │
//!    │ recovered       │ failed        │    ▼                 │
//!    │           ┌─────┴─┐   resume /  ┌──────────────┐ pause │
//!    └───────────│ ERROR │   barge-in  │ PAUSED-BY-TTS│◄──────┘
//!                └───────┘◄── fault ───└──────────────┘
//! ```
//!
//! Any active state moves to ERROR on a runtime fault, and `shutdown` returns
//! every state to IDLE.

pub mod manager;
pub mod observer;
pub mod recovery;
pub mod state;

pub use manager::{HandsfreeDependencies, HandsfreeManager, HandsfreeStatus, PauseReasons};
pub use observer::{ChannelObserver, HandsfreeNotification, HandsfreeObserver, StateChange};
pub use recovery::{ErrorRecord, RecoveryDecision, RetryState};
pub use state::{
    HandsfreeEvent, HandsfreeState, HandsfreeStateMachine, TransitionReason, TransitionResult,
};
