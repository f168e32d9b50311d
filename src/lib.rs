//! Parley: hands-free voice capture for conversational practice
//!
//! The crate keeps a microphone open, detects when the user speaks, keeps a
//! speech recognition session running alongside, and pauses recognition
//! while the app itself talks. [`handsfree::HandsfreeManager`] is the entry
//! point; everything platform-facing sits behind a trait so the orchestrator
//! can be driven entirely by fakes in tests.

pub mod audio;
pub mod config;
pub mod devices;
pub mod error;
pub mod handsfree;
pub mod logging;
pub mod platform;
pub mod playback;
pub mod preferences;
pub mod transcription;

#[cfg(test)]
mod testing;

pub use error::HandsfreeError;
pub use handsfree::{HandsfreeDependencies, HandsfreeManager};
