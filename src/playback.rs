//! Speech output (text-to-speech) collaboration
//!
//! The playback engine is external. It tells the orchestrator when it starts
//! and stops talking via `pause_for_tts` / `resume_after_tts`, and the
//! orchestrator cuts it off through this trait when the user barges in.

/// Text-to-speech playback
pub trait SpeechOutput: Send + Sync {
    /// Whether a prompt is currently playing
    fn is_speaking(&self) -> bool;

    /// Stop the current prompt immediately
    fn stop_playback(&self);
}

/// Placeholder when no playback engine is attached
#[derive(Debug, Default, Clone, Copy)]
pub struct SilentOutput;

impl SpeechOutput for SilentOutput {
    fn is_speaking(&self) -> bool {
        false
    }

    fn stop_playback(&self) {}
}
