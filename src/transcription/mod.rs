//! Speech-to-text collaboration
//!
//! The recognition engine itself lives outside this crate. It is driven
//! through [`SpeechEngine`] and reports back through a [`SpeechEventSink`];
//! [`bridge::SpeechBridge`] keeps an engine session alive while the
//! orchestrator is listening.

pub mod bridge;

pub use bridge::{BridgeOutcome, BridgeState, SpeechBridge};

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;

/// Parameters for one recognition session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpeechRequest {
    /// Device of the live capture session; engines must not open another
    pub device_id: Option<String>,
    pub language: String,
    pub interim_results: bool,
}

/// Why an engine session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionEndReason {
    /// The engine finished on its own (end of utterance, session limit)
    Completed,
    /// Nothing was said before the engine's own timeout
    NoSpeech,
    /// Interrupted by the platform
    Aborted,
    /// Ended because `stop` was called
    Requested,
}

/// Notification from a speech engine
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SpeechEvent {
    SessionStart,
    SessionEnd { reason: SessionEndReason },
    Error { code: String },
    Result { text: String, is_final: bool },
}

/// Receiver for engine notifications; may be called from any thread
pub type SpeechEventSink = Arc<dyn Fn(SpeechEvent) + Send + Sync>;

/// Speech engine errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SpeechError {
    #[error("Speech recognition permission denied")]
    PermissionDenied,

    #[error("Speech engine could not capture audio: {0}")]
    AudioCapture(String),

    #[error("Speech engine network failure: {0}")]
    Network(String),

    #[error("Speech engine unavailable: {0}")]
    Unavailable(String),

    #[error("Speech engine error: {0}")]
    Other(String),
}

/// How the bridge should treat an engine error code
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorDisposition {
    /// Routine; the session end that follows triggers a restart
    Benign,
    /// Stops the bridge and propagates to the orchestrator
    Fatal(SpeechError),
}

/// Classify an engine error code
pub fn classify_error_code(code: &str) -> ErrorDisposition {
    match code {
        "no-speech" | "aborted" => ErrorDisposition::Benign,
        "not-allowed" | "service-not-allowed" => {
            ErrorDisposition::Fatal(SpeechError::PermissionDenied)
        }
        "audio-capture" => ErrorDisposition::Fatal(SpeechError::AudioCapture(code.to_string())),
        "network" => ErrorDisposition::Fatal(SpeechError::Network(code.to_string())),
        "language-not-supported" | "bad-grammar" => {
            ErrorDisposition::Fatal(SpeechError::Unavailable(code.to_string()))
        }
        other => ErrorDisposition::Fatal(SpeechError::Other(other.to_string())),
    }
}

/// Platform speech recognition
pub trait SpeechEngine: Send + Sync {
    /// Begin a session; events flow to `sink` until the session ends
    fn start(&self, request: SpeechRequest, sink: SpeechEventSink) -> Result<(), SpeechError>;

    /// End the current session, if any
    fn stop(&self);
}

/// Engine that recognises nothing
///
/// Sessions open and stay open until stopped. Used by the CLI, which has no
/// recogniser of its own.
#[derive(Default)]
pub struct NoopSpeechEngine {
    sink: Mutex<Option<SpeechEventSink>>,
}

impl SpeechEngine for NoopSpeechEngine {
    fn start(&self, request: SpeechRequest, sink: SpeechEventSink) -> Result<(), SpeechError> {
        tracing::debug!(
            "Speech session requested (language={}, device={:?})",
            request.language,
            request.device_id
        );
        sink(SpeechEvent::SessionStart);
        *self.sink.lock() = Some(sink);
        Ok(())
    }

    fn stop(&self) {
        let sink = self.sink.lock().take();
        if let Some(sink) = sink {
            sink(SpeechEvent::SessionEnd {
                reason: SessionEndReason::Requested,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_benign_codes() {
        assert_eq!(classify_error_code("no-speech"), ErrorDisposition::Benign);
        assert_eq!(classify_error_code("aborted"), ErrorDisposition::Benign);
    }

    #[test]
    fn test_fatal_codes() {
        assert_eq!(
            classify_error_code("not-allowed"),
            ErrorDisposition::Fatal(SpeechError::PermissionDenied)
        );
        assert!(matches!(
            classify_error_code("network"),
            ErrorDisposition::Fatal(SpeechError::Network(_))
        ));
        assert!(matches!(
            classify_error_code("audio-capture"),
            ErrorDisposition::Fatal(SpeechError::AudioCapture(_))
        ));
        assert!(matches!(
            classify_error_code("something-new"),
            ErrorDisposition::Fatal(SpeechError::Other(_))
        ));
    }

    #[test]
    fn test_noop_engine_reports_session_lifecycle() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let recorded = events.clone();
        let sink: SpeechEventSink = Arc::new(move |e| recorded.lock().push(e));

        let engine = NoopSpeechEngine::default();
        engine
            .start(
                SpeechRequest {
                    device_id: None,
                    language: "en-US".to_string(),
                    interim_results: true,
                },
                sink,
            )
            .unwrap();
        engine.stop();
        engine.stop();

        assert_eq!(
            *events.lock(),
            vec![
                SpeechEvent::SessionStart,
                SpeechEvent::SessionEnd {
                    reason: SessionEndReason::Requested
                }
            ]
        );
    }
}
