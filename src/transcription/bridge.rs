//! Keeps a speech engine session running alongside capture
//!
//! Engines end sessions on their own all the time (silence timeouts, session
//! length limits). While the orchestrator is listening or recording, such a
//! benign end schedules a restart; permission and device errors stop the
//! bridge and propagate.

use super::{
    classify_error_code, ErrorDisposition, SessionEndReason, SpeechEngine, SpeechEvent,
    SpeechEventSink, SpeechRequest,
};
use crate::config::SpeechConfig;
use crate::error::HandsfreeError;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Bridge lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BridgeState {
    Stopped,
    Running,
    /// Benign end seen; waiting out the restart delay
    RestartPending,
    /// Stopped by a fatal engine error
    Failed,
}

/// What the orchestrator should do after an engine event
#[derive(Debug, Clone, PartialEq)]
pub enum BridgeOutcome {
    /// Stale or uninteresting
    Ignored,
    SessionStarted,
    Transcript { text: String, is_final: bool },
    /// Call [`SpeechBridge::restart`] after the delay
    RestartAfter(Duration),
    /// Session ended while restarts were not allowed
    Ended,
    Failed(HandsfreeError),
}

pub struct SpeechBridge {
    engine: Arc<dyn SpeechEngine>,
    config: SpeechConfig,
    state: BridgeState,
    /// Incremented on every start and stop so late events from an older
    /// session are recognisable
    session: u64,
    recent_ends: VecDeque<Instant>,
}

impl SpeechBridge {
    pub fn new(engine: Arc<dyn SpeechEngine>, config: SpeechConfig) -> Self {
        Self {
            engine,
            config,
            state: BridgeState::Stopped,
            session: 0,
            recent_ends: VecDeque::new(),
        }
    }

    pub fn state(&self) -> BridgeState {
        self.state
    }

    /// Current session number
    pub fn session(&self) -> u64 {
        self.session
    }

    /// Start a session on `device_id`; no-op while one is running
    ///
    /// `sink_for` builds the event sink for the new session number.
    pub fn start(
        &mut self,
        device_id: Option<String>,
        sink_for: impl FnOnce(u64) -> SpeechEventSink,
    ) -> Result<(), HandsfreeError> {
        if self.state == BridgeState::Running {
            return Ok(());
        }

        self.session += 1;
        let request = SpeechRequest {
            device_id,
            language: self.config.language.clone(),
            interim_results: self.config.interim_results,
        };

        match self.engine.start(request, sink_for(self.session)) {
            Ok(()) => {
                self.state = BridgeState::Running;
                tracing::debug!("Speech session {} started", self.session);
                Ok(())
            }
            Err(e) => {
                self.state = BridgeState::Failed;
                tracing::error!("Speech session failed to start: {}", e);
                Err(e.into())
            }
        }
    }

    /// Restart after a benign end; no-op unless a restart is pending
    pub fn restart(
        &mut self,
        device_id: Option<String>,
        sink_for: impl FnOnce(u64) -> SpeechEventSink,
    ) -> Result<(), HandsfreeError> {
        if self.state != BridgeState::RestartPending {
            return Ok(());
        }
        self.state = BridgeState::Stopped;
        self.start(device_id, sink_for)
    }

    /// Stop the engine and forget any pending restart
    pub fn stop(&mut self) {
        let was_running = self.state == BridgeState::Running;
        self.session += 1;
        self.state = BridgeState::Stopped;
        if was_running {
            self.engine.stop();
            tracing::debug!("Speech session stopped");
        }
    }

    /// Clear the rapid-restart history
    pub fn reset_restart_history(&mut self) {
        self.recent_ends.clear();
    }

    /// Fold an engine event into the bridge
    ///
    /// `may_restart` is whether the orchestrator is listening or recording
    /// and not paused.
    pub fn handle_event(
        &mut self,
        session: u64,
        event: SpeechEvent,
        may_restart: bool,
        now: Instant,
    ) -> BridgeOutcome {
        if session != self.session {
            return BridgeOutcome::Ignored;
        }

        match event {
            SpeechEvent::SessionStart => BridgeOutcome::SessionStarted,
            SpeechEvent::Result { text, is_final } => BridgeOutcome::Transcript { text, is_final },
            SpeechEvent::Error { code } => match classify_error_code(&code) {
                ErrorDisposition::Benign => {
                    tracing::debug!("Benign speech engine error: {}", code);
                    BridgeOutcome::Ignored
                }
                ErrorDisposition::Fatal(err) => {
                    tracing::error!("Speech engine error {}: {}", code, err);
                    self.stop();
                    self.state = BridgeState::Failed;
                    BridgeOutcome::Failed(err.into())
                }
            },
            SpeechEvent::SessionEnd { reason } => self.on_session_end(reason, may_restart, now),
        }
    }

    fn on_session_end(
        &mut self,
        reason: SessionEndReason,
        may_restart: bool,
        now: Instant,
    ) -> BridgeOutcome {
        if self.state != BridgeState::Running {
            return BridgeOutcome::Ignored;
        }
        self.state = BridgeState::Stopped;

        if !may_restart {
            tracing::debug!("Speech session ended ({:?}); not restarting", reason);
            return BridgeOutcome::Ended;
        }

        let window = Duration::from_millis(self.config.rapid_restart_window_ms);
        while self
            .recent_ends
            .front()
            .is_some_and(|at| now.duration_since(*at) > window)
        {
            self.recent_ends.pop_front();
        }
        self.recent_ends.push_back(now);

        if self.recent_ends.len() > self.config.max_rapid_restarts as usize {
            self.state = BridgeState::Failed;
            self.recent_ends.clear();
            tracing::warn!(
                "Speech sessions ended {} times within {:?}",
                self.config.max_rapid_restarts + 1,
                window
            );
            return BridgeOutcome::Failed(HandsfreeError::ResourceFailure(
                "speech sessions ending too quickly".to_string(),
            ));
        }

        self.state = BridgeState::RestartPending;
        tracing::debug!("Speech session ended ({:?}); restart scheduled", reason);
        BridgeOutcome::RestartAfter(Duration::from_millis(self.config.restart_delay_ms))
    }
}
