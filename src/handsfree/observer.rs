//! Observer callbacks for hands-free notifications
//!
//! The manager collects notifications while it holds its lock and delivers
//! them after releasing it, so observers may call back into the manager.

use super::state::{HandsfreeState, TransitionReason};
use crate::audio::metering::LevelSample;
use crate::error::HandsfreeError;
use crossbeam_channel::{unbounded, Receiver, Sender};
use serde::Serialize;

/// Event payload for state changes
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StateChange {
    /// The previous state
    pub previous_state: HandsfreeState,
    /// The new state
    pub new_state: HandsfreeState,
    /// Reason for the transition
    pub reason: TransitionReason,
    /// State description for UI display
    pub description: String,
}

/// Receives hands-free notifications
///
/// Every method has an empty default so implementors only override what
/// they use. Calls arrive on the manager's driver task (or the thread that
/// called `shutdown` / `pause_for_tts`) and should return quickly.
pub trait HandsfreeObserver: Send + Sync {
    fn on_state_change(&self, _change: &StateChange) {}
    fn on_voice_start(&self, _timestamp_ms: u64, _level_db: f32) {}
    fn on_voice_end(&self, _timestamp_ms: u64, _duration_ms: u64) {}
    fn on_transcript(&self, _text: &str, _is_final: bool) {}
    fn on_error(&self, _error: &HandsfreeError) {}
    fn on_rms_update(&self, _level: &LevelSample) {}
    fn on_barge_in(&self) {}
}

/// One observer notification, as delivered over a channel
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HandsfreeNotification {
    StateChange(StateChange),
    VoiceStart { timestamp_ms: u64, level_db: f32 },
    VoiceEnd { timestamp_ms: u64, duration_ms: u64 },
    Transcript { text: String, is_final: bool },
    Error(HandsfreeError),
    Level(LevelSample),
    BargeIn,
}

/// Call the observer method matching a queued notification
pub(crate) fn deliver(observer: &dyn HandsfreeObserver, notification: &HandsfreeNotification) {
    match notification {
        HandsfreeNotification::StateChange(change) => observer.on_state_change(change),
        HandsfreeNotification::VoiceStart {
            timestamp_ms,
            level_db,
        } => observer.on_voice_start(*timestamp_ms, *level_db),
        HandsfreeNotification::VoiceEnd {
            timestamp_ms,
            duration_ms,
        } => observer.on_voice_end(*timestamp_ms, *duration_ms),
        HandsfreeNotification::Transcript { text, is_final } => {
            observer.on_transcript(text, *is_final)
        }
        HandsfreeNotification::Error(error) => observer.on_error(error),
        HandsfreeNotification::Level(level) => observer.on_rms_update(level),
        HandsfreeNotification::BargeIn => observer.on_barge_in(),
    }
}

/// Observer that forwards every notification into a channel
pub struct ChannelObserver {
    sender: Sender<HandsfreeNotification>,
    forward_levels: bool,
}

impl ChannelObserver {
    /// Create the observer and its receiving end
    ///
    /// Level telemetry arrives every block; pass `forward_levels = false` to
    /// keep it out of the channel.
    pub fn new(forward_levels: bool) -> (Self, Receiver<HandsfreeNotification>) {
        let (sender, receiver) = unbounded();
        (
            Self {
                sender,
                forward_levels,
            },
            receiver,
        )
    }

    fn forward(&self, notification: HandsfreeNotification) {
        // A dropped receiver just means nobody is listening any more
        let _ = self.sender.send(notification);
    }
}

impl HandsfreeObserver for ChannelObserver {
    fn on_state_change(&self, change: &StateChange) {
        self.forward(HandsfreeNotification::StateChange(change.clone()));
    }

    fn on_voice_start(&self, timestamp_ms: u64, level_db: f32) {
        self.forward(HandsfreeNotification::VoiceStart {
            timestamp_ms,
            level_db,
        });
    }

    fn on_voice_end(&self, timestamp_ms: u64, duration_ms: u64) {
        self.forward(HandsfreeNotification::VoiceEnd {
            timestamp_ms,
            duration_ms,
        });
    }

    fn on_transcript(&self, text: &str, is_final: bool) {
        self.forward(HandsfreeNotification::Transcript {
            text: text.to_string(),
            is_final,
        });
    }

    fn on_error(&self, error: &HandsfreeError) {
        self.forward(HandsfreeNotification::Error(error.clone()));
    }

    fn on_rms_update(&self, level: &LevelSample) {
        if self.forward_levels {
            self.forward(HandsfreeNotification::Level(*level));
        }
    }

    fn on_barge_in(&self) {
        self.forward(HandsfreeNotification::BargeIn);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_observer_forwards() {
        let (observer, rx) = ChannelObserver::new(false);
        observer.on_voice_start(64, -30.0);
        observer.on_rms_update(&LevelSample {
            db: -30.0,
            rms: 0.03,
            timestamp_ms: 64,
        });
        observer.on_error(&HandsfreeError::NoDevice);
        observer.on_barge_in();

        let received: Vec<_> = rx.try_iter().collect();
        assert_eq!(
            received,
            vec![
                HandsfreeNotification::VoiceStart {
                    timestamp_ms: 64,
                    level_db: -30.0
                },
                HandsfreeNotification::Error(HandsfreeError::NoDevice),
                HandsfreeNotification::BargeIn,
            ]
        );
    }

    #[test]
    fn test_deliver_routes_to_matching_method() {
        let (observer, rx) = ChannelObserver::new(true);
        deliver(
            &observer,
            &HandsfreeNotification::Transcript {
                text: "bonjour".into(),
                is_final: false,
            },
        );
        deliver(
            &observer,
            &HandsfreeNotification::Error(HandsfreeError::DeviceBusy("held".into())),
        );
        let received: Vec<_> = rx.try_iter().collect();
        assert_eq!(received.len(), 2);
        assert!(matches!(
            &received[1],
            HandsfreeNotification::Error(HandsfreeError::DeviceBusy(_))
        ));
    }

    #[test]
    fn test_dropped_receiver_is_harmless() {
        let (observer, rx) = ChannelObserver::new(true);
        drop(rx);
        observer.on_barge_in();
    }
}
