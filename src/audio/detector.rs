//! Voice activity detector bound to a capture stream
//!
//! Owns the analyser and the processing strategy, never the stream. The
//! orchestrator hands a stream to [`VoiceActivityDetector::start`] and gives
//! the same stream back to [`VoiceActivityDetector::stop`].

use super::capture::CaptureStream;
use super::metering::SILENCE_FLOOR_DB;
use super::pre_roll::AudioBlock;
use super::strategy::{
    BlockPipeline, LevelCell, PollingStrategy, ProcessingStrategy, RealtimeStrategy,
};
use super::vad::{VadAnalyzer, VadConfig, VadError, VadEvent};
use crossbeam_channel::{bounded, Receiver};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// VAD event receiver for the orchestrator
pub type VadEventReceiver = Receiver<VadEvent>;

/// Event channel depth; roughly eight seconds of level telemetry at 32ms blocks
const EVENT_CHANNEL_CAPACITY: usize = 256;

pub struct VoiceActivityDetector {
    analyzer: Arc<Mutex<VadAnalyzer>>,
    level: Arc<LevelCell>,
    skipped: Arc<AtomicU64>,
    strategy: Box<dyn ProcessingStrategy>,
    fallback: Option<Box<dyn ProcessingStrategy>>,
    attached: bool,
}

impl VoiceActivityDetector {
    /// Create a detector
    ///
    /// With `prefer_realtime`, attachment first tries in-callback analysis and
    /// keeps the polling strategy as a fallback.
    pub fn new(config: VadConfig, prefer_realtime: bool) -> Self {
        let (strategy, fallback): (Box<dyn ProcessingStrategy>, Option<Box<dyn ProcessingStrategy>>) =
            if prefer_realtime {
                (
                    Box::new(RealtimeStrategy::default()),
                    Some(Box::new(PollingStrategy::default())),
                )
            } else {
                (Box::new(PollingStrategy::default()), None)
            };

        Self::with_strategies(config, strategy, fallback)
    }

    /// Create a detector with explicit strategies
    pub fn with_strategies(
        config: VadConfig,
        strategy: Box<dyn ProcessingStrategy>,
        fallback: Option<Box<dyn ProcessingStrategy>>,
    ) -> Self {
        Self {
            analyzer: Arc::new(Mutex::new(VadAnalyzer::new(config))),
            level: Arc::new(LevelCell::new(SILENCE_FLOOR_DB)),
            skipped: Arc::new(AtomicU64::new(0)),
            strategy,
            fallback,
            attached: false,
        }
    }

    /// Name of the strategy the next (or current) attachment uses
    pub fn strategy_name(&self) -> &'static str {
        self.strategy.name()
    }

    /// Attach to `stream` and return the event receiver for this attachment
    ///
    /// A primary strategy that fails to attach is replaced by the fallback
    /// for the lifetime of this detector.
    pub fn start(&mut self, stream: &mut dyn CaptureStream) -> Result<VadEventReceiver, VadError> {
        if self.attached {
            return Err(VadError::AlreadyAttached);
        }

        self.analyzer.lock().prepare(stream.sample_rate());
        self.level.set(SILENCE_FLOOR_DB);
        self.skipped.store(0, Ordering::Relaxed);
        let (tx, rx) = bounded(EVENT_CHANNEL_CAPACITY);
        let pipeline = BlockPipeline::new(
            self.analyzer.clone(),
            tx,
            self.level.clone(),
            self.skipped.clone(),
            stream.sample_rate(),
        );

        let primary_error = match self.strategy.attach(stream, pipeline.clone()) {
            Ok(()) => {
                self.attached = true;
                tracing::info!(
                    "VAD attached ({} strategy, {}Hz)",
                    self.strategy.name(),
                    stream.sample_rate()
                );
                return Ok(rx);
            }
            Err(e) => e,
        };

        let Some(fallback) = self.fallback.take() else {
            return Err(VadError::AttachFailed(primary_error.to_string()));
        };

        tracing::warn!(
            "VAD {} strategy failed ({}); switching to {} strategy",
            self.strategy.name(),
            primary_error,
            fallback.name()
        );
        self.strategy = fallback;

        match self.strategy.attach(stream, pipeline) {
            Ok(()) => {
                self.attached = true;
                tracing::info!("VAD attached ({} strategy)", self.strategy.name());
                Ok(rx)
            }
            Err(fallback_error) => Err(VadError::AttachFailed(format!(
                "{primary_error}; {fallback_error}"
            ))),
        }
    }

    /// Detach from `stream`, reset the level to the floor, clear the pre-roll
    pub fn stop(&mut self, stream: &mut dyn CaptureStream) {
        if self.attached {
            self.strategy.detach(stream);
            self.attached = false;
            let skipped = self.skipped_blocks();
            if skipped > 0 {
                tracing::warn!("VAD skipped {} blocks while its state was busy", skipped);
            }
            tracing::debug!("VAD detached");
        }
        self.analyzer.lock().reset();
        self.level.set(SILENCE_FLOOR_DB);
    }

    /// Current smoothed level in dBFS
    pub fn level(&self) -> f32 {
        self.level.get()
    }

    /// Blocks the audio thread could not analyse during this attachment
    pub fn skipped_blocks(&self) -> u64 {
        self.skipped.load(Ordering::Relaxed)
    }

    /// Audio preceding (and including) the most recent blocks, oldest first
    pub fn pre_roll_snapshot(&self) -> Vec<AudioBlock> {
        self.analyzer.lock().pre_roll_snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeStream;
    use std::time::Duration;

    fn config() -> VadConfig {
        VadConfig {
            smoothing_factor: 0.0,
            ..VadConfig::default()
        }
    }

    fn collect_transitions(rx: &VadEventReceiver) -> Vec<VadEvent> {
        rx.try_iter()
            .filter(|e| !matches!(e, VadEvent::Level(_)))
            .collect()
    }

    #[test]
    fn test_realtime_attach_processes_in_callback() {
        let mut stream = FakeStream::new("mic", 16_000, true);
        let mut vad = VoiceActivityDetector::new(config(), true);
        let rx = vad.start(&mut stream).unwrap();
        assert_eq!(vad.strategy_name(), "realtime");

        stream.feed(&[0.2; 512]);
        let events = collect_transitions(&rx);
        assert!(matches!(events[0], VadEvent::VoiceStart { .. }));
        assert_eq!(vad.pre_roll_snapshot().len(), 1);

        vad.stop(&mut stream);
        assert!(!stream.has_tap());
    }

    #[test]
    fn test_level_events_per_block() {
        let mut stream = FakeStream::new("mic", 16_000, true);
        let mut vad = VoiceActivityDetector::new(config(), true);
        let rx = vad.start(&mut stream).unwrap();

        // 2.5 blocks worth of samples yields exactly two level readings
        stream.feed(&[0.0; 1_280]);
        let levels = rx
            .try_iter()
            .filter(|e| matches!(e, VadEvent::Level(_)))
            .count();
        assert_eq!(levels, 2);
        vad.stop(&mut stream);
    }

    #[test]
    fn test_downgrades_to_polling_permanently() {
        let mut stream = FakeStream::new("mic", 16_000, false);
        let mut vad = VoiceActivityDetector::new(config(), true);
        let rx = vad.start(&mut stream).unwrap();
        assert_eq!(vad.strategy_name(), "polling");

        stream.feed(&[0.2; 512]);
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        let mut started = false;
        while !started && std::time::Instant::now() < deadline {
            if let Ok(event) = rx.recv_timeout(Duration::from_millis(50)) {
                started = matches!(event, VadEvent::VoiceStart { .. });
            }
        }
        assert!(started);
        vad.stop(&mut stream);

        // A realtime-capable stream still gets the polling strategy now
        let mut realtime = FakeStream::new("mic", 16_000, true);
        vad.start(&mut realtime).unwrap();
        assert_eq!(vad.strategy_name(), "polling");
        vad.stop(&mut realtime);
    }

    #[test]
    fn test_attach_fails_when_both_strategies_fail() {
        let mut stream = FakeStream::new("mic", 16_000, false);
        stream.end();
        let mut vad = VoiceActivityDetector::new(config(), true);
        let result = vad.start(&mut stream);
        assert!(matches!(result, Err(VadError::AttachFailed(_))));
        assert!(!vad.attached);
    }

    #[test]
    fn test_double_start_rejected() {
        let mut stream = FakeStream::new("mic", 16_000, true);
        let mut vad = VoiceActivityDetector::new(config(), true);
        vad.start(&mut stream).unwrap();
        assert!(matches!(
            vad.start(&mut stream),
            Err(VadError::AlreadyAttached)
        ));
        vad.stop(&mut stream);
    }

    #[test]
    fn test_stop_resets_level_and_pre_roll() {
        let mut stream = FakeStream::new("mic", 16_000, true);
        let mut vad = VoiceActivityDetector::new(config(), true);
        vad.start(&mut stream).unwrap();
        stream.feed(&[0.3; 2_048]);
        assert!(vad.level() > SILENCE_FLOOR_DB);

        vad.stop(&mut stream);
        assert_eq!(vad.level(), SILENCE_FLOOR_DB);
        assert!(vad.pre_roll_snapshot().is_empty());
    }

    #[test]
    fn test_realtime_block_skipped_while_state_busy() {
        let mut stream = FakeStream::new("mic", 16_000, true);
        let mut vad = VoiceActivityDetector::new(config(), true);
        let rx = vad.start(&mut stream).unwrap();

        {
            let _busy = vad.analyzer.lock();
            stream.feed(&[0.2; 512]);
            // The level stays readable while the analyser is held
            assert_eq!(vad.level(), SILENCE_FLOOR_DB);
        }
        assert_eq!(vad.skipped_blocks(), 1);
        assert_eq!(rx.try_iter().count(), 0);

        stream.feed(&[0.2; 512]);
        assert_eq!(vad.skipped_blocks(), 1);
        assert!(vad.level() > SILENCE_FLOOR_DB);
        assert!(collect_transitions(&rx)
            .iter()
            .any(|e| matches!(e, VadEvent::VoiceStart { .. })));
        vad.stop(&mut stream);
    }
}
