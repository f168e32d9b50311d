//! How VAD analysis is driven from a capture stream
//!
//! The realtime strategy analyses blocks inside the capture callback. The
//! polling strategy only copies samples into a ring buffer from the callback
//! and leaves analysis to a worker thread that drains it once per block
//! interval.

use super::capture::CaptureStream;
use super::ring_buffer::SampleRingBuffer;
use super::vad::{BlockAnalysis, VadAnalyzer, VadError, VadEvent};
use crossbeam_channel::Sender;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Audio the polling ring buffer can hold before the worker falls behind
const POLLING_BUFFER_MS: u32 = 2_000;

/// Latest smoothed level, readable without touching the analyser lock
#[derive(Debug)]
pub struct LevelCell(AtomicU32);

impl LevelCell {
    pub fn new(db: f32) -> Self {
        Self(AtomicU32::new(db.to_bits()))
    }

    pub fn get(&self) -> f32 {
        f32::from_bits(self.0.load(Ordering::Relaxed))
    }

    pub fn set(&self, db: f32) {
        self.0.store(db.to_bits(), Ordering::Relaxed);
    }
}

/// Shared analysis state plus the event channel for one attachment
#[derive(Clone)]
pub struct BlockPipeline {
    analyzer: Arc<Mutex<VadAnalyzer>>,
    events: Sender<VadEvent>,
    level: Arc<LevelCell>,
    skipped: Arc<AtomicU64>,
    sample_rate: u32,
    block_size: usize,
    block_duration_ms: u32,
}

impl BlockPipeline {
    pub fn new(
        analyzer: Arc<Mutex<VadAnalyzer>>,
        events: Sender<VadEvent>,
        level: Arc<LevelCell>,
        skipped: Arc<AtomicU64>,
        sample_rate: u32,
    ) -> Self {
        let (block_size, block_duration_ms) = {
            let analyzer = analyzer.lock();
            let config = analyzer.config();
            (config.block_size(sample_rate), config.block_duration_ms)
        };
        Self {
            analyzer,
            events,
            level,
            skipped,
            sample_rate,
            block_size,
            block_duration_ms,
        }
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Analyse one complete block and emit its events
    ///
    /// Waits for the analyser; only for threads that may block.
    pub fn process(&self, block: &[f32]) {
        let analysis = self.analyzer.lock().process_block(block, self.sample_rate);
        self.emit(analysis);
    }

    /// Analyse one block from the audio thread
    ///
    /// The block is skipped (and counted) if the control side holds the
    /// analyser at that moment.
    pub fn try_process(&self, block: &[f32]) -> bool {
        let Some(mut analyzer) = self.analyzer.try_lock() else {
            self.skipped.fetch_add(1, Ordering::Relaxed);
            return false;
        };
        let analysis = analyzer.process_block(block, self.sample_rate);
        drop(analyzer);
        self.emit(analysis);
        true
    }

    /// Events are dropped rather than blocking when the receiver lags
    fn emit(&self, analysis: BlockAnalysis) {
        self.level.set(analysis.level.db);
        let _ = self.events.try_send(VadEvent::Level(analysis.level));
        if let Some(transition) = analysis.transition {
            let _ = self.events.try_send(transition);
        }
    }
}

/// Re-chunks arbitrary callback buffers into fixed-size blocks
///
/// The internal buffer is allocated once, so pushing never allocates.
pub struct BlockAssembler {
    pending: Vec<f32>,
    block_size: usize,
}

impl BlockAssembler {
    pub fn new(block_size: usize) -> Self {
        let block_size = block_size.max(1);
        Self {
            pending: Vec::with_capacity(block_size),
            block_size,
        }
    }

    /// Append samples, calling `on_block` for every completed block
    pub fn push(&mut self, mut samples: &[f32], mut on_block: impl FnMut(&[f32])) {
        while !samples.is_empty() {
            let take = (self.block_size - self.pending.len()).min(samples.len());
            self.pending.extend_from_slice(&samples[..take]);
            samples = &samples[take..];
            if self.pending.len() == self.block_size {
                on_block(&self.pending);
                self.pending.clear();
            }
        }
    }
}

/// A way of feeding stream audio to the analyser
pub trait ProcessingStrategy: Send {
    /// Short name for logs
    fn name(&self) -> &'static str;

    /// Install on `stream`; must leave the stream untouched on failure
    fn attach(
        &mut self,
        stream: &mut dyn CaptureStream,
        pipeline: BlockPipeline,
    ) -> Result<(), VadError>;

    /// Remove from `stream` and stop any helper threads; idempotent
    fn detach(&mut self, stream: &mut dyn CaptureStream);
}

/// Per-block analysis inside the capture callback
#[derive(Default)]
pub struct RealtimeStrategy {
    attached: bool,
}

impl ProcessingStrategy for RealtimeStrategy {
    fn name(&self) -> &'static str {
        "realtime"
    }

    fn attach(
        &mut self,
        stream: &mut dyn CaptureStream,
        pipeline: BlockPipeline,
    ) -> Result<(), VadError> {
        if !stream.supports_realtime_tap() {
            return Err(VadError::StrategyUnavailable {
                strategy: self.name(),
                reason: "stream does not allow analysis in its callback".to_string(),
            });
        }

        let mut assembler = BlockAssembler::new(pipeline.block_size());
        stream
            .set_tap(Some(Box::new(move |samples: &[f32]| {
                assembler.push(samples, |block| {
                    pipeline.try_process(block);
                });
            })))
            .map_err(|e| VadError::StrategyUnavailable {
                strategy: "realtime",
                reason: e.to_string(),
            })?;

        self.attached = true;
        Ok(())
    }

    fn detach(&mut self, stream: &mut dyn CaptureStream) {
        if std::mem::take(&mut self.attached) {
            let _ = stream.set_tap(None);
        }
    }
}

/// Ring buffer filled by the callback, drained by a worker thread
#[derive(Default)]
pub struct PollingStrategy {
    worker: Option<JoinHandle<()>>,
    stop_signal: Arc<AtomicBool>,
}

impl ProcessingStrategy for PollingStrategy {
    fn name(&self) -> &'static str {
        "polling"
    }

    fn attach(
        &mut self,
        stream: &mut dyn CaptureStream,
        pipeline: BlockPipeline,
    ) -> Result<(), VadError> {
        let ring = Arc::new(SampleRingBuffer::for_duration(
            stream.sample_rate(),
            POLLING_BUFFER_MS,
        ));

        let producer = ring.clone();
        stream
            .set_tap(Some(Box::new(move |samples: &[f32]| {
                producer.write(samples);
            })))
            .map_err(|e| VadError::StrategyUnavailable {
                strategy: "polling",
                reason: e.to_string(),
            })?;

        let stop_signal = Arc::new(AtomicBool::new(false));
        let worker_stop = stop_signal.clone();
        let interval = Duration::from_millis(pipeline.block_duration_ms.max(1) as u64);

        let spawned = std::thread::Builder::new()
            .name("parley-vad-poll".to_string())
            .spawn(move || drain_ring(ring, pipeline, worker_stop, interval));

        match spawned {
            Ok(handle) => {
                self.worker = Some(handle);
                self.stop_signal = stop_signal;
                Ok(())
            }
            Err(e) => {
                let _ = stream.set_tap(None);
                Err(VadError::StrategyUnavailable {
                    strategy: "polling",
                    reason: format!("failed to spawn worker: {e}"),
                })
            }
        }
    }

    fn detach(&mut self, stream: &mut dyn CaptureStream) {
        let _ = stream.set_tap(None);
        self.stop_signal.store(true, Ordering::SeqCst);
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for PollingStrategy {
    fn drop(&mut self) {
        self.stop_signal.store(true, Ordering::SeqCst);
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }
}

/// Worker loop for the polling strategy
fn drain_ring(
    ring: Arc<SampleRingBuffer>,
    pipeline: BlockPipeline,
    stop_signal: Arc<AtomicBool>,
    interval: Duration,
) {
    let mut read_buffer = vec![0.0f32; pipeline.block_size() * 4];
    let mut assembler = BlockAssembler::new(pipeline.block_size());

    while !stop_signal.load(Ordering::SeqCst) {
        while ring.available() > 0 {
            let read = ring.read(&mut read_buffer);
            assembler.push(&read_buffer[..read], |block| pipeline.process(block));
        }
        std::thread::sleep(interval);
    }

    if ring.dropped() > 0 {
        tracing::warn!(
            "Polling VAD worker fell behind; {} samples dropped",
            ring.dropped()
        );
    }
    tracing::debug!("Polling VAD worker exiting");
}
