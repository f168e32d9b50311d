//! Lock-free sample ring buffer for the polling VAD path
//!
//! The capture callback writes mono samples; the polling worker drains them.
//! Storage is allocated once when the buffer is created so the callback never
//! allocates.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// A single-producer single-consumer ring buffer of `f32` samples
pub struct SampleRingBuffer {
    buffer: UnsafeCell<Box<[f32]>>,
    capacity: usize,
    write_pos: AtomicUsize,
    read_pos: AtomicUsize,
    /// Samples the producer could not store because the consumer fell behind
    dropped: AtomicU64,
}

// Safety: SPSC. The producer only touches indices between write_pos and
// read_pos-1, the consumer only between read_pos and write_pos-1, and the
// positions are published with acquire/release ordering.
unsafe impl Send for SampleRingBuffer {}
unsafe impl Sync for SampleRingBuffer {}

impl SampleRingBuffer {
    /// Create a buffer holding up to `capacity - 1` samples
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(2);
        Self {
            buffer: UnsafeCell::new(vec![0.0; capacity].into_boxed_slice()),
            capacity,
            write_pos: AtomicUsize::new(0),
            read_pos: AtomicUsize::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Size a buffer to hold `millis` of audio at `sample_rate`
    pub fn for_duration(sample_rate: u32, millis: u32) -> Self {
        let samples = (sample_rate as u64 * millis as u64 / 1000) as usize;
        Self::new(samples + 1)
    }

    /// Number of samples waiting to be read
    pub fn available(&self) -> usize {
        let write = self.write_pos.load(Ordering::Acquire);
        let read = self.read_pos.load(Ordering::Acquire);
        if write >= read {
            write - read
        } else {
            self.capacity - read + write
        }
    }

    /// Total samples dropped on overflow since creation
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Write samples (producer side, real-time safe)
    ///
    /// Returns how many samples were stored; the rest are counted as dropped.
    pub fn write(&self, samples: &[f32]) -> usize {
        let write = self.write_pos.load(Ordering::Acquire);
        let read = self.read_pos.load(Ordering::Acquire);

        let free = if write >= read {
            self.capacity - (write - read) - 1
        } else {
            read - write - 1
        };

        let to_write = samples.len().min(free);
        if to_write < samples.len() {
            self.dropped
                .fetch_add((samples.len() - to_write) as u64, Ordering::Relaxed);
        }
        if to_write == 0 {
            return 0;
        }

        let buffer_ptr = self.buffer.get();
        for (i, &sample) in samples.iter().enumerate().take(to_write) {
            // Safety: SPSC, these slots are not visible to the consumer yet
            unsafe {
                (*buffer_ptr)[(write + i) % self.capacity] = sample;
            }
        }

        self.write_pos
            .store((write + to_write) % self.capacity, Ordering::Release);
        to_write
    }

    /// Read samples into `output` (consumer side)
    pub fn read(&self, output: &mut [f32]) -> usize {
        let write = self.write_pos.load(Ordering::Acquire);
        let read = self.read_pos.load(Ordering::Acquire);

        let available = if write >= read {
            write - read
        } else {
            self.capacity - read + write
        };

        let to_read = output.len().min(available);
        if to_read == 0 {
            return 0;
        }

        let buffer_ptr = self.buffer.get();
        for (i, sample) in output.iter_mut().enumerate().take(to_read) {
            // Safety: SPSC, the producer has published these slots
            *sample = unsafe { (*buffer_ptr)[(read + i) % self.capacity] };
        }

        self.read_pos
            .store((read + to_read) % self.capacity, Ordering::Release);
        to_read
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_write_read() {
        let buffer = SampleRingBuffer::new(16);
        let samples = [1.0, 2.0, 3.0, 4.0, 5.0];
        assert_eq!(buffer.write(&samples), 5);
        assert_eq!(buffer.available(), 5);

        let mut output = [0.0; 5];
        assert_eq!(buffer.read(&mut output), 5);
        assert_eq!(output, samples);
        assert_eq!(buffer.available(), 0);
    }

    #[test]
    fn test_for_duration_sizing() {
        let buffer = SampleRingBuffer::for_duration(16_000, 500);
        assert_eq!(buffer.capacity, 8_001);
    }

    #[test]
    fn test_overflow_counts_dropped() {
        let buffer = SampleRingBuffer::new(8);
        let written = buffer.write(&[0.5; 10]);
        assert_eq!(written, 7);
        assert_eq!(buffer.dropped(), 3);
    }

    #[test]
    fn test_wraparound_preserves_order() {
        let buffer = SampleRingBuffer::new(8);
        buffer.write(&[1.0, 2.0, 3.0, 4.0, 5.0]);
        let mut out = [0.0; 4];
        buffer.read(&mut out);
        buffer.write(&[6.0, 7.0, 8.0, 9.0]);

        let mut rest = [0.0; 5];
        assert_eq!(buffer.read(&mut rest), 5);
        assert_eq!(rest, [5.0, 6.0, 7.0, 8.0, 9.0]);
    }

    #[test]
    fn test_concurrent_producer_consumer() {
        let buffer = Arc::new(SampleRingBuffer::new(1024));
        let producer = buffer.clone();
        let consumer = buffer.clone();

        const NUM_SAMPLES: usize = 50_000;

        let producer_handle = thread::spawn(move || {
            let mut total_written = 0;
            while total_written < NUM_SAMPLES {
                let written = producer.write(&[0.25; 64]);
                total_written += written;
                if written < 64 {
                    thread::yield_now();
                }
            }
            total_written
        });

        let consumer_handle = thread::spawn(move || {
            let mut total_read = 0;
            let mut output = vec![0.0; 128];
            while total_read < NUM_SAMPLES {
                let read = consumer.read(&mut output);
                assert!(output[..read].iter().all(|&s| s == 0.25));
                total_read += read;
                if read == 0 {
                    thread::yield_now();
                }
            }
            total_read
        });

        assert!(producer_handle.join().unwrap() >= NUM_SAMPLES);
        assert!(consumer_handle.join().unwrap() >= NUM_SAMPLES);
    }
}
