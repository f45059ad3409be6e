//! Audio capture source interface.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use hark_core::{HarkError, Result};
use parking_lot::Mutex;

/// Parameters for one capture session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureFormat {
    /// Bytes per delivered buffer, across all channels.
    pub buffer_size: u32,
    pub interval_ms: u32,
    pub sample_rate: u32,
    pub bits_per_sample: u16,
    pub channels: u8,
}

/// Receives interleaved PCM on the capture thread.
pub type BufferCallback = Arc<dyn Fn(&[u8]) + Send + Sync>;
/// Called once when the capture stream ends.
pub type EndCallback = Arc<dyn Fn() + Send + Sync>;

/// The platform microphone capture wrapper.
pub trait AudioCaptureSource: Send + Sync {
    fn start(&self, format: &CaptureFormat, on_buffer: BufferCallback, on_end: EndCallback) -> Result<()>;
    fn stop(&self);
    fn is_active(&self) -> bool;
}

/// Capture source driven by hand: [`push`](Self::push) delivers a buffer,
/// [`finish`](Self::finish) ends the stream.
#[derive(Default)]
pub struct MockCaptureSource {
    callbacks: Mutex<Option<(BufferCallback, EndCallback)>>,
    format: Mutex<Option<CaptureFormat>>,
    active: AtomicBool,
    pub start_calls: AtomicUsize,
    pub stop_calls: AtomicUsize,
    pub fail_start: AtomicBool,
}

impl MockCaptureSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver one buffer. Returns `false` when capture is not running.
    pub fn push(&self, pcm: &[u8]) -> bool {
        let on_buffer = self.callbacks.lock().as_ref().map(|(b, _)| Arc::clone(b));
        match on_buffer {
            Some(on_buffer) => {
                on_buffer(pcm);
                true
            }
            None => false,
        }
    }

    pub fn finish(&self) -> bool {
        let on_end = self.callbacks.lock().as_ref().map(|(_, e)| Arc::clone(e));
        match on_end {
            Some(on_end) => {
                on_end();
                true
            }
            None => false,
        }
    }

    pub fn last_format(&self) -> Option<CaptureFormat> {
        *self.format.lock()
    }

    pub fn starts(&self) -> usize {
        self.start_calls.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.stop_calls.load(Ordering::SeqCst)
    }
}

impl AudioCaptureSource for MockCaptureSource {
    fn start(&self, format: &CaptureFormat, on_buffer: BufferCallback, on_end: EndCallback) -> Result<()> {
        self.start_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(HarkError::Capture("microphone unavailable".into()));
        }
        if format.buffer_size == 0 {
            return Err(HarkError::Capture("zero-sized capture buffer".into()));
        }
        *self.format.lock() = Some(*format);
        *self.callbacks.lock() = Some((on_buffer, on_end));
        self.active.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&self) {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        self.callbacks.lock().take();
        self.active.store(false, Ordering::SeqCst);
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}
