//! Per-channel buffering of captured audio for `Read` requests.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use hark_core::{ChannelCount, HarkError, Result};
use parking_lot::{Condvar, Mutex};
use tracing::debug;

const MAX_READ_CHANNELS: usize = 4;

/// Split interleaved PCM of `sample_bytes`-wide samples into one byte buffer
/// per channel.
///
/// A trailing partial frame is dropped.
pub fn deinterleave(pcm: &[u8], channels: u8, sample_bytes: usize) -> Vec<Vec<u8>> {
    let channels = usize::from(channels.max(1));
    let sample_bytes = sample_bytes.max(1);
    let stride = channels * sample_bytes;
    let frames = pcm.len() / stride;
    let mut out = vec![Vec::with_capacity(frames * sample_bytes); channels];
    for frame in pcm.chunks_exact(stride) {
        for (ch, sample) in frame.chunks_exact(sample_bytes).enumerate() {
            out[ch].extend_from_slice(sample);
        }
    }
    out
}

struct Queues {
    channels: u8,
    queues: Vec<VecDeque<Vec<u8>>>,
}

/// Frame queues filled from the capture thread and drained by `Read`.
pub struct SourceBuffer {
    inner: Mutex<Queues>,
    ready: Condvar,
    max_frames: usize,
}

impl SourceBuffer {
    pub fn new(max_frames: usize) -> Self {
        Self {
            inner: Mutex::new(Queues {
                channels: 0,
                queues: Vec::new(),
            }),
            ready: Condvar::new(),
            max_frames: max_frames.max(1),
        }
    }

    /// Reset to empty queues for `channels` capture channels.
    pub fn init(&self, channels: ChannelCount) {
        let mut inner = self.inner.lock();
        inner.channels = channels.get();
        inner.queues = (0..MAX_READ_CHANNELS).map(|_| VecDeque::new()).collect();
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.queues.iter_mut().for_each(VecDeque::clear);
    }

    /// Queue one deinterleaved buffer.
    ///
    /// Mono capture fills channel 0. Four-channel capture fills channels
    /// 1..=3; channel 0 is the wakeup channel fed to the adapter. The oldest
    /// frame is dropped when a queue is full.
    pub fn write(&self, frames: &[Vec<u8>]) -> Result<()> {
        let mut inner = self.inner.lock();
        let targets = match inner.channels {
            1 => 0..1,
            4 => 1..4,
            0 => return Err(HarkError::Capture("source buffer not initialized".into())),
            n => {
                return Err(HarkError::Capture(format!(
                    "unsupported capture channel count {n}"
                )))
            }
        };
        if frames.len() < targets.end {
            return Err(HarkError::Capture(format!(
                "expected {} channels, got {}",
                targets.end,
                frames.len()
            )));
        }
        for ch in targets {
            let queue = &mut inner.queues[ch];
            if queue.len() >= self.max_frames {
                queue.pop_front();
                debug!(channel = ch, "Source queue full, dropped oldest frame");
            }
            queue.push_back(frames[ch].clone());
        }
        drop(inner);
        self.ready.notify_all();
        Ok(())
    }

    /// Pop one frame from every channel selected in `mask` (bit i = channel
    /// i) and concatenate them in channel order, waiting up to `wait` per
    /// frame.
    pub fn read(&self, mask: u8, wait: Duration) -> Result<Vec<u8>> {
        if mask == 0 || usize::from(mask) >= 1 << MAX_READ_CHANNELS {
            return Err(HarkError::InvalidArgument(format!("invalid channel mask {mask:#x}")));
        }
        let mut out = Vec::new();
        let mut inner = self.inner.lock();
        if inner.queues.is_empty() {
            return Err(HarkError::Capture("source buffer not initialized".into()));
        }
        for ch in (0..MAX_READ_CHANNELS).filter(|ch| mask & (1 << ch) != 0) {
            let deadline = Instant::now() + wait;
            loop {
                if let Some(frame) = inner.queues[ch].pop_front() {
                    out.extend_from_slice(&frame);
                    break;
                }
                if self.ready.wait_until(&mut inner, deadline).timed_out()
                    && inner.queues[ch].is_empty()
                {
                    return Err(HarkError::Capture(format!(
                        "no audio on channel {ch} within {}ms",
                        wait.as_millis()
                    )));
                }
            }
        }
        Ok(out)
    }

    pub fn queued(&self, channel: usize) -> usize {
        self.inner
            .lock()
            .queues
            .get(channel)
            .map(VecDeque::len)
            .unwrap_or(0)
    }
}

// =============================================================================
// Tests
// =============================================================================
