//! Hardware wake adapter interface.
//!
//! The adapter performs the actual keyword spotting; the engine only drives
//! it through attach/start/stop and feeds it captured audio. Asynchronous
//! results arrive through the installed [`AdapterCallback`], typically on a
//! thread owned by the adapter.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use hark_core::{EngineKind, HarkError, Result};
use parking_lot::Mutex;

/// Capture configuration handed to the adapter on attach.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterInfo {
    pub wakeup_phrase: String,
    pub min_buffer_size: u32,
    pub channels: u8,
    pub bits_per_sample: u16,
    pub sample_rate: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StartInfo {
    pub is_last: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterEventKind {
    InitDone,
    RecognizeComplete,
}

/// An asynchronous adapter notification: `(message id, result code, info)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterEvent {
    pub kind: AdapterEventKind,
    pub result: i32,
    pub info: String,
}

impl AdapterEvent {
    pub fn init_done(result: i32) -> Self {
        Self {
            kind: AdapterEventKind::InitDone,
            result,
            info: String::new(),
        }
    }

    pub fn recognize_complete(result: i32, info: impl Into<String>) -> Self {
        Self {
            kind: AdapterEventKind::RecognizeComplete,
            result,
            info: info.into(),
        }
    }
}

pub type AdapterCallback = Arc<dyn Fn(AdapterEvent) + Send + Sync>;

/// One attached hardware adapter.
pub trait WakeAdapter: Send + Sync {
    fn set_callback(&self, callback: AdapterCallback);
    fn attach(&self, info: &AdapterInfo) -> Result<()>;
    fn detach(&self) -> Result<()>;
    fn start(&self, info: &StartInfo) -> Result<()>;
    fn stop(&self) -> Result<()>;
    fn write_audio(&self, pcm: &[u8]) -> Result<()>;
    /// `kv` is a `key=value` pair.
    fn set_parameter(&self, kv: &str) -> Result<()>;
    fn get_parameter(&self, key: &str) -> Result<String>;
    /// PCM the adapter recognized the wake phrase in.
    fn get_wakeup_pcm(&self) -> Result<Vec<u8>>;
    /// Score how well `word` suits as a wake phrase.
    fn evaluate(&self, word: &str) -> Result<i32>;
}

/// Creates adapters per engine profile.
pub trait AdapterHost: Send + Sync {
    fn create_adapter(&self, kind: EngineKind) -> Result<Arc<dyn WakeAdapter>>;
    fn release_adapter(&self, kind: EngineKind);
}

// =============================================================================
// Mock adapter
// =============================================================================

/// In-process adapter that records calls and fires events on demand.
///
/// By default `attach` immediately reports `InitDone(0)` through the
/// callback, like a fast adapter would.
pub struct MockAdapter {
    callback: Mutex<Option<AdapterCallback>>,
    init_done_result: Mutex<Option<i32>>,
    params: Mutex<Vec<String>>,
    written: Mutex<Vec<u8>>,
    wakeup_pcm: Mutex<Vec<u8>>,
    pub attach_calls: AtomicUsize,
    pub detach_calls: AtomicUsize,
    pub start_calls: AtomicUsize,
    pub stop_calls: AtomicUsize,
    pub fail_attach: AtomicBool,
    pub fail_start: AtomicBool,
}

impl Default for MockAdapter {
    fn default() -> Self {
        Self {
            callback: Mutex::new(None),
            init_done_result: Mutex::new(Some(0)),
            params: Mutex::new(Vec::new()),
            written: Mutex::new(Vec::new()),
            wakeup_pcm: Mutex::new(Vec::new()),
            attach_calls: AtomicUsize::new(0),
            detach_calls: AtomicUsize::new(0),
            start_calls: AtomicUsize::new(0),
            stop_calls: AtomicUsize::new(0),
            fail_attach: AtomicBool::new(false),
            fail_start: AtomicBool::new(false),
        }
    }
}

impl MockAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Result reported as `InitDone` after attach, or `None` to stay silent.
    pub fn set_init_done_result(&self, result: Option<i32>) {
        *self.init_done_result.lock() = result;
    }

    pub fn set_wakeup_pcm(&self, pcm: Vec<u8>) {
        *self.wakeup_pcm.lock() = pcm;
    }

    /// Deliver `event` through the installed callback, as the adapter would.
    pub fn fire(&self, event: AdapterEvent) -> bool {
        let callback = self.callback.lock().clone();
        match callback {
            Some(callback) => {
                callback(event);
                true
            }
            None => false,
        }
    }

    pub fn params(&self) -> Vec<String> {
        self.params.lock().clone()
    }

    pub fn written(&self) -> Vec<u8> {
        self.written.lock().clone()
    }

    pub fn count(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

impl WakeAdapter for MockAdapter {
    fn set_callback(&self, callback: AdapterCallback) {
        *self.callback.lock() = Some(callback);
    }

    fn attach(&self, _info: &AdapterInfo) -> Result<()> {
        self.attach_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_attach.load(Ordering::SeqCst) {
            return Err(HarkError::Adapter("attach refused".into()));
        }
        let init_done = *self.init_done_result.lock();
        if let Some(result) = init_done {
            self.fire(AdapterEvent::init_done(result));
        }
        Ok(())
    }

    fn detach(&self) -> Result<()> {
        self.detach_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn start(&self, _info: &StartInfo) -> Result<()> {
        self.start_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(HarkError::Adapter("start refused".into()));
        }
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn write_audio(&self, pcm: &[u8]) -> Result<()> {
        self.written.lock().extend_from_slice(pcm);
        Ok(())
    }

    fn set_parameter(&self, kv: &str) -> Result<()> {
        if !kv.contains('=') {
            return Err(HarkError::InvalidArgument(format!("malformed parameter {kv}")));
        }
        self.params.lock().push(kv.to_string());
        Ok(())
    }

    fn get_parameter(&self, key: &str) -> Result<String> {
        let params = self.params.lock();
        params
            .iter()
            .rev()
            .find_map(|kv| {
                kv.split_once('=')
                    .filter(|(k, _)| *k == key)
                    .map(|(_, v)| v.to_string())
            })
            .ok_or_else(|| HarkError::Adapter(format!("unknown parameter {key}")))
    }

    fn get_wakeup_pcm(&self) -> Result<Vec<u8>> {
        Ok(self.wakeup_pcm.lock().clone())
    }

    fn evaluate(&self, word: &str) -> Result<i32> {
        if word.trim().is_empty() {
            return Err(HarkError::InvalidArgument("empty wake phrase".into()));
        }
        Ok(word.chars().filter(|c| !c.is_whitespace()).count().min(100) as i32)
    }
}

/// Host handing out one [`MockAdapter`] per profile.
#[derive(Default)]
pub struct MockAdapterHost {
    adapters: Mutex<HashMap<EngineKind, Arc<MockAdapter>>>,
    pub create_calls: AtomicUsize,
    pub release_calls: AtomicUsize,
    pub fail_create: AtomicBool,
}

impl MockAdapterHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// The adapter for `kind`, created on first use.
    pub fn adapter(&self, kind: EngineKind) -> Arc<MockAdapter> {
        Arc::clone(
            self.adapters
                .lock()
                .entry(kind)
                .or_insert_with(|| Arc::new(MockAdapter::new())),
        )
    }
}

impl AdapterHost for MockAdapterHost {
    fn create_adapter(&self, kind: EngineKind) -> Result<Arc<dyn WakeAdapter>> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(HarkError::Adapter(format!("no {kind} adapter available")));
        }
        let adapter: Arc<dyn WakeAdapter> = self.adapter(kind);
        Ok(adapter)
    }

    fn release_adapter(&self, _kind: EngineKind) {
        self.release_calls.fetch_add(1, Ordering::SeqCst);
    }
}

// =============================================================================
// Tests
// =============================================================================
