//! Trigger connector module interface.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
use std::sync::Arc;

use hark_core::{HarkError, Result};
use parking_lot::Mutex;

use crate::model::{ModelHandle, TriggerModel};

/// Called by the connector when a loaded model detects its phrase. Must be
/// invoked from the connector's own thread, never from inside a connector
/// call.
pub type ConnectorCallback = Arc<dyn Fn(ModelHandle) + Send + Sync>;

/// One adapter's model module. Failures surface as
/// [`HarkError::Connector`] carrying the module's native code.
pub trait TriggerConnector: Send + Sync {
    fn set_callback(&self, callback: ConnectorCallback);
    fn load_model(&self, model: &TriggerModel) -> Result<ModelHandle>;
    fn unload_model(&self, handle: ModelHandle) -> Result<()>;
    fn start(&self, handle: ModelHandle) -> Result<()>;
    fn stop(&self, handle: ModelHandle) -> Result<()>;
    fn set_params(&self, key: &str, value: &str) -> Result<()>;
    fn get_params(&self, key: &str) -> Result<String>;
}

#[derive(Default)]
struct MockState {
    loaded: HashSet<ModelHandle>,
    started: HashSet<ModelHandle>,
    params: BTreeMap<String, String>,
    fail: BTreeMap<&'static str, i32>,
}

/// In-memory connector tracking loaded and started handles.
pub struct MockConnector {
    state: Mutex<MockState>,
    callback: Mutex<Option<ConnectorCallback>>,
    next_handle: AtomicI32,
    pub load_calls: AtomicUsize,
    pub unload_calls: AtomicUsize,
    pub start_calls: AtomicUsize,
    pub stop_calls: AtomicUsize,
}

impl Default for MockConnector {
    fn default() -> Self {
        Self {
            state: Mutex::new(MockState::default()),
            callback: Mutex::new(None),
            next_handle: AtomicI32::new(1),
            load_calls: AtomicUsize::new(0),
            unload_calls: AtomicUsize::new(0),
            start_calls: AtomicUsize::new(0),
            stop_calls: AtomicUsize::new(0),
        }
    }
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every later call of `op` ("load", "unload", "start", "stop",
    /// "set_params") fail with `code`, or succeed again with `None`.
    pub fn fail_with(&self, op: &'static str, code: Option<i32>) {
        let mut state = self.state.lock();
        match code {
            Some(code) => state.fail.insert(op, code),
            None => state.fail.remove(op),
        };
    }

    /// Report a detection for `handle`, as the adapter would. A detection
    /// stops the model.
    pub fn detect(&self, handle: ModelHandle) -> bool {
        self.state.lock().started.remove(&handle);
        let callback = self.callback.lock().clone();
        match callback {
            Some(callback) => {
                callback(handle);
                true
            }
            None => false,
        }
    }

    pub fn is_started(&self, handle: ModelHandle) -> bool {
        self.state.lock().started.contains(&handle)
    }

    pub fn loaded_count(&self) -> usize {
        self.state.lock().loaded.len()
    }

    pub fn started_count(&self) -> usize {
        self.state.lock().started.len()
    }

    fn check(state: &MockState, op: &'static str) -> Result<()> {
        match state.fail.get(op) {
            Some(code) => Err(HarkError::Connector { op, code: *code }),
            None => Ok(()),
        }
    }
}

impl TriggerConnector for MockConnector {
    fn set_callback(&self, callback: ConnectorCallback) {
        *self.callback.lock() = Some(callback);
    }

    fn load_model(&self, model: &TriggerModel) -> Result<ModelHandle> {
        self.load_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock();
        Self::check(&state, "load")?;
        if model.data.is_empty() {
            return Err(HarkError::Connector {
                op: "load",
                code: -22,
            });
        }
        let handle = ModelHandle(self.next_handle.fetch_add(1, Ordering::SeqCst));
        state.loaded.insert(handle);
        Ok(handle)
    }

    fn unload_model(&self, handle: ModelHandle) -> Result<()> {
        self.unload_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock();
        Self::check(&state, "unload")?;
        state.started.remove(&handle);
        state.loaded.remove(&handle);
        Ok(())
    }

    fn start(&self, handle: ModelHandle) -> Result<()> {
        self.start_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock();
        Self::check(&state, "start")?;
        if !state.loaded.contains(&handle) {
            return Err(HarkError::Connector {
                op: "start",
                code: -2,
            });
        }
        state.started.insert(handle);
        Ok(())
    }

    fn stop(&self, handle: ModelHandle) -> Result<()> {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock();
        Self::check(&state, "stop")?;
        state.started.remove(&handle);
        Ok(())
    }

    fn set_params(&self, key: &str, value: &str) -> Result<()> {
        let mut state = self.state.lock();
        Self::check(&state, "set_params")?;
        state.params.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn get_params(&self, key: &str) -> Result<String> {
        Ok(self.state.lock().params.get(key).cloned().unwrap_or_default())
    }
}
