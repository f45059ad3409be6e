//! Per-model load/start bookkeeping and conflict arbitration.
//!
//! Each registered model carries a `requested` flag recording caller intent.
//! Whether a model actually runs is derived from that flag and the current
//! [`ConflictSignals`]: `running == requested && !conflict`. Signal changes
//! re-derive it for every model through [`TriggerArbiter::recompute_all`].

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

use hark_core::{EventSink, HarkError, HarkEvent, ModelUuid, Result, Timestamp};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::connector::TriggerConnector;
use crate::model::{ModelHandle, ModelState, TriggerModel};
use crate::signals::{ConflictSignals, SignalUpdate};
use crate::FOLD_POSTURE_PARAM;

/// Receives detections for one model.
pub trait RecognitionCallback: Send + Sync {
    fn on_detected(&self, uuid: ModelUuid);
}

struct ModelData {
    model: Arc<TriggerModel>,
    callback: Option<Weak<dyn RecognitionCallback>>,
    state: ModelState,
    requested: bool,
}

impl ModelData {
    fn new(model: Arc<TriggerModel>) -> Self {
        Self {
            model,
            callback: None,
            state: ModelState::NotLoaded,
            requested: false,
        }
    }

    // The helpers below return whether a connector call changed the state.
    // A failed call leaves `state` untouched.

    fn load(&mut self, connector: &dyn TriggerConnector) -> Result<bool> {
        if self.state.is_loaded() {
            return Ok(false);
        }
        let handle = connector.load_model(&self.model)?;
        debug!(model = %self.model.uuid, %handle, "Model loaded");
        self.state = ModelState::Loaded { handle };
        Ok(true)
    }

    fn start(&mut self, connector: &dyn TriggerConnector) -> Result<bool> {
        self.load(connector)?;
        match self.state {
            ModelState::Loaded { handle } => {
                connector.start(handle)?;
                self.state = ModelState::Started { handle };
                Ok(true)
            }
            ModelState::Started { .. } | ModelState::NotLoaded => Ok(false),
        }
    }

    fn stop(&mut self, connector: &dyn TriggerConnector) -> Result<bool> {
        match self.state {
            ModelState::Started { handle } => {
                connector.stop(handle)?;
                self.state = ModelState::Loaded { handle };
                Ok(true)
            }
            ModelState::Loaded { .. } | ModelState::NotLoaded => Ok(false),
        }
    }

    fn unload(&mut self, connector: &dyn TriggerConnector) -> Result<bool> {
        self.stop(connector)?;
        match self.state {
            ModelState::Loaded { handle } => {
                connector.unload_model(handle)?;
                debug!(model = %self.model.uuid, %handle, "Model unloaded");
                self.state = ModelState::NotLoaded;
                Ok(true)
            }
            ModelState::Started { .. } | ModelState::NotLoaded => Ok(false),
        }
    }
}

struct Inner {
    models: BTreeMap<ModelUuid, ModelData>,
    signals: ConflictSignals,
}

/// The trigger arbitration engine for one connector.
///
/// All bookkeeping sits behind one lock. Connector calls are made while
/// holding it, so a connector must never invoke its detection callback from
/// inside one of its own calls.
pub struct TriggerArbiter {
    connector: Arc<dyn TriggerConnector>,
    inner: Mutex<Inner>,
    events: Option<EventSink>,
}

impl TriggerArbiter {
    /// Create an arbiter and install its detection callback on `connector`.
    pub fn new(connector: Arc<dyn TriggerConnector>, events: Option<EventSink>) -> Arc<Self> {
        let arbiter = Arc::new(Self {
            connector,
            inner: Mutex::new(Inner {
                models: BTreeMap::new(),
                signals: ConflictSignals::default(),
            }),
            events,
        });

        let weak = Arc::downgrade(&arbiter);
        arbiter
            .connector
            .set_callback(Arc::new(move |handle: ModelHandle| {
                if let Some(arbiter) = weak.upgrade() {
                    arbiter.on_recognition(handle);
                }
            }));
        arbiter
    }

    /// Request recognition for `model`.
    ///
    /// A model whose payload differs from the registered one replaces it;
    /// the old one is stopped and unloaded first. While a conflict is active
    /// the request is recorded and the start deferred.
    pub fn start_recognition(
        &self,
        model: Arc<TriggerModel>,
        callback: Weak<dyn RecognitionCallback>,
    ) -> Result<()> {
        let uuid = model.uuid;
        let started = {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            let conflict = inner.signals.is_conflict_active();

            let data = match inner.models.entry(uuid) {
                Entry::Vacant(slot) => slot.insert(ModelData::new(Arc::clone(&model))),
                Entry::Occupied(slot) => {
                    let data = slot.into_mut();
                    if !data.model.same_payload(&model) {
                        info!(model = %uuid, version = model.version, "Replacing model payload");
                        data.unload(self.connector.as_ref())?;
                    }
                    data
                }
            };
            data.model = model;
            data.callback = Some(callback);
            data.requested = true;

            if conflict {
                info!(model = %uuid, "Conflict active, start deferred");
                false
            } else {
                data.start(self.connector.as_ref())?
            }
        };

        if started {
            info!(model = %uuid, "Recognition started");
            self.publish_run_state(uuid, true);
        }
        Ok(())
    }

    /// Withdraw the recognition request for `uuid`. The model stays loaded.
    pub fn stop_recognition(&self, uuid: ModelUuid) -> Result<()> {
        let stopped = {
            let mut inner = self.inner.lock();
            let data = inner
                .models
                .get_mut(&uuid)
                .ok_or(HarkError::UnknownModel(uuid.0))?;
            data.requested = false;
            let stopped = data.stop(self.connector.as_ref())?;
            data.callback = None;
            stopped
        };

        if stopped {
            info!(model = %uuid, "Recognition stopped");
            self.publish_run_state(uuid, false);
        }
        Ok(())
    }

    /// Stop and unload `uuid`, then forget it. Unknown models are a no-op.
    pub fn unload(&self, uuid: ModelUuid) -> Result<()> {
        let mut inner = self.inner.lock();
        let Some(data) = inner.models.get_mut(&uuid) else {
            debug!(model = %uuid, "Unload of unregistered model ignored");
            return Ok(());
        };
        data.unload(self.connector.as_ref())?;
        inner.models.remove(&uuid);
        info!(model = %uuid, "Model erased");
        Ok(())
    }

    /// Apply one observer update. Returns whether any signal changed; an
    /// unchanged update does not trigger recomputation.
    pub fn update_signal(&self, update: SignalUpdate) -> bool {
        let signals = {
            let mut inner = self.inner.lock();
            if !inner.signals.apply(update) {
                return false;
            }
            inner.signals
        };
        info!(
            ?update,
            conflict = signals.is_conflict_active(),
            "Conflict signal changed"
        );

        if let SignalUpdate::FoldPosture(posture) = update {
            if let Err(e) = self
                .connector
                .set_params(FOLD_POSTURE_PARAM, posture.as_param())
            {
                warn!(error = %e, "Failed to forward fold posture");
            }
        }

        self.publish(HarkEvent::ConflictSignalsChanged {
            call_active: signals.call_active,
            capture_active: signals.capture_active,
            hibernating: signals.hibernating,
            audio_scene: signals.audio_scene,
            fold_posture: signals.fold_posture,
            timestamp: Timestamp::now(),
        });

        self.recompute_all();
        true
    }

    /// Bring every model's run state in line with `requested && !conflict`.
    ///
    /// Connector failures are logged per model and leave that model as it
    /// was; the next recomputation retries.
    pub fn recompute_all(&self) {
        let mut changes = Vec::new();
        {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            let conflict = inner.signals.is_conflict_active();

            for (uuid, data) in inner.models.iter_mut() {
                let desired = data.requested && !conflict;
                if desired == data.state.is_started() {
                    continue;
                }
                let result = if desired {
                    data.start(self.connector.as_ref())
                } else {
                    data.stop(self.connector.as_ref())
                };
                match result {
                    Ok(_) => changes.push((*uuid, desired)),
                    Err(e) => warn!(model = %uuid, desired, error = %e, "Arbitration failed"),
                }
            }
        }

        for (uuid, running) in changes {
            info!(model = %uuid, running, "Arbitration changed run state");
            self.publish_run_state(uuid, running);
        }
    }

    /// Detection reported by the connector for `handle`.
    ///
    /// The model drops back to `Loaded`, its request is withdrawn and its
    /// callback fires once. Signal changes do not restart it; the caller must
    /// request again for further detections.
    pub fn on_recognition(&self, handle: ModelHandle) {
        let found = {
            let mut inner = self.inner.lock();
            inner
                .models
                .iter_mut()
                .find(|(_, data)| data.state.handle() == Some(handle))
                .map(|(uuid, data)| {
                    data.state = ModelState::Loaded { handle };
                    data.requested = false;
                    (*uuid, data.callback.clone())
                })
        };

        let Some((uuid, callback)) = found else {
            warn!(%handle, "Detection for unknown handle");
            return;
        };
        info!(model = %uuid, %handle, "Wake phrase detected");
        self.publish_run_state(uuid, false);
        self.publish(HarkEvent::TriggerDetected {
            model: uuid,
            timestamp: Timestamp::now(),
        });

        match callback.and_then(|weak| weak.upgrade()) {
            Some(callback) => callback.on_detected(uuid),
            None => debug!(model = %uuid, "No live recognition callback"),
        }
    }

    pub fn model_state(&self, uuid: ModelUuid) -> Option<ModelState> {
        self.inner.lock().models.get(&uuid).map(|data| data.state)
    }

    pub fn is_started(&self, uuid: ModelUuid) -> bool {
        self.model_state(uuid).is_some_and(|state| state.is_started())
    }

    pub fn is_requested(&self, uuid: ModelUuid) -> bool {
        self.inner
            .lock()
            .models
            .get(&uuid)
            .is_some_and(|data| data.requested)
    }

    pub fn models(&self) -> Vec<ModelUuid> {
        self.inner.lock().models.keys().copied().collect()
    }

    pub fn signals(&self) -> ConflictSignals {
        self.inner.lock().signals
    }

    pub fn is_conflict_active(&self) -> bool {
        self.inner.lock().signals.is_conflict_active()
    }

    pub fn set_parameter(&self, key: &str, value: &str) -> Result<()> {
        self.connector.set_params(key, value)
    }

    pub fn get_parameter(&self, key: &str) -> Result<String> {
        self.connector.get_params(key)
    }

    fn publish_run_state(&self, model: ModelUuid, running: bool) {
        self.publish(HarkEvent::ModelRunStateChanged {
            model,
            running,
            timestamp: Timestamp::now(),
        });
    }

    fn publish(&self, event: HarkEvent) {
        if let Some(events) = &self.events {
            events(event);
        }
    }
}

impl std::fmt::Debug for TriggerArbiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("TriggerArbiter")
            .field("models", &inner.models.len())
            .field("signals", &inner.signals)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
