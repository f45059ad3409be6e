//! Trigger API used by the voice service: model storage, detectors,
//! connector parameters and signal observer wiring.

use std::collections::BTreeMap;
use std::sync::Arc;

use hark_core::config::TriggerConfig;
use hark_core::{EventSink, HarkError, ModelUuid, Result};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::arbitration::{RecognitionCallback, TriggerArbiter};
use crate::connector::TriggerConnector;
use crate::model::TriggerModel;
use crate::signals::{SignalSink, SignalSource, SignalUpdate};

/// Persistence for enrolled models.
pub trait ModelStore: Send + Sync {
    fn update(&self, model: TriggerModel) -> Result<()>;
    fn delete(&self, uuid: ModelUuid) -> Result<()>;
    fn get(&self, uuid: ModelUuid) -> Option<Arc<TriggerModel>>;
    fn exists(&self, uuid: ModelUuid) -> bool;
}

#[derive(Default)]
pub struct MemoryModelStore {
    models: RwLock<BTreeMap<ModelUuid, Arc<TriggerModel>>>,
}

impl MemoryModelStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ModelStore for MemoryModelStore {
    fn update(&self, model: TriggerModel) -> Result<()> {
        if model.data.is_empty() {
            return Err(HarkError::InvalidArgument(format!(
                "model {} has no payload",
                model.uuid
            )));
        }
        self.models.write().insert(model.uuid, Arc::new(model));
        Ok(())
    }

    fn delete(&self, uuid: ModelUuid) -> Result<()> {
        self.models.write().remove(&uuid);
        Ok(())
    }

    fn get(&self, uuid: ModelUuid) -> Option<Arc<TriggerModel>> {
        self.models.read().get(&uuid).cloned()
    }

    fn exists(&self, uuid: ModelUuid) -> bool {
        self.models.read().contains_key(&uuid)
    }
}

/// Called with the detected model's uuid, on the connector's thread.
pub type DetectedFn = Arc<dyn Fn(ModelUuid) + Send + Sync>;

struct DetectedForwarder(DetectedFn);

impl RecognitionCallback for DetectedForwarder {
    fn on_detected(&self, uuid: ModelUuid) {
        (self.0)(uuid);
    }
}

/// A caller's registration for one model.
///
/// The arbiter only holds a weak reference to the detector's callback, so
/// dropping the detector silences detections without touching arbitration.
pub struct TriggerDetector {
    uuid: ModelUuid,
    callback: Arc<dyn RecognitionCallback>,
    arbiter: Arc<TriggerArbiter>,
    store: Arc<dyn ModelStore>,
}

impl TriggerDetector {
    pub fn uuid(&self) -> ModelUuid {
        self.uuid
    }

    /// Request recognition with the stored model for this uuid.
    pub fn start_recognition(&self) -> Result<()> {
        let model = self
            .store
            .get(self.uuid)
            .ok_or(HarkError::UnknownModel(self.uuid.0))?;
        self.arbiter
            .start_recognition(model, Arc::downgrade(&self.callback))
    }

    pub fn stop_recognition(&self) -> Result<()> {
        self.arbiter.stop_recognition(self.uuid)
    }

    pub fn unload_model(&self) -> Result<()> {
        self.arbiter.unload(self.uuid)
    }
}

impl std::fmt::Debug for TriggerDetector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TriggerDetector")
            .field("uuid", &self.uuid)
            .finish_non_exhaustive()
    }
}

pub struct TriggerManager {
    arbiter: Arc<TriggerArbiter>,
    store: Arc<dyn ModelStore>,
    detectors: Mutex<BTreeMap<ModelUuid, Arc<TriggerDetector>>>,
    sources: Vec<Arc<dyn SignalSource>>,
}

impl TriggerManager {
    /// Build the manager and push the configured connector parameters.
    pub fn new(
        config: &TriggerConfig,
        connector: Arc<dyn TriggerConnector>,
        store: Arc<dyn ModelStore>,
        sources: Vec<Arc<dyn SignalSource>>,
        events: Option<EventSink>,
    ) -> Self {
        for (key, value) in &config.params {
            if let Err(e) = connector.set_params(key, value) {
                warn!(key = %key, error = %e, "Failed to apply trigger parameter");
            }
        }

        Self {
            arbiter: TriggerArbiter::new(connector, events),
            store,
            detectors: Mutex::new(BTreeMap::new()),
            sources,
        }
    }

    pub fn arbiter(&self) -> &Arc<TriggerArbiter> {
        &self.arbiter
    }

    // =========================================================================
    // Models
    // =========================================================================

    /// Store `model`. A running model picks the new payload up on its next
    /// start request.
    pub fn update_model(&self, model: TriggerModel) -> Result<()> {
        info!(model = %model.uuid, version = model.version, "Updating trigger model");
        self.store.update(model)
    }

    /// Unload and forget `uuid`.
    pub fn delete_model(&self, uuid: ModelUuid) -> Result<()> {
        self.arbiter.unload(uuid)?;
        self.store.delete(uuid)?;
        info!(model = %uuid, "Trigger model deleted");
        Ok(())
    }

    pub fn get_model(&self, uuid: ModelUuid) -> Option<Arc<TriggerModel>> {
        self.store.get(uuid)
    }

    pub fn has_model(&self, uuid: ModelUuid) -> bool {
        self.store.exists(uuid)
    }

    // =========================================================================
    // Detectors
    // =========================================================================

    /// Register a detector for `uuid`, replacing any earlier one.
    pub fn create_detector(&self, uuid: ModelUuid, on_detected: DetectedFn) -> Arc<TriggerDetector> {
        let callback: Arc<dyn RecognitionCallback> = Arc::new(DetectedForwarder(on_detected));
        let detector = Arc::new(TriggerDetector {
            uuid,
            callback,
            arbiter: Arc::clone(&self.arbiter),
            store: Arc::clone(&self.store),
        });

        let previous = self.detectors.lock().insert(uuid, Arc::clone(&detector));
        if let Some(previous) = previous {
            debug!(model = %uuid, "Replacing detector");
            Self::quiesce(&previous);
        }
        info!(model = %uuid, "Detector created");
        detector
    }

    pub fn detector(&self, uuid: ModelUuid) -> Option<Arc<TriggerDetector>> {
        self.detectors.lock().get(&uuid).cloned()
    }

    /// Drop the detector for `uuid`, withdrawing its recognition request.
    pub fn release_detector(&self, uuid: ModelUuid) {
        let removed = self.detectors.lock().remove(&uuid);
        if let Some(detector) = removed {
            Self::quiesce(&detector);
            info!(model = %uuid, "Detector released");
        }
    }

    pub fn start_detection(&self, uuid: ModelUuid) -> Result<()> {
        self.require_detector(uuid)?.start_recognition()
    }

    pub fn stop_detection(&self, uuid: ModelUuid) -> Result<()> {
        self.require_detector(uuid)?.stop_recognition()
    }

    fn require_detector(&self, uuid: ModelUuid) -> Result<Arc<TriggerDetector>> {
        self.detector(uuid).ok_or(HarkError::UnknownModel(uuid.0))
    }

    fn quiesce(detector: &TriggerDetector) {
        match detector.stop_recognition() {
            Ok(()) | Err(HarkError::UnknownModel(_)) => {}
            Err(e) => warn!(model = %detector.uuid, error = %e, "Failed to stop detector"),
        }
    }

    // =========================================================================
    // Parameters
    // =========================================================================

    pub fn set_parameter(&self, key: &str, value: &str) -> Result<()> {
        debug!(key, value, "Setting trigger parameter");
        self.arbiter.set_parameter(key, value)
    }

    pub fn get_parameter(&self, key: &str) -> Result<String> {
        self.arbiter.get_parameter(key)
    }

    // =========================================================================
    // Signal observers
    // =========================================================================

    /// Subscribe to every signal observer.
    pub fn on_service_start(&self) {
        for source in &self.sources {
            let arbiter = Arc::downgrade(&self.arbiter);
            let sink: SignalSink = Arc::new(move |update: SignalUpdate| {
                if let Some(arbiter) = arbiter.upgrade() {
                    arbiter.update_signal(update);
                }
            });
            source.attach(sink);
            debug!(source = source.name(), "Signal observer attached");
        }
        info!(observers = self.sources.len(), "Trigger observers attached");
    }

    pub fn on_service_stop(&self) {
        for source in &self.sources {
            source.detach();
        }
        info!(observers = self.sources.len(), "Trigger observers detached");
    }
}

// =============================================================================
// Tests
// =============================================================================
