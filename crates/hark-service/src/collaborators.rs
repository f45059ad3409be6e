//! External collaborators the service is built from.

use std::sync::Arc;

use hark_engine::{AdapterHost, AudioCaptureSource, MockAdapterHost, MockCaptureSource};
use hark_trigger::{
    ManualSignalSource, MemoryModelStore, MockConnector, ModelStore, SignalSource,
    TriggerConnector,
};

/// Everything platform-specific the service needs.
#[derive(Clone)]
pub struct Collaborators {
    pub adapters: Arc<dyn AdapterHost>,
    pub capture: Arc<dyn AudioCaptureSource>,
    pub connector: Arc<dyn TriggerConnector>,
    pub store: Arc<dyn ModelStore>,
    pub signals: Vec<Arc<dyn SignalSource>>,
}

/// In-process collaborators with typed handles, for tests and simulation.
pub struct MockCollaborators {
    pub adapters: Arc<MockAdapterHost>,
    pub capture: Arc<MockCaptureSource>,
    pub connector: Arc<MockConnector>,
    pub store: Arc<MemoryModelStore>,
    pub telephony: Arc<ManualSignalSource>,
    pub capture_activity: Arc<ManualSignalSource>,
    pub power: Arc<ManualSignalSource>,
    pub audio_scene: Arc<ManualSignalSource>,
    pub posture: Arc<ManualSignalSource>,
}

impl Default for MockCollaborators {
    fn default() -> Self {
        Self {
            adapters: Arc::new(MockAdapterHost::new()),
            capture: Arc::new(MockCaptureSource::new()),
            connector: Arc::new(MockConnector::new()),
            store: Arc::new(MemoryModelStore::new()),
            telephony: Arc::new(ManualSignalSource::new("telephony")),
            capture_activity: Arc::new(ManualSignalSource::new("capture-activity")),
            power: Arc::new(ManualSignalSource::new("power")),
            audio_scene: Arc::new(ManualSignalSource::new("audio-scene")),
            posture: Arc::new(ManualSignalSource::new("fold-posture")),
        }
    }
}

impl MockCollaborators {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn collaborators(&self) -> Collaborators {
        let signals: Vec<Arc<dyn SignalSource>> = vec![
            Arc::clone(&self.telephony) as Arc<dyn SignalSource>,
            Arc::clone(&self.capture_activity) as Arc<dyn SignalSource>,
            Arc::clone(&self.power) as Arc<dyn SignalSource>,
            Arc::clone(&self.audio_scene) as Arc<dyn SignalSource>,
            Arc::clone(&self.posture) as Arc<dyn SignalSource>,
        ];
        Collaborators {
            adapters: Arc::clone(&self.adapters) as Arc<dyn AdapterHost>,
            capture: Arc::clone(&self.capture) as Arc<dyn AudioCaptureSource>,
            connector: Arc::clone(&self.connector) as Arc<dyn TriggerConnector>,
            store: Arc::clone(&self.store) as Arc<dyn ModelStore>,
            signals,
        }
    }
}
