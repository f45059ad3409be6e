//! Hark trigger crate - wake model arbitration.
//!
//! [`TriggerArbiter`] owns per-model load/start bookkeeping and decides
//! whether each requested model may run given the current conflict signals
//! (call, capture, hibernation, audio scene). [`TriggerManager`] is the API
//! the voice service uses: model storage, detectors and signal observers.

pub mod arbitration;
pub mod connector;
pub mod manager;
pub mod model;
pub mod signals;

pub use arbitration::{RecognitionCallback, TriggerArbiter};
pub use connector::{ConnectorCallback, MockConnector, TriggerConnector};
pub use manager::{DetectedFn, MemoryModelStore, ModelStore, TriggerDetector, TriggerManager};
pub use model::{ModelHandle, ModelState, TriggerModel, TriggerModelKind};
pub use signals::{ConflictSignals, ManualSignalSource, SignalSink, SignalSource, SignalUpdate};

/// Connector parameter carrying the fold posture.
pub const FOLD_POSTURE_PARAM: &str = "fold_posture";
