use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::types::{AudioScene, EngineId, EngineKind, FoldPosture, ModelUuid, Timestamp};

/// Domain events emitted by the Hark service.
///
/// Events are published after the state change they describe and consumed
/// by the service event channel (the CLI prints them as JSON lines).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[non_exhaustive]
pub enum HarkEvent {
    // =========================================================================
    // Wake engine events
    // =========================================================================
    /// A wake engine was created for a profile.
    EngineCreated {
        engine_id: EngineId,
        kind: EngineKind,
        timestamp: Timestamp,
    },

    /// A wake engine changed lifecycle state.
    EngineStateChanged {
        engine_id: EngineId,
        kind: EngineKind,
        from: String,
        to: String,
        timestamp: Timestamp,
    },

    /// The adapter reported a wakeup recognition result.
    WakeupRecognized {
        engine_id: EngineId,
        result: i32,
        info: String,
        timestamp: Timestamp,
    },

    /// A posted recognition start was not taken up by a wake engine.
    RecognitionStartFailed {
        engine_id: EngineId,
        kind: EngineKind,
        state: String,
        code: i32,
        reason: String,
        timestamp: Timestamp,
    },

    /// A wake engine was released.
    EngineReleased {
        engine_id: EngineId,
        kind: EngineKind,
        timestamp: Timestamp,
    },

    // =========================================================================
    // Trigger events
    // =========================================================================
    /// The trigger layer detected a wake phrase for a model.
    TriggerDetected {
        model: ModelUuid,
        timestamp: Timestamp,
    },

    /// Arbitration started or stopped a model.
    ModelRunStateChanged {
        model: ModelUuid,
        running: bool,
        timestamp: Timestamp,
    },

    /// One of the conflict signals changed.
    ConflictSignalsChanged {
        call_active: bool,
        capture_active: bool,
        hibernating: bool,
        audio_scene: AudioScene,
        fold_posture: FoldPosture,
        timestamp: Timestamp,
    },

    // =========================================================================
    // Service lifecycle
    // =========================================================================
    ServiceStarted { timestamp: Timestamp },

    ServiceStopped { timestamp: Timestamp },
}

/// Receiver for published events. Must not block.
pub type EventSink = Arc<dyn Fn(HarkEvent) + Send + Sync>;

impl HarkEvent {
    /// Returns the timestamp of the event.
    pub fn timestamp(&self) -> Timestamp {
        match self {
            HarkEvent::EngineCreated { timestamp, .. }
            | HarkEvent::EngineStateChanged { timestamp, .. }
            | HarkEvent::WakeupRecognized { timestamp, .. }
            | HarkEvent::RecognitionStartFailed { timestamp, .. }
            | HarkEvent::EngineReleased { timestamp, .. }
            | HarkEvent::TriggerDetected { timestamp, .. }
            | HarkEvent::ModelRunStateChanged { timestamp, .. }
            | HarkEvent::ConflictSignalsChanged { timestamp, .. }
            | HarkEvent::ServiceStarted { timestamp }
            | HarkEvent::ServiceStopped { timestamp } => *timestamp,
        }
    }

    /// Returns a short event name for logging.
    pub fn event_name(&self) -> &'static str {
        match self {
            HarkEvent::EngineCreated { .. } => "engine_created",
            HarkEvent::EngineStateChanged { .. } => "engine_state_changed",
            HarkEvent::WakeupRecognized { .. } => "wakeup_recognized",
            HarkEvent::RecognitionStartFailed { .. } => "recognition_start_failed",
            HarkEvent::EngineReleased { .. } => "engine_released",
            HarkEvent::TriggerDetected { .. } => "trigger_detected",
            HarkEvent::ModelRunStateChanged { .. } => "model_run_state_changed",
            HarkEvent::ConflictSignalsChanged { .. } => "conflict_signals_changed",
            HarkEvent::ServiceStarted { .. } => "service_started",
            HarkEvent::ServiceStopped { .. } => "service_stopped",
        }
    }
}
