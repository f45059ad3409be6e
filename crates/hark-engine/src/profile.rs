//! Per-profile shape of the wake-engine state graph.

use std::time::Duration;

use hark_core::config::{ProfileTimeouts, WakeupConfig};
use hark_core::EngineKind;

/// Which clauses of the shared state graph a profile registers, and its
/// wait-until delays.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WakeupProfile {
    pub kind: EngineKind,
    pub timeouts: ProfileTimeouts,
}

impl WakeupProfile {
    pub fn new(kind: EngineKind, timeouts: ProfileTimeouts) -> Self {
        Self { kind, timeouts }
    }

    pub fn from_config(kind: EngineKind, config: &WakeupConfig) -> Self {
        let timeouts = match kind {
            EngineKind::Standard => config.standard.clone(),
            EngineKind::Headset => config.headset.clone(),
            EngineKind::SingleStage => config.single_stage.clone(),
        };
        Self::new(kind, timeouts)
    }

    /// Single-stage engines capture audio without a hardware adapter.
    pub fn uses_adapter(&self) -> bool {
        self.kind != EngineKind::SingleStage
    }

    pub fn serves_get_param(&self) -> bool {
        self.kind != EngineKind::Headset
    }

    pub fn serves_wakeup_pcm(&self) -> bool {
        self.kind == EngineKind::Standard
    }

    /// Headset wakes are reconfirmed to the listener after recognition.
    pub fn reconfirms(&self) -> bool {
        self.kind == EngineKind::Headset
    }

    pub fn accepts_record_start(&self) -> bool {
        self.kind == EngineKind::SingleStage
    }

    pub fn recognizing_timeout(&self) -> Option<Duration> {
        self.timeouts.recognizing()
    }

    pub fn recognized_timeout(&self) -> Option<Duration> {
        self.timeouts.recognized()
    }

    pub fn read_capturer_timeout(&self) -> Option<Duration> {
        self.timeouts.read_capturer()
    }

    pub fn machine_name(&self) -> String {
        format!("wakeup-{}", self.kind)
    }
}
