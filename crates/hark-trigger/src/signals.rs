//! Conflict signals and the observers that report them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use hark_core::{AudioScene, FoldPosture};
use parking_lot::Mutex;
use tracing::debug;

/// The aggregated system conditions that can suppress wake detection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConflictSignals {
    pub call_active: bool,
    pub capture_active: bool,
    pub hibernating: bool,
    pub audio_scene: AudioScene,
    /// Forwarded to the connector; does not block detection.
    pub fold_posture: FoldPosture,
}

impl ConflictSignals {
    pub fn is_conflict_active(&self) -> bool {
        self.call_active
            || self.capture_active
            || self.hibernating
            || self.audio_scene != AudioScene::Default
    }

    /// Apply `update`, returning whether anything changed.
    pub fn apply(&mut self, update: SignalUpdate) -> bool {
        let before = *self;
        match update {
            SignalUpdate::CallActive(v) => self.call_active = v,
            SignalUpdate::CaptureActive(v) => self.capture_active = v,
            SignalUpdate::Hibernating(v) => self.hibernating = v,
            SignalUpdate::AudioScene(scene) => self.audio_scene = scene,
            SignalUpdate::FoldPosture(posture) => self.fold_posture = posture,
        }
        before != *self
    }
}

/// One change reported by an observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalUpdate {
    CallActive(bool),
    CaptureActive(bool),
    Hibernating(bool),
    AudioScene(AudioScene),
    FoldPosture(FoldPosture),
}

pub type SignalSink = Arc<dyn Fn(SignalUpdate) + Send + Sync>;

/// A push-style platform observer (telephony, capture, power, audio policy,
/// posture). Attached at service start, detached at service stop.
pub trait SignalSource: Send + Sync {
    fn name(&self) -> &str;
    fn attach(&self, sink: SignalSink);
    fn detach(&self);
}

/// Observer whose updates are emitted by hand.
pub struct ManualSignalSource {
    name: String,
    sink: Mutex<Option<SignalSink>>,
    attached: AtomicBool,
}

impl ManualSignalSource {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sink: Mutex::new(None),
            attached: AtomicBool::new(false),
        }
    }

    /// Report `update`. Returns `false` while detached.
    pub fn emit(&self, update: SignalUpdate) -> bool {
        let sink = self.sink.lock().clone();
        match sink {
            Some(sink) => {
                sink(update);
                true
            }
            None => {
                debug!(source = %self.name, ?update, "Signal dropped while detached");
                false
            }
        }
    }

    pub fn is_attached(&self) -> bool {
        self.attached.load(Ordering::SeqCst)
    }
}

impl SignalSource for ManualSignalSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn attach(&self, sink: SignalSink) {
        *self.sink.lock() = Some(sink);
        self.attached.store(true, Ordering::SeqCst);
    }

    fn detach(&self) {
        self.sink.lock().take();
        self.attached.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conflict_predicate() {
        let mut signals = ConflictSignals::default();
        assert!(!signals.is_conflict_active());

        signals.apply(SignalUpdate::FoldPosture(FoldPosture::Folded));
        assert!(!signals.is_conflict_active());

        signals.apply(SignalUpdate::AudioScene(AudioScene::Ringing));
        assert!(signals.is_conflict_active());
        signals.apply(SignalUpdate::AudioScene(AudioScene::Default));
        signals.apply(SignalUpdate::Hibernating(true));
        assert!(signals.is_conflict_active());
    }

    #[test]
    fn test_apply_reports_change() {
        let mut signals = ConflictSignals::default();
        assert!(signals.apply(SignalUpdate::CallActive(true)));
        assert!(!signals.apply(SignalUpdate::CallActive(true)));
    }

    #[test]
    fn test_manual_source_attach_detach() {
        let source = ManualSignalSource::new("telephony");
        assert!(!source.emit(SignalUpdate::CallActive(true)));

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        source.attach(Arc::new(move |u: SignalUpdate| sink.lock().push(u)));
        assert!(source.is_attached());
        assert!(source.emit(SignalUpdate::CallActive(true)));

        source.detach();
        assert!(!source.emit(SignalUpdate::CallActive(false)));
        assert_eq!(seen.lock().as_slice(), &[SignalUpdate::CallActive(true)]);
        assert_eq!(source.name(), "telephony");
    }
}
