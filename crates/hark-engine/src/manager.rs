//! Owns the wake engines of a service, one per profile.

use std::collections::HashMap;
use std::sync::Arc;

use hark_core::{EngineKind, HarkConfig, HarkError, ModelUuid, Result};
use parking_lot::Mutex;
use tracing::{info, warn};

use crate::engine::{EngineDeps, WakeEngine};
use crate::state::{EngineState, WakeListener};

pub struct EngineManager {
    config: HarkConfig,
    deps: EngineDeps,
    engines: Mutex<HashMap<EngineKind, Arc<WakeEngine>>>,
    listener: Mutex<Option<Arc<dyn WakeListener>>>,
}

impl EngineManager {
    pub fn new(config: HarkConfig, deps: EngineDeps) -> Self {
        Self {
            config,
            deps,
            engines: Mutex::new(HashMap::new()),
            listener: Mutex::new(None),
        }
    }

    /// Listener installed on every engine created from now on.
    pub fn set_listener(&self, listener: Option<Arc<dyn WakeListener>>) {
        *self.listener.lock() = listener;
    }

    pub fn engine(&self, kind: EngineKind) -> Option<Arc<WakeEngine>> {
        self.engines.lock().get(&kind).cloned()
    }

    pub fn kinds(&self) -> Vec<EngineKind> {
        self.engines.lock().keys().copied().collect()
    }

    /// Return the engine for `kind`, creating and initializing it first if
    /// needed. A failed init leaves no engine behind.
    pub fn create_engine(&self, kind: EngineKind) -> Result<Arc<WakeEngine>> {
        if let Some(engine) = self.engine(kind) {
            return Ok(engine);
        }

        let engine = Arc::new(WakeEngine::new(kind, &self.config, self.deps.clone())?);
        let listener = self.listener.lock().clone();
        if listener.is_some() {
            engine.set_listener(listener)?;
        }
        if let Err(e) = engine.init() {
            warn!(%kind, error = %e, "Engine init failed");
            engine.shutdown();
            return Err(e);
        }

        let mut engines = self.engines.lock();
        let engine = Arc::clone(engines.entry(kind).or_insert(engine));
        info!(%kind, engine = %engine.id(), "Engine registered");
        Ok(engine)
    }

    pub fn release_engine(&self, kind: EngineKind) -> Result<()> {
        let engine = self
            .engines
            .lock()
            .remove(&kind)
            .ok_or_else(|| HarkError::Engine(format!("no {kind} engine")))?;
        engine.shutdown();
        info!(%kind, "Engine released");
        Ok(())
    }

    /// A trigger detection for `model`: queue a start on the standard engine
    /// unless a headset wake is in progress.
    ///
    /// Never blocks. Returns `Ok(false)` when the detection was ignored; a
    /// queued start that later fails is published by the engine.
    pub fn on_detected(&self, model: ModelUuid) -> Result<bool> {
        if self.headset_busy() {
            info!(%model, "Headset wake in progress, ignoring detection");
            return Ok(false);
        }
        let engine = self
            .engine(EngineKind::Standard)
            .ok_or_else(|| HarkError::Engine("no standard engine".into()))?;
        engine.request_start(model)?;
        Ok(true)
    }

    fn headset_busy(&self) -> bool {
        self.engine(EngineKind::Headset)
            .map(|engine| engine.state() >= EngineState::Recognizing)
            .unwrap_or(false)
    }

    /// A headset host connected or disconnected.
    pub fn set_headset_host(&self, connected: bool) -> Result<()> {
        match (connected, self.engine(EngineKind::Headset).is_some()) {
            (true, false) => self.create_engine(EngineKind::Headset).map(drop),
            (false, true) => self.release_engine(EngineKind::Headset),
            _ => Ok(()),
        }
    }

    /// Reattach every adapter-backed engine after the adapter service restarted.
    pub fn reset_adapters(&self) -> Result<()> {
        let engines: Vec<_> = self.engines.lock().values().cloned().collect();
        let mut first_error = None;
        for engine in engines.iter().filter(|e| e.kind() != EngineKind::SingleStage) {
            if engine.state() != EngineState::Idle {
                if let Err(e) = engine.release_adapter() {
                    warn!(kind = %engine.kind(), error = %e, "Release adapter failed");
                }
            }
            if let Err(e) = engine.reset_adapter() {
                warn!(kind = %engine.kind(), error = %e, "Adapter reset failed");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    pub fn release_all(&self) {
        let engines: Vec<_> = self.engines.lock().drain().map(|(_, e)| e).collect();
        for engine in engines {
            engine.shutdown();
        }
    }
}

impl Drop for EngineManager {
    fn drop(&mut self) {
        self.release_all();
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;
    use std::time::{Duration, Instant};

    use hark_dispatch::TimerService;

    use crate::adapter::{MockAdapter, MockAdapterHost};
    use crate::audio::MockCaptureSource;
    use crate::engine::StaticParameters;

    fn manager() -> (EngineManager, Arc<MockAdapterHost>, Arc<MockCaptureSource>, TimerService) {
        let timer = TimerService::new(8);
        timer.start("manager-test-timer").unwrap();
        let host = Arc::new(MockAdapterHost::new());
        let capture = Arc::new(MockCaptureSource::new());
        let deps = EngineDeps {
            host: host.clone(),
            capture: capture.clone(),
            params: Arc::new(StaticParameters::default()),
            timer: timer.clone(),
            events: None,
        };
        (EngineManager::new(HarkConfig::default(), deps), host, capture, timer)
    }

    fn wait_for(engine: &WakeEngine, state: EngineState) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if engine.state() == state {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn test_create_engine_is_idempotent() {
        let (manager, host, _capture, timer) = manager();
        let first = manager.create_engine(EngineKind::Standard).unwrap();
        let second = manager.create_engine(EngineKind::Standard).unwrap();
        assert_eq!(first.id(), second.id());
        assert_eq!(host.create_calls.load(Ordering::SeqCst), 1);
        manager.release_all();
        timer.stop();
    }

    #[test]
    fn test_failed_init_leaves_no_engine() {
        let (manager, host, _capture, timer) = manager();
        host.fail_create.store(true, Ordering::SeqCst);
        assert!(manager.create_engine(EngineKind::Standard).is_err());
        assert!(manager.engine(EngineKind::Standard).is_none());
        timer.stop();
    }

    #[test]
    fn test_detection_starts_standard_engine() {
        let (manager, _host, capture, timer) = manager();
        let engine = manager.create_engine(EngineKind::Standard).unwrap();
        assert!(wait_for(&engine, EngineState::Initialized));

        assert!(manager.on_detected(ModelUuid::VOICE_WAKEUP).unwrap());
        assert!(wait_for(&engine, EngineState::Recognizing));
        assert_eq!(capture.starts(), 1);
        manager.release_all();
        timer.stop();
    }

    #[test]
    fn test_detection_ignored_while_headset_recognizes() {
        let (manager, _host, capture, timer) = manager();
        let standard = manager.create_engine(EngineKind::Standard).unwrap();
        manager.set_headset_host(true).unwrap();
        let headset = manager.engine(EngineKind::Headset).unwrap();
        assert!(wait_for(&standard, EngineState::Initialized));
        assert!(wait_for(&headset, EngineState::Initialized));
        headset.start(ModelUuid::VOICE_WAKEUP).unwrap();

        assert!(!manager.on_detected(ModelUuid::VOICE_WAKEUP).unwrap());
        assert_eq!(standard.state(), EngineState::Initialized);
        assert_eq!(capture.starts(), 1);
        manager.release_all();
        timer.stop();
    }

    #[test]
    fn test_detection_without_engine_fails() {
        let (manager, _host, _capture, timer) = manager();
        assert!(matches!(
            manager.on_detected(ModelUuid::VOICE_WAKEUP),
            Err(HarkError::Engine(_))
        ));
        timer.stop();
    }

    #[test]
    fn test_headset_host_toggle() {
        let (manager, host, _capture, timer) = manager();
        manager.set_headset_host(true).unwrap();
        assert!(manager.engine(EngineKind::Headset).is_some());
        manager.set_headset_host(true).unwrap();
        manager.set_headset_host(false).unwrap();
        assert!(manager.engine(EngineKind::Headset).is_none());
        assert_eq!(
            MockAdapter::count(&host.adapter(EngineKind::Headset).detach_calls),
            1
        );
        timer.stop();
    }

    #[test]
    fn test_reset_adapters_reattaches() {
        let (manager, host, _capture, timer) = manager();
        let engine = manager.create_engine(EngineKind::Standard).unwrap();
        assert!(wait_for(&engine, EngineState::Initialized));

        manager.reset_adapters().unwrap();
        assert!(wait_for(&engine, EngineState::Initialized));
        assert_eq!(
            MockAdapter::count(&host.adapter(EngineKind::Standard).attach_calls),
            2
        );
        manager.release_all();
        timer.stop();
    }
}
