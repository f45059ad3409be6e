//! The process-wide service context.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use hark_core::{
    EngineKind, EventSink, HarkConfig, HarkEvent, ModelUuid, Result, Timestamp,
};
use hark_dispatch::TimerService;
use hark_engine::{EngineDeps, EngineManager, EngineState, ParameterSource};
use hark_trigger::{DetectedFn, TriggerManager, TriggerModel};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::collaborators::Collaborators;
use crate::rearm::Rearm;

/// Capacity of the event broadcast channel. Slow subscribers lag.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Engine-side view of the trigger parameters. Empty values read as unset.
pub struct TriggerParameters {
    trigger: Arc<TriggerManager>,
}

impl TriggerParameters {
    pub fn new(trigger: Arc<TriggerManager>) -> Self {
        Self { trigger }
    }
}

impl ParameterSource for TriggerParameters {
    fn parameter(&self, key: &str) -> Option<String> {
        self.trigger
            .get_parameter(key)
            .ok()
            .filter(|value| !value.is_empty())
    }
}

/// Shared state of one running voice service.
///
/// Trigger detections are queued on the standard engine. A detected model
/// is requested again once the engine falls back to `Initialized`, or right
/// away when the detection was not taken up.
pub struct ServiceContext {
    config: HarkConfig,
    timer: TimerService,
    engines: Arc<EngineManager>,
    trigger: Arc<TriggerManager>,
    rearm: Arc<Rearm>,
    events: broadcast::Sender<HarkEvent>,
    started: AtomicBool,
}

impl ServiceContext {
    pub fn new(config: HarkConfig, collaborators: Collaborators) -> Result<Self> {
        config.validate()?;

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let timer = TimerService::new(config.timer.max_timers);
        let rearm = Rearm::new(timer.clone());
        let sink = event_sink(events.clone(), Arc::clone(&rearm));

        let trigger = Arc::new(TriggerManager::new(
            &config.trigger,
            collaborators.connector,
            collaborators.store,
            collaborators.signals,
            Some(Arc::clone(&sink)),
        ));
        rearm.bind(&trigger);

        let deps = EngineDeps {
            host: collaborators.adapters,
            capture: collaborators.capture,
            params: Arc::new(TriggerParameters::new(Arc::clone(&trigger))),
            timer: timer.clone(),
            events: Some(sink),
        };
        let engines = Arc::new(EngineManager::new(config.clone(), deps));

        Ok(Self {
            config,
            timer,
            engines,
            trigger,
            rearm,
            events,
            started: AtomicBool::new(false),
        })
    }

    /// Start the timer worker, attach the signal observers and bring up the
    /// standard engine. Starting twice is a no-op.
    pub fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        if let Err(e) = self.timer.start(&self.config.timer.thread_name) {
            self.started.store(false, Ordering::SeqCst);
            return Err(e.into());
        }
        self.trigger.on_service_start();

        if let Err(e) = self.engines.create_engine(EngineKind::Standard) {
            warn!(error = %e, "Standard engine unavailable");
        }

        info!("Hark service started");
        self.publish(HarkEvent::ServiceStarted {
            timestamp: Timestamp::now(),
        });
        Ok(())
    }

    /// Release every engine, detach the observers and stop the timer.
    pub fn shutdown(&self) {
        if !self.started.swap(false, Ordering::SeqCst) {
            return;
        }

        self.trigger.on_service_stop();
        self.engines.release_all();
        self.timer.stop();

        info!("Hark service stopped");
        self.publish(HarkEvent::ServiceStopped {
            timestamp: Timestamp::now(),
        });
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Store `model` and request detection for it. Detections start the
    /// standard engine.
    pub fn enable_wakeup(&self, model: TriggerModel) -> Result<()> {
        let uuid = model.uuid;
        self.trigger.update_model(model)?;

        let engines = Arc::downgrade(&self.engines);
        let rearm = Arc::clone(&self.rearm);
        // Runs on the connector's thread: only queue work.
        let on_detected: DetectedFn = Arc::new(move |uuid: ModelUuid| {
            rearm.hold(uuid);
            let taken = match engines.upgrade().map(|engines| engines.on_detected(uuid)) {
                Some(Ok(taken)) => taken,
                Some(Err(e)) => {
                    warn!(model = %uuid, error = %e, "Detection not taken up by engine");
                    false
                }
                None => false,
            };
            if !taken {
                rearm.schedule();
            }
        });
        self.trigger.create_detector(uuid, on_detected);
        self.trigger.start_detection(uuid)
    }

    /// Withdraw detection for `uuid` and drop its detector.
    pub fn disable_wakeup(&self, uuid: ModelUuid) {
        self.rearm.forget(uuid);
        self.trigger.release_detector(uuid);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HarkEvent> {
        self.events.subscribe()
    }

    pub fn config(&self) -> &HarkConfig {
        &self.config
    }

    pub fn engines(&self) -> &Arc<EngineManager> {
        &self.engines
    }

    pub fn trigger(&self) -> &Arc<TriggerManager> {
        &self.trigger
    }

    pub fn timer(&self) -> &TimerService {
        &self.timer
    }

    fn publish(&self, event: HarkEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

impl Drop for ServiceContext {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for ServiceContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceContext")
            .field("started", &self.is_started())
            .field("engines", &self.engines.kinds())
            .finish_non_exhaustive()
    }
}

/// Fan events out to subscribers. Held models are re-requested when the
/// standard engine settles back in `Initialized` or fails a queued start.
fn event_sink(events: broadcast::Sender<HarkEvent>, rearm: Arc<Rearm>) -> EventSink {
    let initialized = EngineState::Initialized.to_string();
    Arc::new(move |event: HarkEvent| {
        let release_held = match &event {
            HarkEvent::EngineStateChanged {
                kind: EngineKind::Standard,
                to,
                ..
            } => *to == initialized,
            HarkEvent::RecognitionStartFailed {
                kind: EngineKind::Standard,
                ..
            } => true,
            _ => false,
        };
        debug!(event = event.event_name(), "Publishing event");
        let _ = events.send(event);

        if release_held {
            rearm.schedule();
        }
    })
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::MockCollaborators;
    use hark_trigger::TriggerConnector;

    #[test]
    fn test_invalid_config_rejected() {
        let mocks = MockCollaborators::new();
        let mut config = HarkConfig::default();
        config.timer.max_timers = 0;
        assert!(ServiceContext::new(config, mocks.collaborators()).is_err());
    }

    #[test]
    fn test_trigger_parameters_read_through_connector() {
        let mocks = MockCollaborators::new();
        let service = ServiceContext::new(HarkConfig::default(), mocks.collaborators()).unwrap();
        let params = TriggerParameters::new(Arc::clone(service.trigger()));

        assert_eq!(params.parameter("wakeup_source_channel"), None);
        mocks
            .connector
            .set_params("wakeup_source_channel", "4")
            .unwrap();
        assert_eq!(params.parameter("wakeup_source_channel").as_deref(), Some("4"));
    }

    #[test]
    fn test_start_and_shutdown_are_idempotent() {
        let mocks = MockCollaborators::new();
        let service = ServiceContext::new(HarkConfig::default(), mocks.collaborators()).unwrap();
        let mut events = service.subscribe();

        service.start().unwrap();
        service.start().unwrap();
        assert!(service.is_started());
        assert!(service.timer().is_started());
        assert!(mocks.telephony.is_attached());

        service.shutdown();
        service.shutdown();
        assert!(!service.timer().is_started());
        assert!(!mocks.telephony.is_attached());

        let mut names = Vec::new();
        while let Ok(event) = events.try_recv() {
            names.push(event.event_name());
        }
        assert_eq!(names.first(), Some(&"engine_created"));
        assert_eq!(names.iter().filter(|n| **n == "service_started").count(), 1);
        assert_eq!(names.last(), Some(&"service_stopped"));
    }
}
