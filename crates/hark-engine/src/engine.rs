//! `WakeEngine`: the per-instance API over a wake-engine state machine.
//!
//! Every operation is a message handled on the engine's worker, so calls
//! from different threads are serialized. Calls block until the handler has
//! run and must therefore not be made from inside an async runtime.

use std::collections::BTreeMap;
use std::sync::Arc;

use hark_core::config::CaptureConfig;
use hark_core::{
    EngineId, EngineKind, EventSink, HarkConfig, HarkError, HarkEvent, ModelUuid, Result,
    Timestamp,
};
use hark_dispatch::{StateMachine, TimerService};
use parking_lot::RwLock;
use tracing::info;

use crate::adapter::AdapterHost;
use crate::audio::AudioCaptureSource;
use crate::profile::WakeupProfile;
use crate::state::{EngineEvent, EngineMsg, EngineReply, EngineState, WakeListener};
use crate::wakeup::{self, ContextParts, WakeupBuilder, WakeupContext};

/// Read-only view of the trigger parameters (capture channels, phrase).
pub trait ParameterSource: Send + Sync {
    fn parameter(&self, key: &str) -> Option<String>;
}

/// A fixed key/value table.
#[derive(Debug, Default)]
pub struct StaticParameters {
    values: RwLock<BTreeMap<String, String>>,
}

impl StaticParameters {
    pub fn new(values: BTreeMap<String, String>) -> Self {
        Self {
            values: RwLock::new(values),
        }
    }

    pub fn set(&self, key: impl Into<String>, value: impl Into<String>) {
        self.values.write().insert(key.into(), value.into());
    }
}

impl ParameterSource for StaticParameters {
    fn parameter(&self, key: &str) -> Option<String> {
        self.values.read().get(key).cloned()
    }
}

/// Collaborators shared by every engine of a service.
#[derive(Clone)]
pub struct EngineDeps {
    pub host: Arc<dyn AdapterHost>,
    pub capture: Arc<dyn AudioCaptureSource>,
    pub params: Arc<dyn ParameterSource>,
    pub timer: TimerService,
    pub events: Option<EventSink>,
}

pub struct WakeEngine {
    id: EngineId,
    kind: EngineKind,
    machine: StateMachine<EngineState, EngineMsg, EngineReply>,
    events: Option<EventSink>,
}

impl WakeEngine {
    /// Spawn an engine in `Idle`. Timeouts come from `config.wakeup`.
    pub fn new(kind: EngineKind, config: &HarkConfig, deps: EngineDeps) -> Result<Self> {
        let profile = WakeupProfile::from_config(kind, &config.wakeup);
        Self::with_profile(profile, config.capture.clone(), config.dispatch.queue_capacity, deps)
    }

    pub fn with_profile(
        profile: WakeupProfile,
        capture_config: CaptureConfig,
        queue_capacity: usize,
        deps: EngineDeps,
    ) -> Result<Self> {
        let id = EngineId::new();
        let kind = profile.kind;

        let mut builder = WakeupBuilder::new(profile.machine_name(), EngineState::Idle)
            .queue_capacity(queue_capacity);
        wakeup::register(&mut builder, &profile);
        if let Some(sink) = deps.events.clone() {
            let failed = Arc::clone(&sink);
            builder.on_transition(move |from, to| {
                sink(HarkEvent::EngineStateChanged {
                    engine_id: id,
                    kind,
                    from: from.to_string(),
                    to: to.to_string(),
                    timestamp: Timestamp::now(),
                })
            });
            builder.on_post_error(move |state, event, err: &HarkError| {
                if event == EngineEvent::StartRecognize {
                    failed(HarkEvent::RecognitionStartFailed {
                        engine_id: id,
                        kind,
                        state: state.to_string(),
                        code: err.code(),
                        reason: err.to_string(),
                        timestamp: Timestamp::now(),
                    });
                }
            });
        }

        let parts = ContextParts {
            profile,
            engine_id: id,
            capture_config,
            host: deps.host,
            capture: deps.capture,
            params: deps.params,
            events: deps.events.clone(),
        };
        let machine = builder.spawn_with(|poster| WakeupContext::new(parts, poster), deps.timer)?;

        info!(engine = %id, %kind, "Wake engine created");
        let engine = Self {
            id,
            kind,
            machine,
            events: deps.events,
        };
        engine.publish(HarkEvent::EngineCreated {
            engine_id: id,
            kind,
            timestamp: Timestamp::now(),
        });
        Ok(engine)
    }

    pub fn id(&self) -> EngineId {
        self.id
    }

    pub fn kind(&self) -> EngineKind {
        self.kind
    }

    pub fn state(&self) -> EngineState {
        self.machine.current_state()
    }

    /// Send any message and wait for its reply.
    pub fn handle(&self, msg: EngineMsg) -> Result<EngineReply> {
        self.machine.handle(msg)
    }

    /// Enqueue a message without waiting.
    pub fn post(&self, msg: EngineMsg) -> Result<()> {
        self.machine.post(msg)
    }

    pub fn set_listener(&self, listener: Option<Arc<dyn WakeListener>>) -> Result<()> {
        self.handle(EngineMsg::SetListener(listener)).map(drop)
    }

    /// Attach the adapter. The engine reaches `Initialized` once the adapter
    /// reports a successful `InitDone`.
    pub fn init(&self) -> Result<()> {
        self.handle(EngineMsg::Init).map(drop)
    }

    pub fn start(&self, model: ModelUuid) -> Result<()> {
        self.handle(EngineMsg::StartRecognize(model)).map(drop)
    }

    /// Queue a recognition start without waiting. Safe from callback
    /// threads and async contexts; a start that fails on the worker is
    /// published as [`HarkEvent::RecognitionStartFailed`].
    pub fn request_start(&self, model: ModelUuid) -> Result<()> {
        self.post(EngineMsg::StartRecognize(model))
    }

    pub fn stop(&self) -> Result<()> {
        self.handle(EngineMsg::StopRecognize).map(drop)
    }

    /// Begin streaming captured audio for the channels in `mask`.
    pub fn start_capturer(&self, mask: u8) -> Result<()> {
        self.handle(EngineMsg::StartCapturer(mask)).map(drop)
    }

    pub fn read(&self) -> Result<Vec<u8>> {
        self.handle(EngineMsg::Read)?.into_pcm()
    }

    pub fn stop_capturer(&self) -> Result<()> {
        self.handle(EngineMsg::StopCapturer).map(drop)
    }

    pub fn wakeup_pcm(&self) -> Result<Vec<u8>> {
        self.handle(EngineMsg::GetWakeupPcm)?.into_pcm()
    }

    pub fn record_start(&self, value: i32) -> Result<()> {
        self.handle(EngineMsg::RecordStart(value)).map(drop)
    }

    pub fn write_audio(&self, pcm: Vec<u8>) -> Result<()> {
        self.handle(EngineMsg::WriteAudio(pcm)).map(drop)
    }

    pub fn evaluate(&self, word: impl Into<String>) -> Result<i32> {
        self.handle(EngineMsg::Evaluate(word.into()))?.into_score()
    }

    /// `kv` is a `key=value` pair.
    pub fn set_parameter(&self, kv: impl Into<String>) -> Result<()> {
        self.handle(EngineMsg::SetParam(kv.into())).map(drop)
    }

    pub fn get_parameter(&self, key: impl Into<String>) -> Result<String> {
        self.handle(EngineMsg::GetParam(key.into()))?.into_param()
    }

    pub fn reset_adapter(&self) -> Result<()> {
        self.handle(EngineMsg::ResetAdapter).map(drop)
    }

    pub fn release_adapter(&self) -> Result<()> {
        self.handle(EngineMsg::ReleaseAdapter).map(drop)
    }

    /// Stop capture and release the adapter, returning to `Idle`.
    pub fn release(&self) -> Result<()> {
        self.handle(EngineMsg::Release).map(drop)
    }

    /// Release (if running) and stop the worker.
    pub fn shutdown(&self) {
        if self.state() != EngineState::Idle {
            if let Err(e) = self.release() {
                tracing::warn!(engine = %self.id, error = %e, "Release during shutdown failed");
            }
        }
        self.machine.shutdown();
        self.publish(HarkEvent::EngineReleased {
            engine_id: self.id,
            kind: self.kind,
            timestamp: Timestamp::now(),
        });
    }

    fn publish(&self, event: HarkEvent) {
        if let Some(sink) = &self.events {
            sink(event);
        }
    }
}

impl std::fmt::Debug for WakeEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WakeEngine")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("state", &self.state())
            .finish()
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

    use hark_core::config::ProfileTimeouts;
    use hark_core::SUCCESS;
    use parking_lot::Mutex;

    use crate::adapter::{AdapterEvent, MockAdapter, MockAdapterHost, WakeAdapter};
    use crate::audio::MockCaptureSource;
    use crate::state::WakeEvent;
    use crate::WAKEUP_SOURCE_CHANNEL;

    struct Fixture {
        host: Arc<MockAdapterHost>,
        capture: Arc<MockCaptureSource>,
        params: Arc<StaticParameters>,
        timer: TimerService,
        events: Arc<Mutex<Vec<HarkEvent>>>,
    }

    impl Fixture {
        fn new() -> Self {
            let timer = TimerService::new(8);
            timer.start("engine-test-timer").unwrap();
            Self {
                host: Arc::new(MockAdapterHost::new()),
                capture: Arc::new(MockCaptureSource::new()),
                params: Arc::new(StaticParameters::default()),
                timer,
                events: Arc::new(Mutex::new(Vec::new())),
            }
        }

        fn deps(&self) -> EngineDeps {
            let events = Arc::clone(&self.events);
            EngineDeps {
                host: self.host.clone(),
                capture: self.capture.clone(),
                params: self.params.clone(),
                timer: self.timer.clone(),
                events: Some(Arc::new(move |e: HarkEvent| events.lock().push(e))),
            }
        }

        fn engine(&self, kind: EngineKind, timeouts: ProfileTimeouts) -> WakeEngine {
            WakeEngine::with_profile(
                WakeupProfile::new(kind, timeouts),
                CaptureConfig {
                    read_wait_ms: 50,
                    ..CaptureConfig::default()
                },
                16,
                self.deps(),
            )
            .unwrap()
        }

        fn adapter(&self, kind: EngineKind) -> Arc<MockAdapter> {
            self.host.adapter(kind)
        }
    }

    impl Drop for Fixture {
        fn drop(&mut self) {
            self.timer.stop();
        }
    }

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<WakeEvent>>,
    }

    impl WakeListener for Recorder {
        fn on_wake_event(&self, event: &WakeEvent) {
            self.events.lock().push(event.clone());
        }
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

    fn long_timeouts() -> ProfileTimeouts {
        ProfileTimeouts {
            recognizing_ms: 5_000,
            recognized_ms: 5_000,
            read_capturer_ms: 5_000,
        }
    }

    fn initialized(fx: &Fixture, kind: EngineKind, timeouts: ProfileTimeouts) -> WakeEngine {
        let engine = fx.engine(kind, timeouts);
        engine.init().unwrap();
        assert!(wait_for(&engine, EngineState::Initialized));
        engine
    }

    #[test]
    fn test_init_reaches_initialized_after_init_done() {
        let fx = Fixture::new();
        let adapter = fx.adapter(EngineKind::Standard);
        adapter.set_init_done_result(None);

        let engine = fx.engine(EngineKind::Standard, long_timeouts());
        engine.init().unwrap();
        assert_eq!(engine.state(), EngineState::Initializing);

        assert!(adapter.fire(AdapterEvent::init_done(SUCCESS)));
        assert!(wait_for(&engine, EngineState::Initialized));
    }

    #[test]
    fn test_attach_failure_stays_idle() {
        let fx = Fixture::new();
        fx.adapter(EngineKind::Standard)
            .fail_attach
            .store(true, Ordering::SeqCst);

        let engine = fx.engine(EngineKind::Standard, long_timeouts());
        let err = engine.init().unwrap_err();
        assert!(matches!(err, HarkError::Adapter(_)));
        assert_eq!(engine.state(), EngineState::Idle);
        assert_eq!(fx.host.release_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_init_done_failure_stays_initializing() {
        let fx = Fixture::new();
        let adapter = fx.adapter(EngineKind::Standard);
        adapter.set_init_done_result(None);

        let engine = fx.engine(EngineKind::Standard, long_timeouts());
        engine.init().unwrap();
        let err = engine.handle(EngineMsg::InitDone(-1)).unwrap_err();
        assert!(matches!(err, HarkError::Adapter(_)));
        assert_eq!(engine.state(), EngineState::Initializing);

        engine.release().unwrap();
        assert_eq!(engine.state(), EngineState::Idle);
    }

    #[test]
    fn test_recognize_then_read_capture() {
        let fx = Fixture::new();
        let engine = initialized(&fx, EngineKind::Standard, long_timeouts());
        let adapter = fx.adapter(EngineKind::Standard);
        let recorder = Arc::new(Recorder::default());
        engine.set_listener(Some(recorder.clone())).unwrap();

        engine.start(ModelUuid::VOICE_WAKEUP).unwrap();
        assert_eq!(engine.state(), EngineState::Recognizing);
        assert_eq!(fx.capture.starts(), 1);
        assert_eq!(adapter.get_parameter("WakeupType").unwrap(), "0");

        fx.capture.push(&[1, 0, 2, 0]);
        assert_eq!(adapter.written(), vec![1, 0, 2, 0]);

        adapter.fire(AdapterEvent::recognize_complete(SUCCESS, "score=90"));
        assert!(wait_for(&engine, EngineState::Recognized));
        assert_eq!(
            recorder.events.lock().as_slice(),
            &[WakeEvent::RecognizeComplete {
                result: SUCCESS,
                info: "score=90".into()
            }]
        );
        assert_eq!(MockAdapter::count(&adapter.stop_calls), 1);

        engine.start_capturer(0b1).unwrap();
        assert_eq!(engine.state(), EngineState::ReadCapturer);
        fx.capture.push(&[7, 7]);
        assert_eq!(engine.read().unwrap(), vec![1, 0, 2, 0]);
        assert_eq!(engine.read().unwrap(), vec![7, 7]);

        engine.stop_capturer().unwrap();
        assert_eq!(engine.state(), EngineState::Initialized);
        assert_eq!(fx.capture.starts(), 1);
        assert_eq!(fx.capture.stops(), 1);
        assert_eq!(MockAdapter::count(&adapter.stop_calls), 2);
    }

    #[test]
    fn test_record_start_only_on_single_stage() {
        let fx = Fixture::new();
        let engine = initialized(&fx, EngineKind::Standard, long_timeouts());
        engine.start(ModelUuid::VOICE_WAKEUP).unwrap();
        engine
            .handle(EngineMsg::RecognizeComplete { result: 0, info: String::new() })
            .unwrap();
        assert_eq!(engine.state(), EngineState::Recognized);

        assert!(engine.record_start(1).unwrap_err().is_not_applicable());
        assert_eq!(engine.state(), EngineState::Recognized);
    }

    #[test]
    fn test_rejected_recognition_returns_to_initialized() {
        let fx = Fixture::new();
        let engine = initialized(&fx, EngineKind::Standard, long_timeouts());
        engine.start(ModelUuid::VOICE_WAKEUP).unwrap();

        engine
            .handle(EngineMsg::RecognizeComplete {
                result: 1,
                info: String::new(),
            })
            .unwrap();
        assert_eq!(engine.state(), EngineState::Initialized);
        assert_eq!(fx.capture.stops(), 1);
    }

    #[test]
    fn test_recognizing_timeout_stops_capture_once() {
        let fx = Fixture::new();
        let engine = initialized(
            &fx,
            EngineKind::Standard,
            ProfileTimeouts {
                recognizing_ms: 40,
                ..long_timeouts()
            },
        );
        engine.start(ModelUuid::VOICE_WAKEUP).unwrap();
        assert!(wait_for(&engine, EngineState::Initialized));
        std::thread::sleep(Duration::from_millis(60));
        assert_eq!(fx.capture.stops(), 1);
        assert_eq!(MockAdapter::count(&fx.adapter(EngineKind::Standard).stop_calls), 1);
    }

    #[test]
    fn test_stop_capturer_in_initialized_is_noop() {
        let fx = Fixture::new();
        let engine = initialized(&fx, EngineKind::Standard, long_timeouts());
        engine.stop_capturer().unwrap();
        engine.stop_capturer().unwrap();
        engine.stop().unwrap();
        assert_eq!(engine.state(), EngineState::Initialized);
        assert_eq!(fx.capture.stops(), 0);
    }

    #[test]
    fn test_capture_start_failure_stops_adapter() {
        let fx = Fixture::new();
        let engine = initialized(&fx, EngineKind::Standard, long_timeouts());
        fx.capture.fail_start.store(true, Ordering::SeqCst);

        let err = engine.start(ModelUuid::VOICE_WAKEUP).unwrap_err();
        assert!(matches!(err, HarkError::Capture(_)));
        assert_eq!(engine.state(), EngineState::Initialized);
        assert_eq!(MockAdapter::count(&fx.adapter(EngineKind::Standard).stop_calls), 1);
    }

    #[test]
    fn test_read_extends_deadline() {
        let fx = Fixture::new();
        let engine = initialized(
            &fx,
            EngineKind::Standard,
            ProfileTimeouts {
                read_capturer_ms: 150,
                ..long_timeouts()
            },
        );
        engine.start(ModelUuid::VOICE_WAKEUP).unwrap();
        engine.handle(EngineMsg::RecognizeComplete { result: 0, info: String::new() }).unwrap();
        engine.start_capturer(1).unwrap();

        for _ in 0..4 {
            std::thread::sleep(Duration::from_millis(75));
            fx.capture.push(&[1, 1]);
            engine.read().unwrap();
        }
        assert_eq!(engine.state(), EngineState::ReadCapturer);
        assert!(wait_for(&engine, EngineState::Initialized));
    }

    #[test]
    fn test_proximal_model_writes_two_channels() {
        let fx = Fixture::new();
        fx.params.set(WAKEUP_SOURCE_CHANNEL, "4");
        let engine = initialized(&fx, EngineKind::Standard, long_timeouts());
        let adapter = fx.adapter(EngineKind::Standard);

        assert_eq!(engine.get_parameter(WAKEUP_SOURCE_CHANNEL).unwrap(), "4");
        engine.start(ModelUuid::PROXIMAL_WAKEUP).unwrap();
        assert_eq!(adapter.get_parameter("WakeupType").unwrap(), "3");
        assert_eq!(fx.capture.last_format().unwrap().buffer_size, 640 * 4);

        fx.capture.push(&[0, 0, 1, 1, 2, 2, 3, 3]);
        assert_eq!(adapter.written(), vec![0, 0, 1, 1]);

        fx.capture.finish();
        assert_eq!(adapter.get_parameter("end_of_pcm").unwrap(), "true");
        fx.capture.push(&[9, 9, 9, 9, 9, 9, 9, 9]);
        assert_eq!(adapter.written().len(), 4);
    }

    #[test]
    fn test_set_param_before_init_is_replayed() {
        let fx = Fixture::new();
        let engine = fx.engine(EngineKind::Standard, long_timeouts());
        engine.set_parameter("sensitivity=3").unwrap();
        assert!(engine.set_parameter("garbage").is_err());

        engine.init().unwrap();
        let adapter = fx.adapter(EngineKind::Standard);
        assert_eq!(adapter.get_parameter("sensitivity").unwrap(), "3");
    }

    #[test]
    fn test_release_adapter_then_reset() {
        let fx = Fixture::new();
        let engine = initialized(&fx, EngineKind::Standard, long_timeouts());
        let adapter = fx.adapter(EngineKind::Standard);

        engine.release_adapter().unwrap();
        assert_eq!(engine.state(), EngineState::Idle);
        assert_eq!(MockAdapter::count(&adapter.detach_calls), 0);

        engine.reset_adapter().unwrap();
        assert!(wait_for(&engine, EngineState::Initialized));
        assert_eq!(MockAdapter::count(&adapter.attach_calls), 2);
    }

    #[test]
    fn test_headset_reconfirms_and_has_no_get_param() {
        let fx = Fixture::new();
        let engine = initialized(&fx, EngineKind::Headset, long_timeouts());
        let recorder = Arc::new(Recorder::default());
        engine.set_listener(Some(recorder.clone())).unwrap();

        assert!(engine.get_parameter("anything").unwrap_err().is_not_applicable());

        engine.start(ModelUuid::VOICE_WAKEUP).unwrap();
        assert!(fx.adapter(EngineKind::Headset).get_parameter("WakeupType").is_err());
        engine
            .handle(EngineMsg::RecognizeComplete { result: 0, info: String::new() })
            .unwrap();
        let events = recorder.events.lock().clone();
        assert_eq!(events[1], WakeEvent::HeadsetVerified { confirmed: true });
    }

    #[test]
    fn test_single_stage_runs_without_adapter() {
        let fx = Fixture::new();
        let engine = fx.engine(
            EngineKind::SingleStage,
            ProfileTimeouts {
                recognizing_ms: 0,
                ..long_timeouts()
            },
        );
        engine.init().unwrap();
        assert_eq!(engine.state(), EngineState::Initialized);

        engine.start(ModelUuid::VOICE_WAKEUP).unwrap();
        assert_eq!(engine.state(), EngineState::Recognized);
        assert_eq!(fx.host.create_calls.load(Ordering::SeqCst), 0);

        engine.record_start(7).unwrap();
        assert_eq!(engine.state(), EngineState::Recognized);
        engine.record_start(0).unwrap();
        assert_eq!(engine.state(), EngineState::Initialized);
        assert_eq!(fx.capture.stops(), 1);

        assert!(engine.set_parameter("a=1").unwrap_err().is_not_applicable());
        engine.release().unwrap();
        assert_eq!(engine.state(), EngineState::Idle);
    }

    #[test]
    fn test_requested_start_runs_on_worker() {
        let fx = Fixture::new();
        let engine = initialized(&fx, EngineKind::Standard, long_timeouts());

        engine.request_start(ModelUuid::VOICE_WAKEUP).unwrap();
        assert!(wait_for(&engine, EngineState::Recognizing));
        assert_eq!(fx.capture.starts(), 1);
    }

    #[test]
    fn test_requested_start_failure_is_published() {
        let fx = Fixture::new();
        let engine = initialized(&fx, EngineKind::Standard, long_timeouts());
        fx.capture.fail_start.store(true, Ordering::SeqCst);

        engine.request_start(ModelUuid::VOICE_WAKEUP).unwrap();
        // Round trip ordered after the posted start.
        engine.stop().unwrap();
        assert_eq!(engine.state(), EngineState::Initialized);

        let failures: Vec<_> = fx
            .events
            .lock()
            .iter()
            .filter_map(|e| match e {
                HarkEvent::RecognitionStartFailed { kind, state, .. } => {
                    Some((*kind, state.clone()))
                }
                _ => None,
            })
            .collect();
        assert_eq!(failures, vec![(EngineKind::Standard, "Initialized".to_string())]);
    }

    #[test]
    fn test_requested_start_in_wrong_state_is_published() {
        let fx = Fixture::new();
        let engine = fx.engine(EngineKind::Standard, long_timeouts());

        engine.request_start(ModelUuid::VOICE_WAKEUP).unwrap();
        assert_eq!(engine.get_parameter(WAKEUP_SOURCE_CHANNEL).unwrap(), "1");

        let codes: Vec<_> = fx
            .events
            .lock()
            .iter()
            .filter_map(|e| match e {
                HarkEvent::RecognitionStartFailed { code, .. } => Some(*code),
                _ => None,
            })
            .collect();
        assert_eq!(codes, vec![-2]);
    }

    #[test]
    fn test_transitions_are_published() {
        let fx = Fixture::new();
        let engine = initialized(&fx, EngineKind::Standard, long_timeouts());
        engine.shutdown();

        let names: Vec<_> = fx.events.lock().iter().map(|e| e.event_name()).collect();
        assert_eq!(names.first(), Some(&"engine_created"));
        assert_eq!(names.last(), Some(&"engine_released"));
        assert!(names.contains(&"engine_state_changed"));
    }
}
