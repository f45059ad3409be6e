//! Handler tables of the wake-engine machines.
//!
//! All three profiles register into the same state graph; the profile
//! decides which clauses exist and how long each wait-until lasts. Handlers
//! run on the machine worker and own the adapter and capture session.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use hark_core::config::CaptureConfig;
use hark_core::{
    ChannelCount, EngineId, EventSink, HarkError, HarkEvent, Result, Timestamp, SUCCESS,
};
use hark_dispatch::{Message, Poster, StateMachineBuilder, Transition};
use tracing::{debug, error, info, warn};

use crate::adapter::{
    AdapterEvent, AdapterEventKind, AdapterHost, AdapterInfo, StartInfo, WakeAdapter,
};
use crate::audio::{AudioCaptureSource, BufferCallback, CaptureFormat, EndCallback};
use crate::engine::ParameterSource;
use crate::profile::WakeupProfile;
use crate::source::{deinterleave, SourceBuffer};
use crate::state::{EngineEvent, EngineMsg, EngineReply, EngineState, WakeEvent, WakeListener};
use crate::{WAKEUP_PHRASE, WAKEUP_SOURCE_CHANNEL};

pub(crate) type WakeupBuilder =
    StateMachineBuilder<WakeupContext, EngineState, EngineMsg, EngineReply>;

type Step = Result<EngineReply>;

/// Collaborators a context is built from.
pub(crate) struct ContextParts {
    pub profile: WakeupProfile,
    pub engine_id: EngineId,
    pub capture_config: CaptureConfig,
    pub host: Arc<dyn AdapterHost>,
    pub capture: Arc<dyn AudioCaptureSource>,
    pub params: Arc<dyn ParameterSource>,
    pub events: Option<EventSink>,
}

/// State owned by one engine worker.
pub(crate) struct WakeupContext {
    profile: WakeupProfile,
    engine_id: EngineId,
    capture_config: CaptureConfig,
    host: Arc<dyn AdapterHost>,
    capture: Arc<dyn AudioCaptureSource>,
    params: Arc<dyn ParameterSource>,
    events: Option<EventSink>,
    poster: Poster<EngineMsg, EngineReply>,
    adapter: Option<Arc<dyn WakeAdapter>>,
    listener: Option<Arc<dyn WakeListener>>,
    /// Every `key=value` set so far, replayed on (re)attach.
    adapter_params: Vec<String>,
    source: Arc<SourceBuffer>,
    channels: ChannelCount,
    read_mask: u8,
    proximal: bool,
    capturing: bool,
}

fn mismatched(msg: &EngineMsg) -> HarkError {
    HarkError::Engine(format!("handler received {:?}", msg.event()))
}

fn param_key(kv: &str) -> Option<&str> {
    kv.split_once('=').map(|(key, _)| key.trim())
}

impl WakeupContext {
    pub(crate) fn new(parts: ContextParts, poster: Poster<EngineMsg, EngineReply>) -> Self {
        let source = Arc::new(SourceBuffer::new(parts.capture_config.max_queued_frames));
        Self {
            profile: parts.profile,
            engine_id: parts.engine_id,
            capture_config: parts.capture_config,
            host: parts.host,
            capture: parts.capture,
            params: parts.params,
            events: parts.events,
            poster,
            adapter: None,
            listener: None,
            adapter_params: Vec::new(),
            source,
            channels: ChannelCount::MONO,
            read_mask: 1,
            proximal: false,
            capturing: false,
        }
    }

    // =========================================================================
    // Resource helpers
    // =========================================================================

    fn attached(&self) -> Result<Arc<dyn WakeAdapter>> {
        self.adapter
            .clone()
            .ok_or_else(|| HarkError::Adapter(format!("no {} adapter attached", self.profile.kind)))
    }

    fn refresh_channels(&mut self) {
        let value = self
            .params
            .parameter(WAKEUP_SOURCE_CHANNEL)
            .unwrap_or_default();
        self.channels = ChannelCount::parse_or_mono(&value);
        self.source.init(self.channels);
        debug!(engine = %self.engine_id, channels = %self.channels, "Capture channels configured");
    }

    fn adapter_info(&self) -> AdapterInfo {
        AdapterInfo {
            wakeup_phrase: self.params.parameter(WAKEUP_PHRASE).unwrap_or_default(),
            min_buffer_size: self.capture_config.min_buffer_size,
            channels: self.channels.get(),
            bits_per_sample: self.capture_config.bits_per_sample,
            sample_rate: self.capture_config.sample_rate,
        }
    }

    fn attach_adapter(&mut self) -> Result<()> {
        let kind = self.profile.kind;
        let adapter = self.host.create_adapter(kind)?;

        let poster = self.poster.clone();
        let engine_id = self.engine_id;
        adapter.set_callback(Arc::new(move |event: AdapterEvent| {
            let msg = match event.kind {
                AdapterEventKind::InitDone => EngineMsg::InitDone(event.result),
                AdapterEventKind::RecognizeComplete => EngineMsg::RecognizeComplete {
                    result: event.result,
                    info: event.info,
                },
            };
            if let Err(e) = poster.post(msg) {
                warn!(engine = %engine_id, error = %e, "Dropped adapter event");
            }
        }));

        if let Err(e) = adapter.attach(&self.adapter_info()) {
            error!(engine = %self.engine_id, %kind, error = %e, "Adapter attach failed");
            self.host.release_adapter(kind);
            return Err(e);
        }
        for kv in &self.adapter_params {
            if let Err(e) = adapter.set_parameter(kv) {
                warn!(engine = %self.engine_id, param = %kv, error = %e, "Failed to replay adapter parameter");
            }
        }
        self.adapter = Some(adapter);
        info!(engine = %self.engine_id, %kind, "Adapter attached");
        Ok(())
    }

    /// Detach (when the adapter is still reachable) and hand it back to the host.
    fn drop_adapter(&mut self, detach: bool) {
        let Some(adapter) = self.adapter.take() else {
            return;
        };
        if detach {
            if let Err(e) = adapter.detach() {
                warn!(engine = %self.engine_id, error = %e, "Adapter detach failed");
            }
        }
        self.host.release_adapter(self.profile.kind);
        info!(engine = %self.engine_id, kind = %self.profile.kind, "Adapter released");
    }

    fn stop_adapter(&self) {
        if let Some(adapter) = &self.adapter {
            if let Err(e) = adapter.stop() {
                warn!(engine = %self.engine_id, error = %e, "Adapter stop failed");
            }
        }
    }

    fn buffer_sink(&self, end_of_pcm: Arc<AtomicBool>) -> BufferCallback {
        let adapter = self.adapter.clone();
        let source = Arc::clone(&self.source);
        let channels = self.channels.get();
        let sample_bytes = self.capture_config.bytes_per_sample();
        let proximal = self.proximal;
        Arc::new(move |pcm: &[u8]| {
            let frames = deinterleave(pcm, channels, sample_bytes);
            if let Some(adapter) = adapter.as_ref().filter(|_| !end_of_pcm.load(Ordering::SeqCst)) {
                let written = match frames.as_slice() {
                    [first, second, ..] if proximal => {
                        let mut both = Vec::with_capacity(first.len() + second.len());
                        both.extend_from_slice(first);
                        both.extend_from_slice(second);
                        adapter.write_audio(&both)
                    }
                    [first, ..] => adapter.write_audio(first),
                    [] => Ok(()),
                };
                if let Err(e) = written {
                    debug!(error = %e, "Adapter rejected audio");
                }
            }
            if let Err(e) = source.write(&frames) {
                debug!(error = %e, "Capture frame not buffered");
            }
        })
    }

    fn end_sink(&self, end_of_pcm: Arc<AtomicBool>) -> EndCallback {
        let adapter = self.adapter.clone();
        Arc::new(move || {
            end_of_pcm.store(true, Ordering::SeqCst);
            if let Some(adapter) = &adapter {
                if let Err(e) = adapter.set_parameter("end_of_pcm=true") {
                    warn!(error = %e, "Failed to signal end of capture");
                }
            }
        })
    }

    fn start_audio(&mut self) -> Result<()> {
        if self.capturing {
            self.stop_audio();
        }
        let channels = self.channels.get();
        let format = CaptureFormat {
            buffer_size: self.capture_config.min_buffer_size * u32::from(channels),
            interval_ms: self.capture_config.interval_ms,
            sample_rate: self.capture_config.sample_rate,
            bits_per_sample: self.capture_config.bits_per_sample,
            channels,
        };
        let end_of_pcm = Arc::new(AtomicBool::new(false));
        self.source.clear();
        self.capture.start(
            &format,
            self.buffer_sink(Arc::clone(&end_of_pcm)),
            self.end_sink(end_of_pcm),
        )?;
        self.capturing = true;
        debug!(engine = %self.engine_id, channels, "Audio capture started");
        Ok(())
    }

    fn stop_audio(&mut self) {
        if self.capturing {
            self.capture.stop();
            self.capturing = false;
            debug!(engine = %self.engine_id, "Audio capture stopped");
        }
    }

    fn notify(&self, event: WakeEvent) {
        match &self.listener {
            Some(listener) => listener.on_wake_event(&event),
            None => debug!(engine = %self.engine_id, ?event, "No listener installed"),
        }
    }

    fn publish(&self, event: HarkEvent) {
        if let Some(sink) = &self.events {
            sink(event);
        }
    }

    // =========================================================================
    // Handlers valid in every state
    // =========================================================================

    fn on_set_listener(&mut self, _t: &mut Transition<EngineState>, msg: EngineMsg) -> Step {
        match msg {
            EngineMsg::SetListener(listener) => {
                self.listener = listener;
                Ok(EngineReply::Done)
            }
            other => Err(mismatched(&other)),
        }
    }

    fn on_set_param(&mut self, _t: &mut Transition<EngineState>, msg: EngineMsg) -> Step {
        let kv = match msg {
            EngineMsg::SetParam(kv) => kv,
            other => return Err(mismatched(&other)),
        };
        let key = param_key(&kv)
            .filter(|key| !key.is_empty())
            .ok_or_else(|| HarkError::InvalidArgument(format!("expected key=value, got {kv:?}")))?
            .to_string();
        if let Some(adapter) = &self.adapter {
            adapter.set_parameter(&kv)?;
        }
        self.adapter_params
            .retain(|existing| param_key(existing) != Some(key.as_str()));
        self.adapter_params.push(kv);
        Ok(EngineReply::Done)
    }

    fn on_get_param(&mut self, _t: &mut Transition<EngineState>, msg: EngineMsg) -> Step {
        let key = match msg {
            EngineMsg::GetParam(key) => key,
            other => return Err(mismatched(&other)),
        };
        if key == WAKEUP_SOURCE_CHANNEL {
            return Ok(EngineReply::Param(self.channels.to_string()));
        }
        let value = self.attached()?.get_parameter(&key)?;
        Ok(EngineReply::Param(value))
    }

    // =========================================================================
    // Adapter lifecycle
    // =========================================================================

    fn on_init(&mut self, t: &mut Transition<EngineState>, _msg: EngineMsg) -> Step {
        self.refresh_channels();
        self.attach_adapter()?;
        t.go(EngineState::Initializing);
        Ok(EngineReply::Done)
    }

    fn on_reset_adapter(&mut self, t: &mut Transition<EngineState>, _msg: EngineMsg) -> Step {
        info!(engine = %self.engine_id, params = self.adapter_params.len(), "Reattaching adapter");
        self.refresh_channels();
        self.attach_adapter()?;
        t.go(EngineState::Initializing);
        Ok(EngineReply::Done)
    }

    fn on_init_done(&mut self, t: &mut Transition<EngineState>, msg: EngineMsg) -> Step {
        let result = match msg {
            EngineMsg::InitDone(result) => result,
            other => return Err(mismatched(&other)),
        };
        if result != SUCCESS {
            error!(engine = %self.engine_id, result, "Adapter initialization failed");
            return Err(HarkError::Adapter(format!(
                "adapter init done with result {result}"
            )));
        }
        t.go(EngineState::Initialized);
        Ok(EngineReply::Done)
    }

    fn on_release(&mut self, t: &mut Transition<EngineState>, _msg: EngineMsg) -> Step {
        self.stop_audio();
        self.drop_adapter(true);
        t.go(EngineState::Idle);
        Ok(EngineReply::Done)
    }

    /// The adapter service went away: forget the adapter without detaching.
    fn on_release_adapter(&mut self, t: &mut Transition<EngineState>, _msg: EngineMsg) -> Step {
        self.stop_audio();
        self.drop_adapter(false);
        t.go(EngineState::Idle);
        Ok(EngineReply::Done)
    }

    // =========================================================================
    // Recognition
    // =========================================================================

    fn on_start_recognize(&mut self, t: &mut Transition<EngineState>, msg: EngineMsg) -> Step {
        let uuid = match msg {
            EngineMsg::StartRecognize(uuid) => uuid,
            other => return Err(mismatched(&other)),
        };
        let adapter = self.attached()?;
        self.proximal = false;
        if self.profile.serves_wakeup_pcm() {
            self.proximal = uuid.is_proximal();
            let wakeup_type = if self.proximal {
                "WakeupType=3"
            } else {
                "WakeupType=0"
            };
            adapter.set_parameter(wakeup_type)?;
        }

        adapter.start(&StartInfo { is_last: false })?;
        if let Err(e) = self.start_audio() {
            error!(engine = %self.engine_id, error = %e, "Audio capture failed to start");
            if let Err(stop_err) = adapter.stop() {
                warn!(engine = %self.engine_id, error = %stop_err, "Adapter stop failed");
            }
            return Err(e);
        }
        info!(engine = %self.engine_id, model = %uuid, "Recognition started");
        t.go(EngineState::Recognizing);
        Ok(EngineReply::Done)
    }

    /// Explicit stop and the recognizing timeout.
    fn on_stop_recognize(&mut self, t: &mut Transition<EngineState>, _msg: EngineMsg) -> Step {
        self.stop_audio();
        self.stop_adapter();
        t.go(EngineState::Initialized);
        Ok(EngineReply::Done)
    }

    fn on_recognize_complete(&mut self, t: &mut Transition<EngineState>, msg: EngineMsg) -> Step {
        let (result, info) = match msg {
            EngineMsg::RecognizeComplete { result, info } => (result, info),
            other => return Err(mismatched(&other)),
        };
        self.notify(WakeEvent::RecognizeComplete {
            result,
            info: info.clone(),
        });
        if self.profile.reconfirms() {
            self.notify(WakeEvent::HeadsetVerified {
                confirmed: result == SUCCESS,
            });
        }
        self.publish(HarkEvent::WakeupRecognized {
            engine_id: self.engine_id,
            result,
            info,
            timestamp: Timestamp::now(),
        });
        self.stop_adapter();

        if result == SUCCESS {
            info!(engine = %self.engine_id, "Wakeup recognized");
            t.go(EngineState::Recognized);
        } else {
            warn!(engine = %self.engine_id, result, "Wakeup rejected");
            self.stop_audio();
            t.go(EngineState::Initialized);
        }
        Ok(EngineReply::Done)
    }

    fn on_get_wakeup_pcm(&mut self, _t: &mut Transition<EngineState>, _msg: EngineMsg) -> Step {
        let pcm = self.attached()?.get_wakeup_pcm()?;
        Ok(EngineReply::Pcm(pcm))
    }

    fn on_write_audio(&mut self, _t: &mut Transition<EngineState>, msg: EngineMsg) -> Step {
        let pcm = match msg {
            EngineMsg::WriteAudio(pcm) => pcm,
            other => return Err(mismatched(&other)),
        };
        self.attached()?.write_audio(&pcm)?;
        Ok(EngineReply::Done)
    }

    fn on_evaluate(&mut self, _t: &mut Transition<EngineState>, msg: EngineMsg) -> Step {
        let word = match msg {
            EngineMsg::Evaluate(word) => word,
            other => return Err(mismatched(&other)),
        };
        let score = self.attached()?.evaluate(&word)?;
        Ok(EngineReply::Score(score))
    }

    // =========================================================================
    // Capture streaming
    // =========================================================================

    fn on_start_capturer(&mut self, t: &mut Transition<EngineState>, msg: EngineMsg) -> Step {
        let mask = match msg {
            EngineMsg::StartCapturer(mask) => mask,
            other => return Err(mismatched(&other)),
        };
        if mask == 0 || mask >= 1 << ChannelCount::MAX {
            return Err(HarkError::InvalidArgument(format!(
                "invalid capture channel mask {mask:#x}"
            )));
        }
        self.read_mask = mask;
        t.go(EngineState::ReadCapturer);
        Ok(EngineReply::Done)
    }

    fn on_read(&mut self, t: &mut Transition<EngineState>, _msg: EngineMsg) -> Step {
        let pcm = self
            .source
            .read(self.read_mask, self.capture_config.read_wait())?;
        t.reset_timeout();
        Ok(EngineReply::Pcm(pcm))
    }

    /// Explicit stop and the Recognized/ReadCapturer timeouts.
    fn on_stop_capturer(&mut self, t: &mut Transition<EngineState>, _msg: EngineMsg) -> Step {
        self.stop_audio();
        self.stop_adapter();
        t.go(EngineState::Initialized);
        Ok(EngineReply::Done)
    }

    /// Stopping an engine that is not running.
    fn on_already_stopped(&mut self, _t: &mut Transition<EngineState>, msg: EngineMsg) -> Step {
        debug!(engine = %self.engine_id, event = ?msg.event(), "Already stopped");
        Ok(EngineReply::Done)
    }

    // =========================================================================
    // Single-stage
    // =========================================================================

    fn on_init_capture_only(&mut self, t: &mut Transition<EngineState>, _msg: EngineMsg) -> Step {
        self.refresh_channels();
        t.go(EngineState::Initialized);
        Ok(EngineReply::Done)
    }

    fn on_start_capture_only(&mut self, t: &mut Transition<EngineState>, msg: EngineMsg) -> Step {
        let uuid = match msg {
            EngineMsg::StartRecognize(uuid) => uuid,
            other => return Err(mismatched(&other)),
        };
        self.proximal = false;
        self.start_audio()?;
        info!(engine = %self.engine_id, model = %uuid, "Single-stage capture started");
        t.go(EngineState::Recognized);
        Ok(EngineReply::Done)
    }

    /// `1` hands the running capture to a recording, `0` stops it; anything
    /// else is ignored.
    fn on_record_start(&mut self, t: &mut Transition<EngineState>, msg: EngineMsg) -> Step {
        let value = match msg {
            EngineMsg::RecordStart(value) => value,
            other => return Err(mismatched(&other)),
        };
        match value {
            0 => {
                self.stop_audio();
                t.go(EngineState::Initialized);
            }
            1 => t.go(EngineState::Initialized),
            _ => debug!(engine = %self.engine_id, value, "Ignoring record start value"),
        }
        Ok(EngineReply::Done)
    }
}

impl Drop for WakeupContext {
    fn drop(&mut self) {
        self.stop_audio();
        self.drop_adapter(true);
    }
}

// =============================================================================
// Table
// =============================================================================

/// Register the handler table for `profile`.
pub(crate) fn register(builder: &mut WakeupBuilder, profile: &WakeupProfile) {
    use EngineEvent as E;
    use EngineState::*;

    builder
        .for_range(Idle, ReadCapturer)
        .on(E::SetListener, WakeupContext::on_set_listener);
    if profile.serves_get_param() {
        builder
            .for_range(Idle, ReadCapturer)
            .on(E::GetParam, WakeupContext::on_get_param);
    }

    if profile.uses_adapter() {
        builder
            .for_range(Idle, ReadCapturer)
            .on(E::SetParam, WakeupContext::on_set_param);
        builder
            .for_state(Idle)
            .on(E::Init, WakeupContext::on_init)
            .on(E::ResetAdapter, WakeupContext::on_reset_adapter);
        builder
            .for_state(Initializing)
            .on(E::InitDone, WakeupContext::on_init_done);
        builder
            .for_state(Initialized)
            .on(E::StartRecognize, WakeupContext::on_start_recognize)
            .on(E::StopRecognize, WakeupContext::on_already_stopped)
            .on(E::StopCapturer, WakeupContext::on_already_stopped);
        builder
            .for_state(Recognizing)
            .on(E::StopRecognize, WakeupContext::on_stop_recognize)
            .on(E::RecognizeComplete, WakeupContext::on_recognize_complete);
        if let Some(delay) = profile.recognizing_timeout() {
            builder.for_state(Recognizing).wait_until(
                E::RecognizingTimeout,
                WakeupContext::on_stop_recognize,
                delay,
            );
        }
        builder
            .for_state(Recognized)
            .on(E::StartCapturer, WakeupContext::on_start_capturer)
            .on(E::StopCapturer, WakeupContext::on_stop_capturer);
        if profile.serves_wakeup_pcm() {
            builder
                .for_state(Recognized)
                .on(E::GetWakeupPcm, WakeupContext::on_get_wakeup_pcm);
        }
        builder
            .for_range(Initializing, ReadCapturer)
            .on(E::Release, WakeupContext::on_release)
            .on(E::ReleaseAdapter, WakeupContext::on_release_adapter);
        builder
            .for_range(Initialized, ReadCapturer)
            .on(E::WriteAudio, WakeupContext::on_write_audio)
            .on(E::Evaluate, WakeupContext::on_evaluate);
    } else {
        builder
            .for_state(Idle)
            .on(E::Init, WakeupContext::on_init_capture_only);
        builder
            .for_state(Initialized)
            .on(E::StartRecognize, WakeupContext::on_start_capture_only)
            .on(E::StopRecognize, WakeupContext::on_already_stopped)
            .on(E::StopCapturer, WakeupContext::on_already_stopped);
        builder
            .for_state(Recognized)
            .on(E::StartCapturer, WakeupContext::on_start_capturer)
            .on(E::StopCapturer, WakeupContext::on_stop_capturer);
        if profile.accepts_record_start() {
            builder
                .for_state(Recognized)
                .on(E::RecordStart, WakeupContext::on_record_start);
        }
        builder
            .for_range(Initialized, ReadCapturer)
            .on(E::Release, WakeupContext::on_release);
    }

    if let Some(delay) = profile.recognized_timeout() {
        builder.for_state(Recognized).wait_until(
            E::RecognizedTimeout,
            WakeupContext::on_stop_capturer,
            delay,
        );
    }
    builder
        .for_state(ReadCapturer)
        .on(E::Read, WakeupContext::on_read)
        .on(E::StopCapturer, WakeupContext::on_stop_capturer);
    if let Some(delay) = profile.read_capturer_timeout() {
        builder.for_state(ReadCapturer).wait_until(
            E::ReadCapturerTimeout,
            WakeupContext::on_stop_capturer,
            delay,
        );
    }
}
