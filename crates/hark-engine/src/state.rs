//! States, events and messages of the wake-engine machines.

use std::fmt;
use std::sync::Arc;

use hark_core::{HarkError, ModelUuid, Result};
use hark_dispatch::{Message, StateId};

/// Lifecycle state of a wake engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EngineState {
    /// No adapter attached.
    Idle,
    /// Adapter attached, waiting for its `InitDone`.
    Initializing,
    /// Ready to arm.
    Initialized,
    /// Adapter armed and capture running.
    Recognizing,
    /// The wake phrase was recognized; capture is still running.
    Recognized,
    /// Captured audio is being streamed to the caller.
    ReadCapturer,
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineState::Idle => write!(f, "Idle"),
            EngineState::Initializing => write!(f, "Initializing"),
            EngineState::Initialized => write!(f, "Initialized"),
            EngineState::Recognizing => write!(f, "Recognizing"),
            EngineState::Recognized => write!(f, "Recognized"),
            EngineState::ReadCapturer => write!(f, "ReadCapturer"),
        }
    }
}

impl StateId for EngineState {
    const ALL: &'static [Self] = &[
        EngineState::Idle,
        EngineState::Initializing,
        EngineState::Initialized,
        EngineState::Recognizing,
        EngineState::Recognized,
        EngineState::ReadCapturer,
    ];
}

/// Handler table key of an [`EngineMsg`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineEvent {
    SetListener,
    SetParam,
    GetParam,
    Init,
    InitDone,
    StartRecognize,
    StopRecognize,
    RecognizeComplete,
    StartCapturer,
    Read,
    StopCapturer,
    GetWakeupPcm,
    RecordStart,
    ResetAdapter,
    Release,
    ReleaseAdapter,
    WriteAudio,
    Evaluate,
    RecognizingTimeout,
    RecognizedTimeout,
    ReadCapturerTimeout,
}

/// Notification delivered to the engine's listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WakeEvent {
    RecognizeComplete { result: i32, info: String },
    /// Headset profile: whether the headset wake was confirmed on device.
    HeadsetVerified { confirmed: bool },
}

/// Receives recognition results. Called on the engine worker; must not
/// call back into the same engine synchronously.
pub trait WakeListener: Send + Sync {
    fn on_wake_event(&self, event: &WakeEvent);
}

pub enum EngineMsg {
    SetListener(Option<Arc<dyn WakeListener>>),
    /// A `key=value` pair for the adapter.
    SetParam(String),
    GetParam(String),
    Init,
    InitDone(i32),
    StartRecognize(ModelUuid),
    StopRecognize,
    RecognizeComplete { result: i32, info: String },
    /// Channel bit-mask used by subsequent reads.
    StartCapturer(u8),
    Read,
    StopCapturer,
    GetWakeupPcm,
    RecordStart(i32),
    ResetAdapter,
    Release,
    ReleaseAdapter,
    WriteAudio(Vec<u8>),
    Evaluate(String),
    Timeout(EngineEvent),
}

impl Message for EngineMsg {
    type Event = EngineEvent;

    fn event(&self) -> EngineEvent {
        match self {
            EngineMsg::SetListener(_) => EngineEvent::SetListener,
            EngineMsg::SetParam(_) => EngineEvent::SetParam,
            EngineMsg::GetParam(_) => EngineEvent::GetParam,
            EngineMsg::Init => EngineEvent::Init,
            EngineMsg::InitDone(_) => EngineEvent::InitDone,
            EngineMsg::StartRecognize(_) => EngineEvent::StartRecognize,
            EngineMsg::StopRecognize => EngineEvent::StopRecognize,
            EngineMsg::RecognizeComplete { .. } => EngineEvent::RecognizeComplete,
            EngineMsg::StartCapturer(_) => EngineEvent::StartCapturer,
            EngineMsg::Read => EngineEvent::Read,
            EngineMsg::StopCapturer => EngineEvent::StopCapturer,
            EngineMsg::GetWakeupPcm => EngineEvent::GetWakeupPcm,
            EngineMsg::RecordStart(_) => EngineEvent::RecordStart,
            EngineMsg::ResetAdapter => EngineEvent::ResetAdapter,
            EngineMsg::Release => EngineEvent::Release,
            EngineMsg::ReleaseAdapter => EngineEvent::ReleaseAdapter,
            EngineMsg::WriteAudio(_) => EngineEvent::WriteAudio,
            EngineMsg::Evaluate(_) => EngineEvent::Evaluate,
            EngineMsg::Timeout(event) => *event,
        }
    }

    fn timeout(event: EngineEvent) -> Self {
        EngineMsg::Timeout(event)
    }
}

/// Successful outcome of a handled message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineReply {
    Done,
    Param(String),
    Pcm(Vec<u8>),
    Score(i32),
}

impl EngineReply {
    pub fn into_param(self) -> Result<String> {
        match self {
            EngineReply::Param(value) => Ok(value),
            other => Err(unexpected_reply(&other)),
        }
    }

    pub fn into_pcm(self) -> Result<Vec<u8>> {
        match self {
            EngineReply::Pcm(pcm) => Ok(pcm),
            other => Err(unexpected_reply(&other)),
        }
    }

    pub fn into_score(self) -> Result<i32> {
        match self {
            EngineReply::Score(score) => Ok(score),
            other => Err(unexpected_reply(&other)),
        }
    }
}

fn unexpected_reply(reply: &EngineReply) -> HarkError {
    HarkError::Engine(format!("unexpected reply {reply:?}"))
}

// =============================================================================
// Tests
// =============================================================================
