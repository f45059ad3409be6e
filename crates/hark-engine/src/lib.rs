//! Hark engine crate - wake-engine lifecycle state machines.
//!
//! Each [`WakeEngine`] drives one hardware adapter and the shared audio
//! capture source through `Idle -> Initializing -> Initialized ->
//! Recognizing -> Recognized -> ReadCapturer`. The three profiles (standard,
//! headset, single-stage) share one handler table builder parameterized by
//! [`WakeupProfile`]. [`EngineManager`] owns the engines of a service.

pub mod adapter;
pub mod audio;
pub mod engine;
pub mod manager;
pub mod profile;
pub mod source;
pub mod state;
mod wakeup;

pub use adapter::{
    AdapterCallback, AdapterEvent, AdapterEventKind, AdapterHost, AdapterInfo, MockAdapter,
    MockAdapterHost, StartInfo, WakeAdapter,
};
pub use audio::{AudioCaptureSource, BufferCallback, CaptureFormat, EndCallback, MockCaptureSource};
pub use engine::{EngineDeps, ParameterSource, StaticParameters, WakeEngine};
pub use manager::EngineManager;
pub use profile::WakeupProfile;
pub use source::{deinterleave, SourceBuffer};
pub use state::{EngineEvent, EngineMsg, EngineReply, EngineState, WakeEvent, WakeListener};

/// Trigger parameter holding the capture channel count.
pub const WAKEUP_SOURCE_CHANNEL: &str = "wakeup_source_channel";
/// Trigger parameter holding the enrolled wake phrase.
pub const WAKEUP_PHRASE: &str = "wakeup_phrase";
