use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// =============================================================================
// Enums
// =============================================================================

/// Which wake-engine profile an engine instance runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineKind {
    /// Two-stage wakeup driving the on-device adapter.
    Standard,
    /// Wakeup verified by a connected headset.
    Headset,
    /// Single-stage wakeup: no adapter, capture only.
    SingleStage,
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineKind::Standard => write!(f, "standard"),
            EngineKind::Headset => write!(f, "headset"),
            EngineKind::SingleStage => write!(f, "single_stage"),
        }
    }
}

/// Active audio scene reported by the platform audio policy.
///
/// Anything other than [`AudioScene::Default`] suppresses wake detection.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AudioScene {
    #[default]
    Default,
    Ringing,
    PhoneCall,
    VoiceChat,
}

/// Posture of a foldable device.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FoldPosture {
    #[default]
    Unknown,
    Expanded,
    Folded,
    HalfFolded,
}

impl FoldPosture {
    /// Value forwarded to the connector module as the `fold_posture` parameter.
    pub fn as_param(&self) -> &'static str {
        match self {
            FoldPosture::Unknown => "0",
            FoldPosture::Expanded => "1",
            FoldPosture::Folded => "2",
            FoldPosture::HalfFolded => "3",
        }
    }
}

// =============================================================================
// Newtype Wrappers - Identity
// =============================================================================

/// Integer id of a registered wake model.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ModelUuid(pub i32);

impl ModelUuid {
    /// The regular voice wakeup model.
    pub const VOICE_WAKEUP: ModelUuid = ModelUuid(1);
    /// The whisper (proximal) wakeup model.
    pub const PROXIMAL_WAKEUP: ModelUuid = ModelUuid(2);

    /// Whisper wakeup reads the near-field capture channel.
    pub fn is_proximal(&self) -> bool {
        *self == Self::PROXIMAL_WAKEUP
    }
}

impl fmt::Display for ModelUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a wake-engine instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EngineId(pub Uuid);

impl EngineId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for EngineId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EngineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// Newtype Wrappers - Temporal
// =============================================================================

/// Unix timestamp in milliseconds since epoch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(pub i64);

impl Timestamp {
    pub fn now() -> Self {
        Self(Utc::now().timestamp_millis())
    }

    pub fn from_datetime(dt: DateTime<Utc>) -> Self {
        Self(dt.timestamp_millis())
    }

    pub fn to_datetime(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.0).unwrap_or_default()
    }
}

// =============================================================================
// Audio format
// =============================================================================

/// Capture channel count, clamped to what the wakeup source supports.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelCount(u8);

impl ChannelCount {
    pub const MONO: ChannelCount = ChannelCount(1);
    pub const MAX: u8 = 4;

    pub fn new(count: u8) -> std::result::Result<Self, &'static str> {
        if count == 0 || count > Self::MAX {
            return Err("channel count must be between 1 and 4");
        }
        Ok(Self(count))
    }

    /// Parse a parameter value, falling back to mono when absent or invalid.
    pub fn parse_or_mono(value: &str) -> Self {
        value
            .trim()
            .parse::<u8>()
            .ok()
            .and_then(|n| Self::new(n).ok())
            .unwrap_or(Self::MONO)
    }

    pub fn get(&self) -> u8 {
        self.0
    }
}

impl Default for ChannelCount {
    fn default() -> Self {
        Self::MONO
    }
}

impl fmt::Display for ChannelCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_kind_serialization() {
        let json = serde_json::to_string(&EngineKind::SingleStage).unwrap();
        assert_eq!(json, "\"single_stage\"");
        let back: EngineKind = serde_json::from_str("\"headset\"").unwrap();
        assert_eq!(back, EngineKind::Headset);
    }

    #[test]
    fn test_engine_kind_display() {
        assert_eq!(EngineKind::Standard.to_string(), "standard");
        assert_eq!(EngineKind::SingleStage.to_string(), "single_stage");
    }

    #[test]
    fn test_audio_scene_default() {
        assert_eq!(AudioScene::default(), AudioScene::Default);
    }

    #[test]
    fn test_fold_posture_param() {
        assert_eq!(FoldPosture::default().as_param(), "0");
        assert_eq!(FoldPosture::Folded.as_param(), "2");
    }

    #[test]
    fn test_model_uuid_proximal() {
        assert!(ModelUuid::PROXIMAL_WAKEUP.is_proximal());
        assert!(!ModelUuid::VOICE_WAKEUP.is_proximal());
        assert!(!ModelUuid(42).is_proximal());
    }

    #[test]
    fn test_engine_id_unique() {
        assert_ne!(EngineId::new(), EngineId::new());
    }

    #[test]
    fn test_timestamp_to_datetime_roundtrip() {
        let now = Utc::now();
        let ts = Timestamp::from_datetime(now);
        assert_eq!(ts.to_datetime().timestamp_millis(), now.timestamp_millis());
    }

    #[test]
    fn test_channel_count_validation() {
        assert!(ChannelCount::new(0).is_err());
        assert!(ChannelCount::new(5).is_err());
        assert_eq!(ChannelCount::new(4).unwrap().get(), 4);
    }

    #[test]
    fn test_channel_count_parse_or_mono() {
        assert_eq!(ChannelCount::parse_or_mono("2").get(), 2);
        assert_eq!(ChannelCount::parse_or_mono(" 4 ").get(), 4);
        assert_eq!(ChannelCount::parse_or_mono(""), ChannelCount::MONO);
        assert_eq!(ChannelCount::parse_or_mono("9"), ChannelCount::MONO);
        assert_eq!(ChannelCount::parse_or_mono("abc"), ChannelCount::MONO);
    }
}
