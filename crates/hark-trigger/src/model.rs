use std::fmt;

use hark_core::ModelUuid;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerModelKind {
    Generic,
    Voice,
}

/// An enrolled wake phrase: opaque payload plus metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerModel {
    pub uuid: ModelUuid,
    pub version: i32,
    pub kind: TriggerModelKind,
    pub data: Vec<u8>,
}

impl TriggerModel {
    pub fn new(uuid: ModelUuid, version: i32, data: Vec<u8>) -> Self {
        Self {
            uuid,
            version,
            kind: TriggerModelKind::Voice,
            data,
        }
    }

    /// Models are the same when their payloads are equal.
    pub fn same_payload(&self, other: &TriggerModel) -> bool {
        self.data == other.data
    }
}

/// Connector-side id of a loaded model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModelHandle(pub i32);

impl fmt::Display for ModelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Load/start state of a model. The handle exists only once loaded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ModelState {
    #[default]
    NotLoaded,
    Loaded { handle: ModelHandle },
    Started { handle: ModelHandle },
}

impl ModelState {
    pub fn handle(&self) -> Option<ModelHandle> {
        match self {
            ModelState::NotLoaded => None,
            ModelState::Loaded { handle } | ModelState::Started { handle } => Some(*handle),
        }
    }

    pub fn is_started(&self) -> bool {
        matches!(self, ModelState::Started { .. })
    }

    pub fn is_loaded(&self) -> bool {
        !matches!(self, ModelState::NotLoaded)
    }
}

impl fmt::Display for ModelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelState::NotLoaded => write!(f, "NotLoaded"),
            ModelState::Loaded { .. } => write!(f, "Loaded"),
            ModelState::Started { .. } => write!(f, "Started"),
        }
    }
}
