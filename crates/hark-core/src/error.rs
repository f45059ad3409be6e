use thiserror::Error;

/// Code returned for a successful operation at the service boundary.
pub const SUCCESS: i32 = 0;

/// Top-level error type for the Hark voice-trigger service.
///
/// Subsystem crates define their own error types and implement
/// `From<SubsystemError> for HarkError` so that the `?` operator works across
/// crate boundaries. Every variant maps to a stable integer code via
/// [`HarkError::code`], which is what callers of the exposed API observe.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum HarkError {
    #[error("Configuration error: {0}")]
    Config(String),

    /// The current state has no handler for the event. Not a failure: callers
    /// may test event applicability this way.
    #[error("Event {event} not applicable in state {state}")]
    NotApplicable { state: String, event: String },

    #[error("Timer error: {0}")]
    Timer(String),

    #[error("Dispatch error: {0}")]
    Dispatch(String),

    #[error("Adapter error: {0}")]
    Adapter(String),

    #[error("Capture error: {0}")]
    Capture(String),

    #[error("Engine error: {0}")]
    Engine(String),

    #[error("Trigger error: {0}")]
    Trigger(String),

    /// A trigger connector module call failed with a native error code.
    #[error("Connector call {op} failed with code {code}")]
    Connector { op: &'static str, code: i32 },

    #[error("Unknown model: {0}")]
    UnknownModel(i32),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Shutdown in progress")]
    ShuttingDown,
}

impl HarkError {
    /// Integer result code reported to the calling service.
    ///
    /// Connector failures surface the native code unchanged.
    pub fn code(&self) -> i32 {
        match self {
            HarkError::Config(_) => -1,
            HarkError::NotApplicable { .. } => -2,
            HarkError::Timer(_) => -3,
            HarkError::Dispatch(_) => -4,
            HarkError::Adapter(_) => -5,
            HarkError::Capture(_) => -6,
            HarkError::Engine(_) => -7,
            HarkError::Trigger(_) => -8,
            HarkError::Connector { code, .. } => *code,
            HarkError::UnknownModel(_) => -9,
            HarkError::InvalidArgument(_) => -10,
            HarkError::Io(_) => -11,
            HarkError::Serialization(_) => -12,
            HarkError::ShuttingDown => -13,
        }
    }

    /// Returns `true` for the "no handler in this state" outcome.
    pub fn is_not_applicable(&self) -> bool {
        matches!(self, HarkError::NotApplicable { .. })
    }
}

impl From<toml::de::Error> for HarkError {
    fn from(err: toml::de::Error) -> Self {
        HarkError::Config(err.to_string())
    }
}

impl From<toml::ser::Error> for HarkError {
    fn from(err: toml::ser::Error) -> Self {
        HarkError::Config(err.to_string())
    }
}

impl From<serde_json::Error> for HarkError {
    fn from(err: serde_json::Error) -> Self {
        HarkError::Serialization(err.to_string())
    }
}

/// A specialized `Result` type for Hark operations.
pub type Result<T> = std::result::Result<T, HarkError>;

/// Collapse a result into the integer code convention of the exposed API.
pub fn result_code<T>(result: &Result<T>) -> i32 {
    match result {
        Ok(_) => SUCCESS,
        Err(e) => e.code(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = HarkError::Config("missing field".to_string());
        assert_eq!(err.to_string(), "Configuration error: missing field");
    }

    #[test]
    fn test_not_applicable_display_and_code() {
        let err = HarkError::NotApplicable {
            state: "Idle".to_string(),
            event: "Read".to_string(),
        };
        assert_eq!(err.to_string(), "Event Read not applicable in state Idle");
        assert_eq!(err.code(), -2);
        assert!(err.is_not_applicable());
    }

    #[test]
    fn test_connector_code_passes_through() {
        let err = HarkError::Connector {
            op: "load_model",
            code: -37,
        };
        assert_eq!(err.code(), -37);
        assert!(!err.is_not_applicable());
    }

    #[test]
    fn test_codes_are_negative_and_distinct() {
        let errors: Vec<HarkError> = vec![
            HarkError::Config("x".into()),
            HarkError::NotApplicable {
                state: "s".into(),
                event: "e".into(),
            },
            HarkError::Timer("x".into()),
            HarkError::Dispatch("x".into()),
            HarkError::Adapter("x".into()),
            HarkError::Capture("x".into()),
            HarkError::Engine("x".into()),
            HarkError::Trigger("x".into()),
            HarkError::UnknownModel(7),
            HarkError::InvalidArgument("x".into()),
            HarkError::Serialization("x".into()),
            HarkError::ShuttingDown,
        ];
        let mut codes: Vec<i32> = errors.iter().map(|e| e.code()).collect();
        assert!(codes.iter().all(|c| *c < 0));
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), errors.len());
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: HarkError = io_err.into();
        assert!(matches!(err, HarkError::Io(_)));
        assert!(err.to_string().contains("file not found"));
    }

    #[test]
    fn test_error_from_toml_de() {
        let err: std::result::Result<toml::Value, _> = toml::from_str("invalid = [[[");
        let hark_err: HarkError = err.unwrap_err().into();
        assert!(matches!(hark_err, HarkError::Config(_)));
    }

    #[test]
    fn test_error_from_serde_json() {
        let err: std::result::Result<serde_json::Value, _> = serde_json::from_str("{ nope }");
        let hark_err: HarkError = err.unwrap_err().into();
        assert!(matches!(hark_err, HarkError::Serialization(_)));
    }

    #[test]
    fn test_result_code() {
        let ok: Result<()> = Ok(());
        let err: Result<()> = Err(HarkError::Adapter("attach".into()));
        assert_eq!(result_code(&ok), SUCCESS);
        assert_eq!(result_code(&err), -5);
    }
}
