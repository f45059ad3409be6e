//! Error types for the timer and dispatch layer.

use hark_core::error::HarkError;

/// Errors from the timer service and state machines.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("Timer service is not started")]
    NotStarted,
    #[error("Timer id pool exhausted ({0} timers armed)")]
    PoolExhausted(usize),
    #[error("Failed to build timer runtime: {0}")]
    Runtime(String),
    #[error("Failed to spawn worker thread {name}: {source}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },
    #[error("State machine {0} is no longer running")]
    Closed(String),
    #[error("State machine {0} queue is full")]
    QueueFull(String),
}

impl From<DispatchError> for HarkError {
    fn from(err: DispatchError) -> Self {
        match err {
            DispatchError::NotStarted
            | DispatchError::PoolExhausted(_)
            | DispatchError::Runtime(_) => HarkError::Timer(err.to_string()),
            DispatchError::Spawn { .. } | DispatchError::QueueFull(_) => {
                HarkError::Dispatch(err.to_string())
            }
            DispatchError::Closed(_) => HarkError::ShuttingDown,
        }
    }
}
