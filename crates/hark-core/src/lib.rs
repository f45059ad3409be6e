pub mod config;
pub mod error;
pub mod events;
pub mod types;

pub use config::HarkConfig;
pub use error::{result_code, HarkError, Result, SUCCESS};
pub use events::{EventSink, HarkEvent};
pub use types::*;
