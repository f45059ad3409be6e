//! Hark service crate - the process-wide context.
//!
//! [`ServiceContext`] is constructed once per process and owns the shared
//! timer service, the engine manager and the trigger manager. Collaborators
//! (adapter host, capture source, connector, model store, signal observers)
//! are injected through [`Collaborators`].

pub mod collaborators;
pub mod context;
mod rearm;

pub use collaborators::{Collaborators, MockCollaborators};
pub use context::{ServiceContext, TriggerParameters, EVENT_CHANNEL_CAPACITY};
