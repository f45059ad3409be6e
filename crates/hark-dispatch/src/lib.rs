//! Timer and state-dispatch layer for Hark.
//!
//! Provides the handle allocator, the shared deadline timer service and the
//! table-driven state machines every wake engine is built on.

pub mod dispatch;
pub mod error;
pub mod id_pool;
pub mod timer;

pub use dispatch::{
    Handler, Message, Poster, StateId, StateMachine, StateMachineBuilder, Transition,
};
pub use error::DispatchError;
pub use id_pool::IdPool;
pub use timer::{TimerHandle, TimerItem, TimerObserver, TimerService};
