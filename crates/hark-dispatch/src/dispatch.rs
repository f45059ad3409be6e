//! Table-driven state machines with per-state wait-until timers.
//!
//! Each machine owns a worker thread and a bounded FIFO queue. Handlers are
//! looked up by `(current state, event)` and always run on the worker, so
//! they can mutate the machine context without locking. A handler proposes
//! the next state through [`Transition::go`]; the proposal only takes effect
//! when the handler returns `Ok`.

use std::collections::HashMap;
use std::fmt::{Debug, Display};
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{JoinHandle, ThreadId};
use std::time::Duration;

use hark_core::{HarkError, Result};
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::error::DispatchError;
use crate::timer::{TimerHandle, TimerItem, TimerObserver, TimerService};

/// A named stage of a machine, ordered by tag value.
pub trait StateId: Copy + Eq + Ord + Hash + Debug + Display + Send + Sync + 'static {
    /// Every state, in tag order.
    const ALL: &'static [Self];

    fn index(self) -> usize {
        Self::ALL.iter().position(|s| *s == self).unwrap_or(0)
    }
}

/// A message accepted by a machine.
pub trait Message: Send + 'static {
    type Event: Copy + Eq + Hash + Debug + Send + Sync + 'static;

    fn event(&self) -> Self::Event;

    /// The message delivered when a wait-until timer for `event` expires.
    fn timeout(event: Self::Event) -> Self;
}

/// What a handler may do to its machine.
#[derive(Debug)]
pub struct Transition<S> {
    current: S,
    next: Option<S>,
    reset_timeout: bool,
}

impl<S: StateId> Transition<S> {
    fn new(current: S) -> Self {
        Self {
            current,
            next: None,
            reset_timeout: false,
        }
    }

    pub fn current(&self) -> S {
        self.current
    }

    /// Propose `next` as the new state.
    pub fn go(&mut self, next: S) {
        self.next = Some(next);
    }

    /// Push the current state's wait-until deadline out by its full delay.
    pub fn reset_timeout(&mut self) {
        self.reset_timeout = true;
    }
}

pub type Handler<C, S, M, R> =
    Arc<dyn Fn(&mut C, &mut Transition<S>, M) -> Result<R> + Send + Sync>;

type TransitionHook<S> = Arc<dyn Fn(S, S) + Send + Sync>;

type PostErrorHook<S, E> = Arc<dyn Fn(S, E, &HarkError) + Send + Sync>;

struct WaitUntil<C, S, M: Message, R> {
    event: M::Event,
    delay: Duration,
    handler: Handler<C, S, M, R>,
}

struct StateTable<C, S, M: Message, R> {
    handlers: HashMap<M::Event, Handler<C, S, M, R>>,
    wait: Option<WaitUntil<C, S, M, R>>,
}

impl<C, S, M: Message, R> StateTable<C, S, M, R> {
    fn new() -> Self {
        Self {
            handlers: HashMap::new(),
            wait: None,
        }
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Collects handler tables before the machine is spawned.
pub struct StateMachineBuilder<C, S: StateId, M: Message, R> {
    name: String,
    initial: S,
    queue_capacity: usize,
    tables: HashMap<S, StateTable<C, S, M, R>>,
    on_transition: Option<TransitionHook<S>>,
    on_post_error: Option<PostErrorHook<S, M::Event>>,
}

impl<C, S, M, R> StateMachineBuilder<C, S, M, R>
where
    C: Send + 'static,
    S: StateId,
    M: Message,
    R: Send + 'static,
{
    pub fn new(name: impl Into<String>, initial: S) -> Self {
        Self {
            name: name.into(),
            initial,
            queue_capacity: 64,
            tables: HashMap::new(),
            on_transition: None,
            on_post_error: None,
        }
    }

    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }

    /// Register handlers for one state.
    pub fn for_state(&mut self, state: S) -> StateScope<'_, C, S, M, R> {
        StateScope {
            builder: self,
            state,
        }
    }

    /// Register handlers for every state from `first` to `last` inclusive.
    pub fn for_range(&mut self, first: S, last: S) -> RangeScope<'_, C, S, M, R> {
        let states = S::ALL
            .iter()
            .copied()
            .filter(|s| *s >= first && *s <= last)
            .collect();
        RangeScope {
            builder: self,
            states,
        }
    }

    /// Called on the worker after every state change with `(from, to)`.
    pub fn on_transition<F>(&mut self, hook: F) -> &mut Self
    where
        F: Fn(S, S) + Send + Sync + 'static,
    {
        self.on_transition = Some(Arc::new(hook));
        self
    }

    /// Called on the worker with `(state, event, error)` when a posted
    /// message fails, including when no handler applies. Posters have no
    /// other way to learn the outcome.
    pub fn on_post_error<F>(&mut self, hook: F) -> &mut Self
    where
        F: Fn(S, M::Event, &HarkError) + Send + Sync + 'static,
    {
        self.on_post_error = Some(Arc::new(hook));
        self
    }

    fn insert(&mut self, state: S, event: M::Event, handler: Handler<C, S, M, R>) {
        let table = self.tables.entry(state).or_insert_with(StateTable::new);
        if table.handlers.insert(event, handler).is_some() {
            warn!(machine = %self.name, %state, ?event, "Handler replaced");
        }
    }

    /// Start the worker thread. `ctx` moves onto the worker and is only ever
    /// touched by handlers.
    pub fn spawn(self, ctx: C, timer: TimerService) -> Result<StateMachine<S, M, R>> {
        self.spawn_with(|_| ctx, timer)
    }

    /// Like [`spawn`](Self::spawn), building the context from the machine's
    /// own [`Poster`] so handlers can hand it to asynchronous producers.
    pub fn spawn_with<F>(self, make_ctx: F, timer: TimerService) -> Result<StateMachine<S, M, R>>
    where
        F: FnOnce(Poster<M, R>) -> C,
    {
        let (tx, rx) = mpsc::channel(self.queue_capacity);
        let ctx = make_ctx(Poster {
            name: Arc::from(self.name.as_str()),
            tx: tx.clone(),
        });
        let current = Arc::new(RwLock::new(self.initial));
        let closing = Arc::new(AtomicBool::new(false));

        let relay: Arc<dyn TimerObserver> = Arc::new(TimeoutRelay {
            name: self.name.clone(),
            tx: tx.clone(),
        });

        let worker = Worker {
            name: self.name.clone(),
            ctx,
            tables: self.tables,
            state: self.initial,
            current: Arc::clone(&current),
            closing: Arc::clone(&closing),
            timer,
            relay,
            armed: None,
            generation: 0,
            on_transition: self.on_transition,
            on_post_error: self.on_post_error,
        };

        let handle = std::thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || worker.run(rx))
            .map_err(|source| DispatchError::Spawn {
                name: self.name.clone(),
                source,
            })?;

        info!(machine = %self.name, initial = %self.initial, "State machine started");
        Ok(StateMachine {
            name: Arc::from(self.name.as_str()),
            worker_id: handle.thread().id(),
            tx,
            current,
            closing,
            worker: Mutex::new(Some(handle)),
        })
    }
}

pub struct StateScope<'a, C, S: StateId, M: Message, R> {
    builder: &'a mut StateMachineBuilder<C, S, M, R>,
    state: S,
}

impl<C, S, M, R> StateScope<'_, C, S, M, R>
where
    C: Send + 'static,
    S: StateId,
    M: Message,
    R: Send + 'static,
{
    pub fn on<F>(self, event: M::Event, handler: F) -> Self
    where
        F: Fn(&mut C, &mut Transition<S>, M) -> Result<R> + Send + Sync + 'static,
    {
        self.builder.insert(self.state, event, Arc::new(handler));
        self
    }

    /// Arm a timer on entry to this state; if it expires first, `handler`
    /// runs with the `event` timeout message.
    pub fn wait_until<F>(self, event: M::Event, handler: F, delay: Duration) -> Self
    where
        F: Fn(&mut C, &mut Transition<S>, M) -> Result<R> + Send + Sync + 'static,
    {
        let table = self
            .builder
            .tables
            .entry(self.state)
            .or_insert_with(StateTable::new);
        table.wait = Some(WaitUntil {
            event,
            delay,
            handler: Arc::new(handler),
        });
        self
    }
}

pub struct RangeScope<'a, C, S: StateId, M: Message, R> {
    builder: &'a mut StateMachineBuilder<C, S, M, R>,
    states: Vec<S>,
}

impl<C, S, M, R> RangeScope<'_, C, S, M, R>
where
    C: Send + 'static,
    S: StateId,
    M: Message,
    R: Send + 'static,
{
    pub fn on<F>(self, event: M::Event, handler: F) -> Self
    where
        F: Fn(&mut C, &mut Transition<S>, M) -> Result<R> + Send + Sync + 'static,
    {
        let handler: Handler<C, S, M, R> = Arc::new(handler);
        for state in &self.states {
            self.builder.insert(*state, event, Arc::clone(&handler));
        }
        self
    }
}

// =============================================================================
// Running machine
// =============================================================================

enum Command<M, R> {
    Handle {
        msg: M,
        reply: oneshot::Sender<Result<R>>,
    },
    Post {
        msg: M,
    },
    Timeout {
        handle: TimerHandle,
        generation: u64,
    },
    Shutdown,
}

struct TimeoutRelay<M, R> {
    name: String,
    tx: mpsc::Sender<Command<M, R>>,
}

impl<M: Send, R: Send> TimerObserver for TimeoutRelay<M, R> {
    fn on_timer(&self, item: TimerItem) {
        let command = Command::Timeout {
            handle: item.handle,
            generation: item.cookie,
        };
        if self.tx.try_send(command).is_err() {
            error!(machine = %self.name, handle = %item.handle, "Dropped wait-until timeout");
        }
    }
}

/// Cloneable, non-blocking producer side of a machine.
pub struct Poster<M, R> {
    name: Arc<str>,
    tx: mpsc::Sender<Command<M, R>>,
}

impl<M, R> Clone for Poster<M, R> {
    fn clone(&self) -> Self {
        Self {
            name: Arc::clone(&self.name),
            tx: self.tx.clone(),
        }
    }
}

impl<M: Send, R: Send> Poster<M, R> {
    /// Enqueue without waiting for the result.
    pub fn post(&self, msg: M) -> Result<()> {
        self.tx.try_send(Command::Post { msg }).map_err(|e| {
            let err = match e {
                mpsc::error::TrySendError::Full(_) => DispatchError::QueueFull(self.name.to_string()),
                mpsc::error::TrySendError::Closed(_) => DispatchError::Closed(self.name.to_string()),
            };
            HarkError::from(err)
        })
    }
}

/// Producer handle of a running machine. Dropping it stops the worker.
pub struct StateMachine<S: StateId, M: Message, R> {
    name: Arc<str>,
    worker_id: ThreadId,
    tx: mpsc::Sender<Command<M, R>>,
    current: Arc<RwLock<S>>,
    closing: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl<S: StateId, M: Message, R: Send + 'static> StateMachine<S, M, R> {
    /// Enqueue `msg` and wait for the handler's result.
    ///
    /// Returns [`HarkError::NotApplicable`] when the current state has no
    /// handler for the event. Must not be called from a handler of the same
    /// machine, nor from inside an async runtime.
    pub fn handle(&self, msg: M) -> Result<R> {
        if std::thread::current().id() == self.worker_id {
            return Err(HarkError::Dispatch(format!(
                "reentrant handle() on machine {}",
                self.name
            )));
        }
        let (reply, rx) = oneshot::channel();
        self.tx
            .blocking_send(Command::Handle { msg, reply })
            .map_err(|_| DispatchError::Closed(self.name.to_string()))?;
        rx.blocking_recv()
            .map_err(|_| DispatchError::Closed(self.name.to_string()))?
    }

    /// Enqueue without waiting for the result.
    pub fn post(&self, msg: M) -> Result<()> {
        self.poster().post(msg)
    }

    pub fn poster(&self) -> Poster<M, R> {
        Poster {
            name: Arc::clone(&self.name),
            tx: self.tx.clone(),
        }
    }

    pub fn current_state(&self) -> S {
        *self.current.read()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stop the worker after the message in progress and join it.
    pub fn shutdown(&self) {
        let Some(handle) = self.worker.lock().take() else {
            return;
        };
        self.closing.store(true, Ordering::SeqCst);
        // A full queue still stops: the worker checks `closing` after each message.
        let _ = self.tx.try_send(Command::Shutdown);
        if handle.thread().id() != std::thread::current().id() && handle.join().is_err() {
            error!(machine = %self.name, "State machine worker panicked");
        }
        info!(machine = %self.name, "State machine stopped");
    }
}

impl<S: StateId, M: Message, R> Drop for StateMachine<S, M, R> {
    fn drop(&mut self) {
        if let Some(handle) = self.worker.lock().take() {
            self.closing.store(true, Ordering::SeqCst);
            let _ = self.tx.try_send(Command::Shutdown);
            if handle.thread().id() != std::thread::current().id() && handle.join().is_err() {
                error!(machine = %self.name, "State machine worker panicked");
            }
        }
    }
}

struct Worker<C, S: StateId, M: Message, R> {
    name: String,
    ctx: C,
    tables: HashMap<S, StateTable<C, S, M, R>>,
    state: S,
    current: Arc<RwLock<S>>,
    closing: Arc<AtomicBool>,
    timer: TimerService,
    relay: Arc<dyn TimerObserver>,
    armed: Option<(TimerHandle, u64)>,
    generation: u64,
    on_transition: Option<TransitionHook<S>>,
    on_post_error: Option<PostErrorHook<S, M::Event>>,
}

impl<C, S: StateId, M: Message, R> Worker<C, S, M, R> {
    fn run(mut self, mut rx: mpsc::Receiver<Command<M, R>>) {
        self.arm_wait();
        while let Some(command) = rx.blocking_recv() {
            match command {
                Command::Handle { msg, reply } => {
                    let result = self.dispatch(msg);
                    let _ = reply.send(result);
                }
                Command::Post { msg } => {
                    let event = msg.event();
                    let state = self.state;
                    if let Err(e) = self.dispatch(msg) {
                        if e.is_not_applicable() {
                            debug!(machine = %self.name, %state, ?event, "Posted event not applicable");
                        } else {
                            warn!(machine = %self.name, %state, ?event, error = %e, "Posted event failed");
                        }
                        if let Some(hook) = &self.on_post_error {
                            hook(state, event, &e);
                        }
                    }
                }
                Command::Timeout { handle, generation } => self.on_timeout(handle, generation),
                Command::Shutdown => break,
            }
            if self.closing.load(Ordering::SeqCst) {
                break;
            }
        }
        self.disarm();
        debug!(machine = %self.name, "Worker exiting");
    }

    fn dispatch(&mut self, msg: M) -> Result<R> {
        let event = msg.event();
        let handler = self
            .tables
            .get(&self.state)
            .and_then(|table| table.handlers.get(&event))
            .cloned();
        match handler {
            Some(handler) => self.invoke(handler, msg),
            None => Err(HarkError::NotApplicable {
                state: self.state.to_string(),
                event: format!("{event:?}"),
            }),
        }
    }

    fn invoke(&mut self, handler: Handler<C, S, M, R>, msg: M) -> Result<R> {
        let mut transition = Transition::new(self.state);
        let result = handler(&mut self.ctx, &mut transition, msg);
        if result.is_ok() {
            if transition.reset_timeout {
                self.rearm_wait();
            }
            if let Some(next) = transition.next {
                if next != self.state {
                    self.enter(next);
                }
            }
        }
        result
    }

    fn enter(&mut self, next: S) {
        let from = self.state;
        self.disarm();
        self.state = next;
        *self.current.write() = next;
        info!(machine = %self.name, from = %from, to = %next, "State transition");
        self.arm_wait();
        if let Some(hook) = &self.on_transition {
            hook(from, next);
        }
    }

    fn wait_delay(&self) -> Option<Duration> {
        self.tables
            .get(&self.state)
            .and_then(|table| table.wait.as_ref())
            .map(|wait| wait.delay)
    }

    fn arm_wait(&mut self) {
        let Some(delay) = self.wait_delay() else {
            return;
        };
        self.generation += 1;
        let kind = self.state.index() as u32;
        match self
            .timer
            .set(kind, delay, self.generation, Arc::clone(&self.relay))
        {
            Ok(handle) => self.armed = Some((handle, self.generation)),
            Err(e) => {
                error!(machine = %self.name, state = %self.state, error = %e, "Failed to arm wait-until timer")
            }
        }
    }

    fn rearm_wait(&mut self) {
        let Some(delay) = self.wait_delay() else {
            return;
        };
        let Some((handle, _)) = self.armed.take() else {
            self.arm_wait();
            return;
        };
        self.generation += 1;
        let kind = self.state.index() as u32;
        match self
            .timer
            .reset(handle, kind, delay, self.generation, Arc::clone(&self.relay))
        {
            Ok(handle) => self.armed = Some((handle, self.generation)),
            Err(e) => {
                error!(machine = %self.name, state = %self.state, error = %e, "Failed to reset wait-until timer")
            }
        }
    }

    fn disarm(&mut self) {
        if let Some((handle, _)) = self.armed.take() {
            self.timer.cancel(handle);
        }
    }

    fn on_timeout(&mut self, handle: TimerHandle, generation: u64) {
        if self.armed != Some((handle, generation)) {
            debug!(machine = %self.name, %handle, "Ignoring stale timeout");
            return;
        }
        self.armed = None;

        let wait = self
            .tables
            .get(&self.state)
            .and_then(|table| table.wait.as_ref())
            .map(|wait| (wait.event, Arc::clone(&wait.handler)));
        let Some((event, handler)) = wait else {
            return;
        };

        info!(machine = %self.name, state = %self.state, ?event, "Wait-until timeout");
        if let Err(e) = self.invoke(handler, M::timeout(event)) {
            warn!(machine = %self.name, state = %self.state, error = %e, "Timeout handler failed");
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
