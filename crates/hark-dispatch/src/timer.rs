//! Deadline-ordered one-shot timers served by a dedicated worker thread.
//!
//! The worker sleeps until the earliest deadline or until a new timer is
//! armed, pops every due entry and notifies each observer synchronously on
//! the timer thread. Observers must not block.

use std::fmt;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, error, info};

use crate::error::DispatchError;
use crate::id_pool::IdPool;

/// Handle of an armed timer. Only meaningful while the timer is pending.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TimerHandle(pub(crate) u16);

impl TimerHandle {
    pub fn id(&self) -> u16 {
        self.0
    }
}

impl fmt::Display for TimerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "timer#{}", self.0)
    }
}

/// An expired timer, handed to its observer by value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TimerItem {
    pub handle: TimerHandle,
    pub kind: u32,
    pub cookie: u64,
    pub deadline: Instant,
}

/// Receives timer expiries on the timer thread.
pub trait TimerObserver: Send + Sync {
    fn on_timer(&self, item: TimerItem);
}

struct Armed {
    item: TimerItem,
    observer: Arc<dyn TimerObserver>,
}

struct TimerState {
    armed: Vec<Armed>,
    ids: IdPool,
    started: bool,
    shutdown: bool,
}

impl TimerState {
    fn arm(
        &mut self,
        kind: u32,
        delay: Duration,
        cookie: u64,
        observer: Arc<dyn TimerObserver>,
    ) -> Result<TimerHandle, DispatchError> {
        if !self.started {
            return Err(DispatchError::NotStarted);
        }
        let id = self
            .ids
            .alloc()
            .ok_or(DispatchError::PoolExhausted(self.armed.len()))?;
        let item = TimerItem {
            handle: TimerHandle(id),
            kind,
            cookie,
            deadline: Instant::now() + delay,
        };
        insert_by_deadline(&mut self.armed, Armed { item, observer });
        Ok(TimerHandle(id))
    }

    fn disarm(&mut self, handle: TimerHandle) -> bool {
        match self.armed.iter().position(|a| a.item.handle == handle) {
            Some(pos) => {
                self.armed.remove(pos);
                self.ids.release(handle.0);
                true
            }
            None => false,
        }
    }

    /// Remove every entry due at `now`, releasing their ids.
    fn take_due(&mut self, now: Instant) -> Vec<Armed> {
        let split = self
            .armed
            .iter()
            .position(|a| a.item.deadline > now)
            .unwrap_or(self.armed.len());
        let due: Vec<Armed> = self.armed.drain(..split).collect();
        for armed in &due {
            self.ids.release(armed.item.handle.0);
        }
        due
    }
}

/// Equal deadlines keep arming order.
fn insert_by_deadline(armed: &mut Vec<Armed>, entry: Armed) {
    let pos = armed
        .iter()
        .position(|a| a.item.deadline > entry.item.deadline)
        .unwrap_or(armed.len());
    armed.insert(pos, entry);
}

struct Inner {
    state: Mutex<TimerState>,
    wake: Notify,
    worker: Mutex<Option<JoinHandle<()>>>,
}

/// Shared timer service. Clones refer to the same worker and deadline list.
#[derive(Clone)]
pub struct TimerService {
    inner: Arc<Inner>,
}

impl TimerService {
    /// Create a stopped service able to hold `max_timers` armed timers.
    pub fn new(max_timers: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(TimerState {
                    armed: Vec::with_capacity(max_timers),
                    ids: IdPool::new(max_timers),
                    started: false,
                    shutdown: false,
                }),
                wake: Notify::new(),
                worker: Mutex::new(None),
            }),
        }
    }

    /// Start the worker thread. Starting a running service is a no-op.
    pub fn start(&self, name: &str) -> Result<(), DispatchError> {
        let mut worker = self.inner.worker.lock();
        if worker.is_some() {
            debug!(thread = name, "Timer service already started");
            return Ok(());
        }

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .map_err(|e| DispatchError::Runtime(e.to_string()))?;

        {
            let mut state = self.inner.state.lock();
            state.started = true;
            state.shutdown = false;
        }

        let inner = Arc::clone(&self.inner);
        let spawned = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || runtime.block_on(run_worker(inner)));

        match spawned {
            Ok(handle) => {
                *worker = Some(handle);
                info!(thread = name, "Timer service started");
                Ok(())
            }
            Err(source) => {
                self.inner.state.lock().started = false;
                Err(DispatchError::Spawn {
                    name: name.to_string(),
                    source,
                })
            }
        }
    }

    /// Stop the worker and drop every armed timer. Stopping a stopped
    /// service is a no-op.
    pub fn stop(&self) {
        let Some(handle) = self.inner.worker.lock().take() else {
            return;
        };

        {
            let mut state = self.inner.state.lock();
            state.started = false;
            state.shutdown = true;
        }
        self.inner.wake.notify_one();

        if handle.thread().id() != std::thread::current().id() && handle.join().is_err() {
            error!("Timer worker panicked");
        }

        let mut state = self.inner.state.lock();
        state.armed.clear();
        state.ids.clear();
        info!("Timer service stopped");
    }

    /// Arm a one-shot timer firing after `delay`.
    pub fn set(
        &self,
        kind: u32,
        delay: Duration,
        cookie: u64,
        observer: Arc<dyn TimerObserver>,
    ) -> Result<TimerHandle, DispatchError> {
        let handle = self.inner.state.lock().arm(kind, delay, cookie, observer)?;
        self.inner.wake.notify_one();
        debug!(%handle, kind, delay_ms = delay.as_millis() as u64, "Timer armed");
        Ok(handle)
    }

    /// Cancel `handle` and arm a new timer in its place.
    ///
    /// The returned handle may differ from the one passed in.
    pub fn reset(
        &self,
        handle: TimerHandle,
        kind: u32,
        delay: Duration,
        cookie: u64,
        observer: Arc<dyn TimerObserver>,
    ) -> Result<TimerHandle, DispatchError> {
        let new_handle = {
            let mut state = self.inner.state.lock();
            state.disarm(handle);
            state.arm(kind, delay, cookie, observer)?
        };
        self.inner.wake.notify_one();
        debug!(old = %handle, new = %new_handle, delay_ms = delay.as_millis() as u64, "Timer reset");
        Ok(new_handle)
    }

    /// Cancel a pending timer. Returns `false` if it was not pending.
    pub fn cancel(&self, handle: TimerHandle) -> bool {
        let removed = self.inner.state.lock().disarm(handle);
        if removed {
            debug!(%handle, "Timer cancelled");
        } else {
            debug!(%handle, "Timer not pending, nothing to cancel");
        }
        removed
    }

    /// Number of armed timers.
    pub fn pending(&self) -> usize {
        self.inner.state.lock().armed.len()
    }

    pub fn is_started(&self) -> bool {
        self.inner.state.lock().started
    }
}

async fn run_worker(inner: Arc<Inner>) {
    loop {
        let (due, next_deadline) = {
            let mut state = inner.state.lock();
            if state.shutdown {
                break;
            }
            let due = state.take_due(Instant::now());
            let next = state.armed.first().map(|a| a.item.deadline);
            (due, next)
        };

        if !due.is_empty() {
            for Armed { item, observer } in due {
                debug!(handle = %item.handle, kind = item.kind, "Timer expired");
                observer.on_timer(item);
            }
            continue;
        }

        match next_deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)) => {}
                    _ = inner.wake.notified() => {}
                }
            }
            None => inner.wake.notified().await,
        }
    }
    debug!("Timer worker exiting");
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    struct ChannelObserver {
        tx: parking_lot::Mutex<mpsc::Sender<(TimerItem, Instant)>>,
    }

    impl TimerObserver for ChannelObserver {
        fn on_timer(&self, item: TimerItem) {
            let _ = self.tx.lock().send((item, Instant::now()));
        }
    }

    fn observer() -> (Arc<dyn TimerObserver>, mpsc::Receiver<(TimerItem, Instant)>) {
        let (tx, rx) = mpsc::channel();
        (
            Arc::new(ChannelObserver {
                tx: parking_lot::Mutex::new(tx),
            }),
            rx,
        )
    }

    fn started(max: usize) -> TimerService {
        let timers = TimerService::new(max);
        timers.start("test-timer").unwrap();
        timers
    }

    #[test]
    fn test_set_before_start_fails() {
        let timers = TimerService::new(4);
        let (obs, _rx) = observer();
        let result = timers.set(1, Duration::from_millis(10), 0, obs);
        assert!(matches!(result, Err(DispatchError::NotStarted)));
        assert!(!timers.is_started());
    }

    #[test]
    fn test_fires_in_deadline_order() {
        let timers = started(10);
        let (obs, rx) = observer();

        timers.set(3, Duration::from_millis(150), 0, Arc::clone(&obs)).unwrap();
        timers.set(1, Duration::from_millis(50), 0, Arc::clone(&obs)).unwrap();
        timers.set(2, Duration::from_millis(100), 0, obs).unwrap();

        let kinds: Vec<u32> = (0..3)
            .map(|_| rx.recv_timeout(Duration::from_secs(2)).unwrap().0.kind)
            .collect();
        assert_eq!(kinds, vec![1, 2, 3]);
        assert_eq!(timers.pending(), 0);
        timers.stop();
    }

    #[test]
    fn test_reset_fires_once_at_new_deadline() {
        let timers = started(10);
        let (obs, rx) = observer();

        let armed_at = Instant::now();
        let first = timers.set(7, Duration::from_millis(100), 1, Arc::clone(&obs)).unwrap();
        let second = timers.reset(first, 7, Duration::from_millis(50), 2, obs).unwrap();

        let (item, fired_at) = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(item.handle, second);
        assert_eq!(item.cookie, 2);
        assert!(fired_at.duration_since(armed_at) >= Duration::from_millis(50));
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
        timers.stop();
    }

    #[test]
    fn test_cancel_prevents_expiry() {
        let timers = started(10);
        let (obs, rx) = observer();

        let handle = timers.set(1, Duration::from_millis(30), 0, obs).unwrap();
        assert!(timers.cancel(handle));
        assert!(!timers.cancel(handle));
        assert_eq!(timers.pending(), 0);
        assert!(rx.recv_timeout(Duration::from_millis(150)).is_err());
        timers.stop();
    }

    #[test]
    fn test_pool_exhaustion_is_reported() {
        let timers = started(2);
        let (obs, _rx) = observer();

        timers.set(1, Duration::from_secs(60), 0, Arc::clone(&obs)).unwrap();
        timers.set(2, Duration::from_secs(60), 0, Arc::clone(&obs)).unwrap();
        let result = timers.set(3, Duration::from_secs(60), 0, obs);
        assert!(matches!(result, Err(DispatchError::PoolExhausted(2))));
        timers.stop();
    }

    #[test]
    fn test_expired_ids_are_reusable() {
        let timers = started(1);
        let (obs, rx) = observer();

        timers.set(1, Duration::from_millis(10), 0, Arc::clone(&obs)).unwrap();
        rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(timers.set(2, Duration::from_millis(10), 0, obs).is_ok());
        rx.recv_timeout(Duration::from_secs(2)).unwrap();
        timers.stop();
    }

    #[test]
    fn test_stop_clears_and_restart_works() {
        let timers = started(4);
        let (obs, rx) = observer();

        timers.set(1, Duration::from_secs(60), 0, Arc::clone(&obs)).unwrap();
        assert_eq!(timers.pending(), 1);
        timers.stop();
        timers.stop();
        assert_eq!(timers.pending(), 0);
        assert!(!timers.is_started());

        timers.start("test-timer-2").unwrap();
        timers.start("test-timer-2").unwrap();
        timers.set(9, Duration::from_millis(10), 0, obs).unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap().0.kind, 9);
        timers.stop();
    }

    struct Noop;
    impl TimerObserver for Noop {
        fn on_timer(&self, _item: TimerItem) {}
    }

    #[test]
    fn test_equal_deadlines_keep_arming_order() {
        let deadline = Instant::now() + Duration::from_secs(1);
        let entry = |id: u16, offset_ms: u64| Armed {
            item: TimerItem {
                handle: TimerHandle(id),
                kind: 0,
                cookie: 0,
                deadline: deadline + Duration::from_millis(offset_ms),
            },
            observer: Arc::new(Noop),
        };

        let mut armed = Vec::new();
        insert_by_deadline(&mut armed, entry(0, 10));
        insert_by_deadline(&mut armed, entry(1, 0));
        insert_by_deadline(&mut armed, entry(2, 10));
        insert_by_deadline(&mut armed, entry(3, 0));

        let order: Vec<u16> = armed.iter().map(|a| a.item.handle.id()).collect();
        assert_eq!(order, vec![1, 3, 0, 2]);
    }
}
