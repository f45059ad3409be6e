//! Re-requesting trigger detection after a wake session.
//!
//! A detection withdraws the model's recognition request. The service holds
//! the model until the standard engine is done with it (back in
//! `Initialized`) or did not take the detection up, then requests it again.
//! Requests run on the timer thread so neither the connector's callback
//! thread nor an engine worker calls back into the connector.

use std::collections::BTreeSet;
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use hark_core::{HarkError, ModelUuid};
use hark_dispatch::{TimerItem, TimerObserver, TimerService};
use hark_trigger::TriggerManager;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

/// Timer kind used for deferred re-requests.
const REARM_TIMER_KIND: u32 = 0x5245;

pub(crate) struct Rearm {
    trigger: OnceLock<Weak<TriggerManager>>,
    held: Mutex<BTreeSet<ModelUuid>>,
    timer: TimerService,
}

impl Rearm {
    pub(crate) fn new(timer: TimerService) -> Arc<Self> {
        Arc::new(Self {
            trigger: OnceLock::new(),
            held: Mutex::new(BTreeSet::new()),
            timer,
        })
    }

    /// Set once, right after the trigger manager exists.
    pub(crate) fn bind(&self, trigger: &Arc<TriggerManager>) {
        if self.trigger.set(Arc::downgrade(trigger)).is_err() {
            warn!("Re-arm already bound to a trigger manager");
        }
    }

    /// `uuid` was detected and is now held by the engine.
    pub(crate) fn hold(&self, uuid: ModelUuid) {
        self.held.lock().insert(uuid);
    }

    pub(crate) fn forget(&self, uuid: ModelUuid) {
        self.held.lock().remove(&uuid);
    }

    pub(crate) fn is_held(&self, uuid: ModelUuid) -> bool {
        self.held.lock().contains(&uuid)
    }

    /// Queue a re-request of every held model. Never blocks.
    pub(crate) fn schedule(self: &Arc<Self>) {
        if self.held.lock().is_empty() {
            return;
        }
        let observer: Arc<dyn TimerObserver> = Arc::clone(self) as Arc<dyn TimerObserver>;
        if let Err(e) = self.timer.set(REARM_TIMER_KIND, Duration::ZERO, 0, observer) {
            warn!(error = %e, "Could not schedule detection re-arm");
        }
    }

    /// Request detection again for every held model.
    pub(crate) fn run(&self) {
        let held = std::mem::take(&mut *self.held.lock());
        let Some(trigger) = self.trigger.get().and_then(Weak::upgrade) else {
            return;
        };
        for uuid in held {
            match trigger.start_detection(uuid) {
                Ok(()) => info!(model = %uuid, "Detection re-armed"),
                // The detector was released meanwhile.
                Err(HarkError::UnknownModel(_)) => debug!(model = %uuid, "No detector to re-arm"),
                Err(e) => warn!(model = %uuid, error = %e, "Detection re-arm failed"),
            }
        }
    }
}

impl TimerObserver for Rearm {
    fn on_timer(&self, _item: TimerItem) {
        self.run();
    }
}

// =============================================================================
// Tests
// =============================================================================
