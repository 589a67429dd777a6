//! One-shot timers.
//!
//! The updater needs two timers: the overall session watchdog and the
//! post-boot commit watchdog. Both go through the [`Scheduler`] trait so the
//! engine can run on a tokio runtime ([`TokioScheduler`]) or be driven
//! deterministically in tests ([`ManualScheduler`]).

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::UpdateError;

/// Work executed when a timer fires.
pub type TimerTask = Box<dyn FnOnce() + Send + 'static>;

/// Identifies a scheduled timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimerId(u64);

/// Schedules cancellable one-shot timers.
pub trait Scheduler: Send + Sync {
    /// Run `task` once after `delay`.
    fn schedule_once(&self, delay: Duration, task: TimerTask) -> TimerId;

    /// Cancel a timer. Cancelling a fired or unknown timer is a no-op.
    fn cancel(&self, id: TimerId);
}

/// Timers backed by tokio tasks.
pub struct TokioScheduler {
    handle: Handle,
    next_id: AtomicU64,
    tasks: Arc<Mutex<HashMap<TimerId, JoinHandle<()>>>>,
}

impl TokioScheduler {
    /// Use the runtime of the calling context.
    pub fn new() -> Result<Self, UpdateError> {
        let handle = Handle::try_current()
            .map_err(|e| UpdateError::ConfigError(format!("no tokio runtime: {e}")))?;
        Ok(Self::with_handle(handle))
    }

    pub fn with_handle(handle: Handle) -> Self {
        Self {
            handle,
            next_id: AtomicU64::new(1),
            tasks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Number of timers that have neither fired nor been cancelled.
    pub fn pending(&self) -> usize {
        self.tasks.lock().len()
    }
}

impl Scheduler for TokioScheduler {
    fn schedule_once(&self, delay: Duration, task: TimerTask) -> TimerId {
        let id = TimerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let tasks = Arc::clone(&self.tasks);

        // Hold the lock across spawn so the task cannot deregister itself
        // before it has been registered.
        let mut guard = self.tasks.lock();
        let join = self.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            tasks.lock().remove(&id);
            task();
        });
        guard.insert(id, join);
        debug!("Timer {:?} armed for {:?}", id, delay);
        id
    }

    fn cancel(&self, id: TimerId) {
        if let Some(join) = self.tasks.lock().remove(&id) {
            join.abort();
            debug!("Timer {:?} cancelled", id);
        }
    }
}

/// Scheduler whose timers only fire when told to.
#[derive(Default)]
pub struct ManualScheduler {
    next_id: AtomicU64,
    pending: Mutex<BTreeMap<TimerId, (Duration, TimerTask)>>,
}

impl ManualScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delays of the timers still pending, in scheduling order.
    pub fn pending_delays(&self) -> Vec<Duration> {
        self.pending.lock().values().map(|(delay, _)| *delay).collect()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Fire every pending timer. Returns how many fired.
    pub fn fire_all(&self) -> usize {
        // Tasks may schedule new timers, so run them outside the lock.
        let tasks: Vec<_> = std::mem::take(&mut *self.pending.lock()).into_values().collect();
        let fired = tasks.len();
        for (_, task) in tasks {
            task();
        }
        fired
    }
}

impl Scheduler for ManualScheduler {
    fn schedule_once(&self, delay: Duration, task: TimerTask) -> TimerId {
        let id = TimerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.pending.lock().insert(id, (delay, task));
        id
    }

    fn cancel(&self, id: TimerId) {
        self.pending.lock().remove(&id);
    }
}
