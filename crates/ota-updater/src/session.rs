//! Update session handles.
//!
//! A session owns the carry-over buffer, the state machine and the backend
//! context. Callers hold it through a cloneable [`SessionHandle`]; the
//! session is dropped with its last handle. The session timeout never frees
//! anything: it raises the abort signal so the transport can wind down and
//! clears the active slot.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{error, warn};

use crate::backend::FlashContext;
use crate::driver::{
    CompletionCallback, Driver, FinalizeOptions, UpdateResult, UpdateState,
};
use crate::error::UpdateError;
use crate::events::{OtaState, StatusBus};
use crate::input::InputBuffer;
use crate::registry::SessionRegistry;
use crate::timer::{Scheduler, TimerId};

/// Session state shared with the timeout task.
struct SessionControl {
    generation: u64,
    abort: watch::Sender<bool>,
}

/// One update in progress.
pub struct UpdateSession<C: FlashContext> {
    input: InputBuffer,
    driver: Driver<C>,
    control: Arc<SessionControl>,
    registry: Arc<SessionRegistry>,
    scheduler: Arc<dyn Scheduler>,
    timer: Option<TimerId>,
}

impl<C: FlashContext> UpdateSession<C> {
    /// Wrap a driver that holds the registry slot `generation` and arm the
    /// session timeout.
    pub(crate) fn start(
        driver: Driver<C>,
        generation: u64,
        timeout: Duration,
        registry: Arc<SessionRegistry>,
        scheduler: Arc<dyn Scheduler>,
        events: StatusBus,
    ) -> Self {
        let (abort, _) = watch::channel(false);
        let control = Arc::new(SessionControl { generation, abort });

        let timer = {
            let control = Arc::clone(&control);
            let registry = Arc::clone(&registry);
            scheduler.schedule_once(
                timeout,
                Box::new(move || {
                    if !registry.is_current(control.generation) {
                        return;
                    }
                    events.emit(OtaState::Error, "Update timed out", None);
                    control.abort.send_replace(true);
                    registry.release(control.generation);
                }),
            )
        };

        Self {
            input: InputBuffer::new(),
            driver,
            control,
            registry,
            scheduler,
            timer: Some(timer),
        }
    }

    fn is_cancelled(&self) -> bool {
        *self.control.abort.borrow()
    }

    fn process(&mut self, chunk: &[u8]) -> Result<UpdateResult, UpdateError> {
        if self.is_cancelled() && !self.driver.is_finished() {
            self.driver.fail(&UpdateError::TimedOut);
            self.disarm();
            return Err(UpdateError::TimedOut);
        }
        let result = self.driver.process_chunk(&mut self.input, chunk);
        if self.driver.is_finished() {
            self.disarm();
        }
        result
    }

    fn finalize(&mut self, options: FinalizeOptions) -> Result<UpdateResult, UpdateError> {
        if self.is_cancelled() && !self.driver.is_finished() {
            self.driver.fail(&UpdateError::TimedOut);
            self.disarm();
            return Err(UpdateError::TimedOut);
        }
        let result = self.driver.request_finalize(options);
        if self.driver.is_finished() {
            self.disarm();
        }
        result
    }

    fn abort(&mut self, reason: &str) {
        if self.driver.is_finished() {
            return;
        }
        let err = if self.is_cancelled() {
            UpdateError::TimedOut
        } else {
            UpdateError::Aborted(reason.to_string())
        };
        error!("{}", err);
        self.driver.fail(&err);
        self.control.abort.send_replace(true);
        self.disarm();
    }

    /// Cancel the session timeout.
    fn disarm(&mut self) {
        if let Some(id) = self.timer.take() {
            self.scheduler.cancel(id);
        }
    }
}

impl<C: FlashContext> Drop for UpdateSession<C> {
    fn drop(&mut self) {
        if !self.driver.is_finished() {
            warn!("Update terminated unexpectedly");
            let err = if self.is_cancelled() {
                UpdateError::TimedOut
            } else {
                UpdateError::Aborted("terminated unexpectedly".to_string())
            };
            self.driver.fail(&err);
        }
        self.disarm();
        self.registry.release(self.control.generation);
    }
}

/// Shared handle to an [`UpdateSession`].
pub struct SessionHandle<C: FlashContext> {
    inner: Arc<Mutex<UpdateSession<C>>>,
    generation: u64,
    abort: watch::Receiver<bool>,
}

impl<C: FlashContext> Clone for SessionHandle<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            generation: self.generation,
            abort: self.abort.clone(),
        }
    }
}

impl<C: FlashContext> SessionHandle<C> {
    pub(crate) fn new(session: UpdateSession<C>) -> Self {
        let generation = session.control.generation;
        let abort = session.control.abort.subscribe();
        Self {
            inner: Arc::new(Mutex::new(session)),
            generation,
            abort,
        }
    }

    /// Feed the next chunk of the package.
    pub fn process(&self, chunk: &[u8]) -> Result<UpdateResult, UpdateError> {
        self.inner.lock().process(chunk)
    }

    /// Apply the update once the whole package has been received.
    pub fn finalize(&self, options: FinalizeOptions) -> Result<UpdateResult, UpdateError> {
        self.inner.lock().finalize(options)
    }

    /// Stop the update, e.g. because the transport failed.
    ///
    /// A session whose timeout already fired finishes as timed out.
    pub fn abort(&self, reason: &str) {
        self.inner.lock().abort(reason)
    }

    /// Register a callback run once when the session finishes.
    pub fn on_complete(&self, callback: CompletionCallback) {
        self.inner.lock().driver.set_on_complete(callback);
    }

    /// Signal raised when the transport should close (timeout or abort).
    pub fn abort_signal(&self) -> watch::Receiver<bool> {
        self.abort.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        *self.abort.borrow()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn state(&self) -> UpdateState {
        self.inner.lock().driver.state()
    }

    pub fn result(&self) -> UpdateResult {
        self.inner.lock().driver.result()
    }

    pub fn status_message(&self) -> Option<String> {
        self.inner.lock().driver.status_message().map(str::to_string)
    }

    pub fn needs_reboot(&self) -> bool {
        self.inner.lock().driver.needs_reboot()
    }

    pub fn is_write_finished(&self) -> bool {
        self.inner.lock().driver.is_write_finished()
    }

    pub fn is_finished(&self) -> bool {
        self.inner.lock().driver.is_finished()
    }

    pub fn bytes_downloaded(&self) -> u64 {
        self.inner.lock().driver.bytes_downloaded()
    }

    /// Bytes carried over to the next chunk.
    pub fn pending_input(&self) -> usize {
        self.inner.lock().input.pending_len()
    }
}
