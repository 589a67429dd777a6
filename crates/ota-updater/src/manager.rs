//! Update manager - entry point for update sessions and the boot lifecycle.
//!
//! The OtaManager combines the engine components:
//! - SessionRegistry enforcing a single active session
//! - Driver parsing packages and driving the flashing backend
//! - BootLifecycle committing or reverting flashed images
//! - StatusBus publishing status events to any number of observers

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::backend::FlashBackend;
use crate::commit::{BootDecision, BootLifecycle, CommitTimeoutStore};
use crate::config::UpdateConfig;
use crate::driver::{Driver, DriverOptions};
use crate::error::UpdateError;
use crate::events::{OtaState, StatusBus, StatusEvent};
use crate::registry::SessionRegistry;
use crate::session::{SessionHandle, UpdateSession};
use crate::timer::Scheduler;

/// Per-session overrides of the configuration.
#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    /// Session timeout; `None` or zero uses the configured timeout
    pub timeout: Option<Duration>,
    /// Total package size, when known, for percentage progress
    pub archive_size: Option<u64>,
    /// Override of the same-version policy
    pub ignore_same_version: Option<bool>,
}

/// Owns the update machinery of one device.
///
/// # Example
///
/// ```ignore
/// let manager = OtaManager::new(config, Arc::new(backend), Arc::new(TokioScheduler::new()?));
/// let session = manager.start_session(SessionOptions::default())?;
/// for chunk in chunks {
///     session.process(chunk)?;
/// }
/// session.finalize(FinalizeOptions { commit_timeout: 300 })?;
/// ```
pub struct OtaManager<B: FlashBackend> {
    config: UpdateConfig,
    backend: Arc<B>,
    registry: Arc<SessionRegistry>,
    events: StatusBus,
    scheduler: Arc<dyn Scheduler>,
    lifecycle: Arc<BootLifecycle<B>>,
}

impl<B: FlashBackend + 'static> OtaManager<B> {
    pub fn new(config: UpdateConfig, backend: Arc<B>, scheduler: Arc<dyn Scheduler>) -> Self {
        Self::with_events(config, backend, scheduler, StatusBus::default())
    }

    /// Create a manager publishing on an existing bus.
    pub fn with_events(
        config: UpdateConfig,
        backend: Arc<B>,
        scheduler: Arc<dyn Scheduler>,
        events: StatusBus,
    ) -> Self {
        let lifecycle = Arc::new(BootLifecycle::new(
            Arc::clone(&backend),
            CommitTimeoutStore::new(&config.commit_state_file),
            Arc::clone(&scheduler),
            events.clone(),
        ));
        Self {
            config,
            backend,
            registry: Arc::new(SessionRegistry::new()),
            events,
            scheduler,
            lifecycle,
        }
    }

    pub fn config(&self) -> &UpdateConfig {
        &self.config
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    pub fn events(&self) -> &StatusBus {
        &self.events
    }

    /// Receive every status event published after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.events.subscribe()
    }

    pub fn lifecycle(&self) -> &Arc<BootLifecycle<B>> {
        &self.lifecycle
    }

    pub fn is_update_in_progress(&self) -> bool {
        self.registry.is_active()
    }

    /// Start a new update session.
    ///
    /// Fails with [`UpdateError::AlreadyInProgress`] while another session
    /// holds the slot, and with [`UpdateError::NotCommitted`] while the
    /// previous update awaits commit.
    pub fn start_session(
        &self,
        options: SessionOptions,
    ) -> Result<SessionHandle<B::Context>, UpdateError> {
        let Some(generation) = self.registry.try_acquire() else {
            let err = UpdateError::AlreadyInProgress;
            self.events.emit(OtaState::Error, err.to_string(), None);
            return Err(err);
        };

        match self.create_session(generation, &options) {
            Ok(session) => Ok(SessionHandle::new(session)),
            Err(e) => {
                self.registry.release(generation);
                self.events.emit(OtaState::Error, e.to_string(), None);
                Err(e)
            }
        }
    }

    fn create_session(
        &self,
        generation: u64,
        options: &SessionOptions,
    ) -> Result<UpdateSession<B::Context>, UpdateError> {
        if !self.backend.is_committed()? {
            return Err(UpdateError::NotCommitted);
        }
        let ctx = self.backend.create_context()?;

        let timeout = options
            .timeout
            .filter(|t| !t.is_zero())
            .unwrap_or_else(|| self.config.update_timeout());
        let driver_options = DriverOptions {
            firmware: self.config.firmware.clone(),
            ignore_same_version: options
                .ignore_same_version
                .unwrap_or(self.config.ignore_same_version),
            max_manifest_size: self.config.max_manifest_size,
            archive_size: options.archive_size,
            commit_store: CommitTimeoutStore::new(&self.config.commit_state_file),
        };
        debug!("Session {} options: {:?}", generation, driver_options);

        let driver = Driver::new(ctx, driver_options, self.events.clone());
        let session = UpdateSession::start(
            driver,
            generation,
            timeout,
            Arc::clone(&self.registry),
            Arc::clone(&self.scheduler),
            self.events.clone(),
        );
        self.events.emit(
            OtaState::Init,
            format!("starting, timeout {}", timeout.as_secs()),
            None,
        );
        Ok(session)
    }

    pub fn is_committed(&self) -> Result<bool, UpdateError> {
        self.lifecycle.is_committed()
    }

    /// Commit the running image. `Ok(false)` when there was nothing to commit.
    pub fn commit(&self) -> Result<bool, UpdateError> {
        self.lifecycle.commit()
    }

    /// Revert to the previous image. `Ok(false)` when already committed.
    pub fn revert(&self, reboot: bool) -> Result<bool, UpdateError> {
        self.lifecycle.revert(reboot)
    }

    /// Report how the application came up after a reboot.
    pub fn boot_finish(
        &self,
        is_successful: bool,
        is_first: bool,
    ) -> Result<BootDecision, UpdateError> {
        let decision = self.lifecycle.boot_finish(is_successful, is_first)?;
        info!("Boot finished: {:?}", decision);
        Ok(decision)
    }
}
