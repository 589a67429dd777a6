//! Post-update commit, revert and watchdog lifecycle.
//!
//! A freshly flashed image boots uncommitted. Once the application decides
//! the boot was healthy it either commits right away or, if the update asked
//! for a commit timeout, arms a watchdog that reverts to the previous image
//! unless something commits before it fires.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use crate::backend::BootControl;
use crate::error::UpdateError;
use crate::events::{OtaState, StatusBus};
use crate::timer::{Scheduler, TimerId};

/// Default location of the commit-timeout record.
pub const DEFAULT_COMMIT_STATE_FILE: &str = "updater.dat";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
struct CommitRecord {
    commit_timeout: u64,
}

/// Persisted commit timeout, written by finalize and read on the next boot.
#[derive(Debug, Clone)]
pub struct CommitTimeoutStore {
    path: PathBuf,
}

impl CommitTimeoutStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stored timeout in seconds, or 0 when there is no record.
    pub fn load(&self) -> Result<u64, UpdateError> {
        if !self.path.exists() {
            return Ok(0);
        }
        let content = std::fs::read_to_string(&self.path)?;
        let record: CommitRecord = serde_json::from_str(&content)
            .map_err(|e| UpdateError::CommitState(e.to_string()))?;
        info!("Update state: commit timeout {}", record.commit_timeout);
        Ok(record.commit_timeout)
    }

    pub fn save(&self, commit_timeout: u64) -> Result<(), UpdateError> {
        debug!("Writing update state to {:?}", self.path);
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| UpdateError::CommitState(e.to_string()))?;
            }
        }
        let content = serde_json::to_string(&CommitRecord { commit_timeout })?;
        std::fs::write(&self.path, content).map_err(|e| UpdateError::CommitState(e.to_string()))
    }

    /// Remove the record. A missing record is not an error.
    pub fn clear(&self) -> Result<(), UpdateError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// What [`BootLifecycle::boot_finish`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootDecision {
    /// Not the first boot after an update
    NothingToDo,
    /// Boot failed, the previous image was restored
    Reverted,
    /// Commit deferred until the watchdog fires or someone commits
    WatchdogArmed(Duration),
    /// Image committed immediately
    Committed,
}

/// Commit and revert of flashed images.
pub struct BootLifecycle<B: BootControl> {
    backend: Arc<B>,
    store: CommitTimeoutStore,
    scheduler: Arc<dyn Scheduler>,
    events: StatusBus,
    watchdog: Mutex<Option<TimerId>>,
}

impl<B: BootControl + 'static> BootLifecycle<B> {
    pub fn new(
        backend: Arc<B>,
        store: CommitTimeoutStore,
        scheduler: Arc<dyn Scheduler>,
        events: StatusBus,
    ) -> Self {
        Self {
            backend,
            store,
            scheduler,
            events,
            watchdog: Mutex::new(None),
        }
    }

    pub fn store(&self) -> &CommitTimeoutStore {
        &self.store
    }

    pub fn is_committed(&self) -> Result<bool, UpdateError> {
        Ok(self.backend.is_committed()?)
    }

    /// Make the running image permanent.
    ///
    /// Returns `Ok(false)` when it was already committed.
    pub fn commit(&self) -> Result<bool, UpdateError> {
        if self.is_committed()? {
            return Ok(false);
        }
        self.events
            .emit(OtaState::Commit, "OTA success: committing", None);
        self.backend.commit()?;
        self.store.clear()?;
        if let Some(id) = self.watchdog.lock().take() {
            self.scheduler.cancel(id);
        }
        Ok(true)
    }

    /// Return to the previous image, rebooting if asked to.
    ///
    /// Returns `Ok(false)` when the running image is already committed.
    pub fn revert(&self, reboot: bool) -> Result<bool, UpdateError> {
        if self.is_committed()? {
            return Ok(false);
        }
        self.events
            .emit(OtaState::Rollback, "OTA failure: reverting", None);
        self.backend.revert()?;
        if reboot {
            self.backend.restart();
        }
        Ok(true)
    }

    /// Decide the fate of the running image once the application has booted.
    pub fn boot_finish(
        self: &Arc<Self>,
        is_successful: bool,
        is_first: bool,
    ) -> Result<BootDecision, UpdateError> {
        debug!("Boot finished: successful={is_successful} first={is_first}");
        if !is_first {
            return Ok(BootDecision::NothingToDo);
        }
        if !is_successful {
            self.events.emit(OtaState::Rollback, "Reverting OTA", None);
            return Ok(if self.revert(true)? {
                BootDecision::Reverted
            } else {
                BootDecision::NothingToDo
            });
        }

        let commit_timeout = self.store.load()?;
        if commit_timeout == 0 {
            self.commit()?;
            return Ok(BootDecision::Committed);
        }

        let timeout = Duration::from_secs(commit_timeout);
        info!("Arming commit watchdog for {} seconds", commit_timeout);
        self.backend.arm_watchdog(timeout)?;

        let lifecycle = Arc::clone(self);
        let id = self.scheduler.schedule_once(
            timeout,
            Box::new(move || lifecycle.watchdog_expired()),
        );
        if let Some(old) = self.watchdog.lock().replace(id) {
            self.scheduler.cancel(old);
        }
        Ok(BootDecision::WatchdogArmed(timeout))
    }

    /// Commit watchdog expiry: revert unless committed in the meantime.
    pub fn watchdog_expired(&self) {
        self.watchdog.lock().take();
        match self.is_committed() {
            Ok(true) => {}
            Ok(false) => {
                error!("Update commit timeout expired");
                if let Err(e) = self.revert(true) {
                    error!("Revert failed: {}", e);
                }
            }
            Err(e) => error!("Cannot read commit state: {}", e),
        }
    }

    /// Whether a commit watchdog is pending.
    pub fn watchdog_armed(&self) -> bool {
        self.watchdog.lock().is_some()
    }
}
