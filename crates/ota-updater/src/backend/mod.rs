//! Flashing backend interface.
//!
//! The engine never touches flash itself. A [`FlashBackend`] supplies a
//! per-session [`FlashContext`] that performs the writes, and implements
//! [`BootControl`] for the persisted boot-slot bookkeeping used by the
//! commit/revert lifecycle.
//!
//! Two implementations ship with the crate:
//! - [`MemoryBackend`] records everything in memory (tests, simulations)
//! - [`DirBackend`] stages images into slot directories on a filesystem

use std::time::Duration;

use serde::Serialize;
use serde_json::Value;

use crate::error::BackendError;

pub mod dir;
pub mod memory;

pub use dir::DirBackend;
pub use memory::MemoryBackend;

/// What to do with an archive entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileAction {
    /// Stream the entry to the backend
    Write,
    /// Discard the entry body
    Skip,
    /// Fail the update
    Abort,
}

/// The archive entry currently being processed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FileInfo {
    /// Entry name without directories
    pub name: String,
    /// Declared body size
    pub size: u32,
    /// Body bytes processed so far
    pub processed: u32,
}

impl FileInfo {
    pub fn new(name: impl Into<String>, size: u32) -> Self {
        Self {
            name: name.into(),
            size,
            processed: 0,
        }
    }

    /// Body bytes not yet processed.
    pub fn remaining(&self) -> u32 {
        self.size - self.processed
    }

    pub fn is_complete(&self) -> bool {
        self.processed >= self.size
    }
}

/// Per-session flashing context.
///
/// Created when a session starts and dropped when it ends.
pub trait FlashContext: Send {
    /// Start a write plan from the manifest's `parts` description.
    fn begin(&mut self, parts: &Value) -> Result<(), BackendError>;

    /// Decide what to do with the next entry.
    fn file_begin(&mut self, file: &FileInfo) -> FileAction;

    /// Write a range of entry bytes. Returns how many bytes were consumed,
    /// which may be fewer than offered.
    fn file_data(&mut self, file: &FileInfo, data: &[u8]) -> Result<usize, BackendError>;

    /// Write the final bytes of an entry. Must consume all of `tail`.
    fn file_end(&mut self, file: &FileInfo, tail: &[u8]) -> Result<usize, BackendError>;

    /// Commit all writes and select the new boot slot.
    fn finalize(&mut self) -> Result<(), BackendError>;

    /// Human-readable description of the last failure.
    fn status_message(&self) -> Option<String>;
}

/// Persisted boot-slot state.
pub trait BootControl: Send + Sync {
    /// Whether the running image has been committed.
    fn is_committed(&self) -> Result<bool, BackendError>;

    /// Mark the running image permanent.
    fn commit(&self) -> Result<(), BackendError>;

    /// Switch back to the previous boot slot.
    fn revert(&self) -> Result<(), BackendError>;

    /// Arm a hardware watchdog that reverts if the device hangs before commit.
    fn arm_watchdog(&self, _timeout: Duration) -> Result<(), BackendError> {
        Ok(())
    }

    /// Reboot the device.
    fn restart(&self);
}

/// A device flashing backend.
pub trait FlashBackend: BootControl {
    type Context: FlashContext + 'static;

    /// Create the context for a new update session.
    fn create_context(&self) -> Result<Self::Context, BackendError>;
}
