//! In-memory flashing backend.
//!
//! Records every write instead of touching flash. Failure modes can be
//! configured to exercise the engine's error paths.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tracing::debug;

use super::{BootControl, FileAction, FileInfo, FlashBackend, FlashContext};
use crate::error::BackendError;

#[derive(Debug, Default)]
struct MemoryState {
    // Configuration
    skip: BTreeSet<String>,
    abort: BTreeSet<String>,
    reject_plan: Option<String>,
    write_limit: Option<usize>,
    fail_finalize: Option<String>,
    short_file_end: bool,

    // Boot state
    committed: bool,
    reverts: usize,
    restarts: usize,
    watchdog: Option<Duration>,

    // Session activity
    parts: Option<Value>,
    in_progress: BTreeMap<String, Vec<u8>>,
    files: BTreeMap<String, Vec<u8>>,
    data_calls: usize,
    bytes_written: u64,
    finalized: usize,
    contexts_created: usize,
    contexts_dropped: usize,
}

/// Backend that keeps written images in memory.
///
/// Cloning yields another handle to the same state.
#[derive(Debug, Clone)]
pub struct MemoryBackend {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryBackend {
    /// A backend whose running image is committed.
    pub fn new() -> Self {
        let state = MemoryState {
            committed: true,
            ..MemoryState::default()
        };
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    /// Skip entries with this name.
    pub fn with_skip(self, name: &str) -> Self {
        self.state.lock().skip.insert(name.to_string());
        self
    }

    /// Abort the update when an entry with this name arrives.
    pub fn with_abort(self, name: &str) -> Self {
        self.state.lock().abort.insert(name.to_string());
        self
    }

    /// Reject every write plan with `msg`.
    pub fn with_rejected_plan(self, msg: &str) -> Self {
        self.state.lock().reject_plan = Some(msg.to_string());
        self
    }

    /// Accept at most `limit` bytes per data call.
    pub fn with_write_limit(self, limit: usize) -> Self {
        self.state.lock().write_limit = Some(limit);
        self
    }

    /// Fail the final commit of writes with `msg`.
    pub fn with_finalize_error(self, msg: &str) -> Self {
        self.state.lock().fail_finalize = Some(msg.to_string());
        self
    }

    /// Consume one byte less than offered when finishing an entry.
    pub fn with_short_file_end(self) -> Self {
        self.state.lock().short_file_end = true;
        self
    }

    pub fn set_committed(&self, committed: bool) {
        self.state.lock().committed = committed;
    }

    /// Completed entry contents by name.
    pub fn file(&self, name: &str) -> Option<Vec<u8>> {
        self.state.lock().files.get(name).cloned()
    }

    /// Names of completed entries.
    pub fn file_names(&self) -> Vec<String> {
        self.state.lock().files.keys().cloned().collect()
    }

    /// Bytes accepted by data and end calls.
    pub fn bytes_written(&self) -> u64 {
        self.state.lock().bytes_written
    }

    pub fn data_calls(&self) -> usize {
        self.state.lock().data_calls
    }

    /// Parts description of the last write plan.
    pub fn parts(&self) -> Option<Value> {
        self.state.lock().parts.clone()
    }

    pub fn finalize_count(&self) -> usize {
        self.state.lock().finalized
    }

    pub fn revert_count(&self) -> usize {
        self.state.lock().reverts
    }

    pub fn restart_count(&self) -> usize {
        self.state.lock().restarts
    }

    pub fn watchdog(&self) -> Option<Duration> {
        self.state.lock().watchdog
    }

    /// Contexts created and not yet dropped.
    pub fn live_contexts(&self) -> usize {
        let state = self.state.lock();
        state.contexts_created - state.contexts_dropped
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl BootControl for MemoryBackend {
    fn is_committed(&self) -> Result<bool, BackendError> {
        Ok(self.state.lock().committed)
    }

    fn commit(&self) -> Result<(), BackendError> {
        self.state.lock().committed = true;
        Ok(())
    }

    fn revert(&self) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        state.reverts += 1;
        state.committed = true;
        Ok(())
    }

    fn arm_watchdog(&self, timeout: Duration) -> Result<(), BackendError> {
        self.state.lock().watchdog = Some(timeout);
        Ok(())
    }

    fn restart(&self) {
        self.state.lock().restarts += 1;
    }
}

impl FlashBackend for MemoryBackend {
    type Context = MemoryContext;

    fn create_context(&self) -> Result<MemoryContext, BackendError> {
        self.state.lock().contexts_created += 1;
        Ok(MemoryContext {
            state: Arc::clone(&self.state),
            status: None,
        })
    }
}

/// Session context of a [`MemoryBackend`].
#[derive(Debug)]
pub struct MemoryContext {
    state: Arc<Mutex<MemoryState>>,
    status: Option<String>,
}

impl MemoryContext {
    fn fail(&mut self, msg: String) -> BackendError {
        self.status = Some(msg.clone());
        BackendError(msg)
    }
}

impl FlashContext for MemoryContext {
    fn begin(&mut self, parts: &Value) -> Result<(), BackendError> {
        let reject = self.state.lock().reject_plan.clone();
        if let Some(msg) = reject {
            return Err(self.fail(msg));
        }
        self.state.lock().parts = Some(parts.clone());
        Ok(())
    }

    fn file_begin(&mut self, file: &FileInfo) -> FileAction {
        let mut state = self.state.lock();
        if state.abort.contains(&file.name) {
            drop(state);
            self.status = Some(format!("refusing to write {}", file.name));
            return FileAction::Abort;
        }
        if state.skip.contains(&file.name) {
            debug!("Skipping {}", file.name);
            return FileAction::Skip;
        }
        state.in_progress.insert(file.name.clone(), Vec::new());
        FileAction::Write
    }

    fn file_data(&mut self, file: &FileInfo, data: &[u8]) -> Result<usize, BackendError> {
        let mut state = self.state.lock();
        let n = state.write_limit.map_or(data.len(), |limit| limit.min(data.len()));
        state.data_calls += 1;
        state.bytes_written += n as u64;
        state
            .in_progress
            .entry(file.name.clone())
            .or_default()
            .extend_from_slice(&data[..n]);
        Ok(n)
    }

    fn file_end(&mut self, file: &FileInfo, tail: &[u8]) -> Result<usize, BackendError> {
        let mut state = self.state.lock();
        let n = if state.short_file_end {
            tail.len().saturating_sub(1)
        } else {
            tail.len()
        };
        state.bytes_written += n as u64;
        let mut body = state.in_progress.remove(&file.name).unwrap_or_default();
        body.extend_from_slice(&tail[..n]);
        state.files.insert(file.name.clone(), body);
        Ok(n)
    }

    fn finalize(&mut self) -> Result<(), BackendError> {
        let fail = self.state.lock().fail_finalize.clone();
        if let Some(msg) = fail {
            return Err(self.fail(msg));
        }
        let mut state = self.state.lock();
        state.finalized += 1;
        state.committed = false;
        Ok(())
    }

    fn status_message(&self) -> Option<String> {
        self.status.clone()
    }
}

impl Drop for MemoryContext {
    fn drop(&mut self) {
        self.state.lock().contexts_dropped += 1;
    }
}
