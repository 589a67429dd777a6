//! Single active session slot.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::debug;

/// Tracks the one update session allowed at a time.
///
/// Every acquisition gets a fresh generation number. Releasing with a stale
/// generation is ignored, so a late timeout cannot free a slot that a newer
/// session already holds.
#[derive(Debug)]
pub struct SessionRegistry {
    active: Mutex<Option<u64>>,
    next_generation: AtomicU64,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            active: Mutex::new(None),
            next_generation: AtomicU64::new(1),
        }
    }

    /// Claim the slot. `None` when another session holds it.
    pub fn try_acquire(&self) -> Option<u64> {
        let mut active = self.active.lock();
        if active.is_some() {
            return None;
        }
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        *active = Some(generation);
        debug!("Session {} acquired the update slot", generation);
        Some(generation)
    }

    /// Free the slot if `generation` still holds it.
    pub fn release(&self, generation: u64) -> bool {
        let mut active = self.active.lock();
        if *active == Some(generation) {
            *active = None;
            debug!("Session {} released the update slot", generation);
            true
        } else {
            false
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.lock().is_some()
    }

    /// Whether `generation` holds the slot.
    pub fn is_current(&self, generation: u64) -> bool {
        *self.active.lock() == Some(generation)
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
