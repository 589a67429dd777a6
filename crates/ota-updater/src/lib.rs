//! # ota-updater
//!
//! Firmware over-the-air update engine for resource-constrained devices.
//!
//! This crate handles:
//! - Incremental parsing of stored (uncompressed) ZIP update packages
//! - Manifest validation against the running firmware
//! - Streaming entry writes through a device flashing backend
//! - CRC-32 verification of every entry
//! - Commit / revert / watchdog lifecycle after reboot
//!
//! ## Memory
//!
//! Chunks are parsed in place whenever possible. At most one record (a
//! split header or the manifest) is buffered between calls, so memory use is
//! bounded regardless of the package size.

pub mod archive;
pub mod backend;
pub mod checksum;
pub mod commit;
pub mod config;
pub mod driver;
pub mod error;
pub mod events;
pub mod fsmerge;
pub mod input;
pub mod manager;
pub mod manifest;
pub mod package;
pub mod progress;
#[cfg(test)]
mod proptests;
pub mod registry;
pub mod session;
pub mod timer;

// Re-export main types for convenience
pub use backend::{
    BootControl, DirBackend, FileAction, FileInfo, FlashBackend, FlashContext, MemoryBackend,
};
pub use commit::{BootDecision, BootLifecycle, CommitTimeoutStore};
pub use config::{LoggingConfig, UpdateConfig};
pub use driver::{
    Completion, CompletionCallback, Driver, DriverOptions, FinalizeOptions, UpdateResult,
    UpdateState,
};
pub use error::{BackendError, UpdateError};
pub use events::{OtaState, StatusBus, StatusEvent, UpdateSnapshot};
pub use fsmerge::merge_fs;
pub use input::{InputBuffer, InputView};
pub use manager::{OtaManager, SessionOptions};
pub use manifest::{current_platform, FirmwareInfo, Manifest};
pub use package::{Package, PackageBuilder};
pub use registry::SessionRegistry;
pub use session::{SessionHandle, UpdateSession};
pub use timer::{ManualScheduler, Scheduler, TimerId, TokioScheduler};
