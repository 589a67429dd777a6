//! Directory-backed flashing backend.
//!
//! Emulates an A/B flash layout on a regular filesystem. Each slot is a
//! directory; an update is staged into the inactive slot and the boot state
//! file selects which slot runs next.
//!
//! ```text
//! root/
//! ├── boot_state.json     # active slot, revert slot, committed flag
//! └── slots/
//!     ├── 0/
//!     │   ├── fw.bin
//!     │   ├── fs/         # filesystem tree, merged on update
//!     │   └── parts.json  # sha256 of every written part
//!     └── 1/
//! ```
//!
//! The manifest `parts` object maps part names to descriptions with a `src`
//! entry naming the archive file to write. Archive entries that no part
//! references are skipped.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use super::{BootControl, FileAction, FileInfo, FlashBackend, FlashContext};
use crate::error::BackendError;
use crate::fsmerge::merge_fs;

/// Boot state file name under the backend root.
const BOOT_STATE_FILE: &str = "boot_state.json";
/// Per-slot record of written parts.
const PARTS_FILE: &str = "parts.json";
/// Per-slot filesystem directory carried over on update.
const FS_DIR: &str = "fs";

/// Persisted slot selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootState {
    /// Slot booted next
    pub active_slot: u8,
    /// Slot to return to on revert
    pub revert_slot: u8,
    /// Whether the active slot is permanent
    pub committed: bool,
}

impl Default for BootState {
    fn default() -> Self {
        Self {
            active_slot: 0,
            revert_slot: 0,
            committed: true,
        }
    }
}

/// Record of one written part.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartRecord {
    /// Archive entry the part was written from
    pub src: String,
    pub size: u64,
    /// Hex-encoded SHA-256 of the written bytes
    pub sha256: String,
}

/// A/B slot backend rooted at a directory.
#[derive(Debug, Clone)]
pub struct DirBackend {
    root: PathBuf,
}

impl DirBackend {
    /// Open (or initialise) a backend at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, BackendError> {
        let root = root.into();
        fs::create_dir_all(root.join("slots").join("0"))?;
        fs::create_dir_all(root.join("slots").join("1"))?;
        let backend = Self { root };
        if !backend.state_path().exists() {
            backend.store_state(&BootState::default())?;
        }
        Ok(backend)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory of a slot.
    pub fn slot_dir(&self, slot: u8) -> PathBuf {
        self.root.join("slots").join(slot.to_string())
    }

    /// Directory of the slot that boots next.
    pub fn active_dir(&self) -> Result<PathBuf, BackendError> {
        Ok(self.slot_dir(self.boot_state()?.active_slot))
    }

    pub fn boot_state(&self) -> Result<BootState, BackendError> {
        let content = fs::read_to_string(self.state_path())?;
        serde_json::from_str(&content)
            .map_err(|e| BackendError(format!("corrupt boot state: {e}")))
    }

    /// Parts written into a slot by its last update.
    pub fn slot_parts(&self, slot: u8) -> Result<BTreeMap<String, PartRecord>, BackendError> {
        let path = self.slot_dir(slot).join(PARTS_FILE);
        if !path.exists() {
            return Ok(BTreeMap::new());
        }
        let content = fs::read_to_string(path)?;
        serde_json::from_str(&content).map_err(|e| BackendError(format!("corrupt parts file: {e}")))
    }

    fn state_path(&self) -> PathBuf {
        self.root.join(BOOT_STATE_FILE)
    }

    fn store_state(&self, state: &BootState) -> Result<(), BackendError> {
        let content = serde_json::to_string_pretty(state)
            .map_err(|e| BackendError(format!("cannot encode boot state: {e}")))?;
        // Write-then-rename so a crash never leaves a torn state file.
        let tmp = self.root.join(format!("{BOOT_STATE_FILE}.tmp"));
        fs::write(&tmp, content)?;
        fs::rename(&tmp, self.state_path())?;
        Ok(())
    }
}

impl BootControl for DirBackend {
    fn is_committed(&self) -> Result<bool, BackendError> {
        Ok(self.boot_state()?.committed)
    }

    fn commit(&self) -> Result<(), BackendError> {
        let mut state = self.boot_state()?;
        state.committed = true;
        state.revert_slot = state.active_slot;
        self.store_state(&state)?;
        info!("Committed slot {}", state.active_slot);
        Ok(())
    }

    fn revert(&self) -> Result<(), BackendError> {
        let mut state = self.boot_state()?;
        info!(
            "Reverting from slot {} to slot {}",
            state.active_slot, state.revert_slot
        );
        state.active_slot = state.revert_slot;
        state.committed = true;
        self.store_state(&state)
    }

    fn arm_watchdog(&self, timeout: std::time::Duration) -> Result<(), BackendError> {
        debug!("No hardware watchdog, commit timeout {:?} is software only", timeout);
        Ok(())
    }

    fn restart(&self) {
        warn!("Restart requested; directory backend cannot reboot the host");
    }
}

impl FlashBackend for DirBackend {
    type Context = DirContext;

    fn create_context(&self) -> Result<DirContext, BackendError> {
        Ok(DirContext {
            backend: self.clone(),
            staging: None,
            sources: BTreeMap::new(),
            current: None,
            written: BTreeMap::new(),
            status: None,
        })
    }
}

/// Entry being written.
struct OpenPart {
    part: String,
    file: File,
    hasher: Sha256,
    size: u64,
}

/// Session context of a [`DirBackend`].
pub struct DirContext {
    backend: DirBackend,
    staging: Option<u8>,
    /// Archive entry name -> part name
    sources: BTreeMap<String, String>,
    current: Option<OpenPart>,
    written: BTreeMap<String, PartRecord>,
    status: Option<String>,
}

impl DirContext {
    fn fail(&mut self, msg: impl Into<String>) -> BackendError {
        let msg = msg.into();
        self.status = Some(msg.clone());
        BackendError(msg)
    }

    fn staging_dir(&self) -> Result<PathBuf, BackendError> {
        self.staging
            .map(|slot| self.backend.slot_dir(slot))
            .ok_or_else(|| BackendError::new("no write plan"))
    }

    fn write_current(&mut self, data: &[u8]) -> Result<usize, BackendError> {
        let Some(open) = self.current.as_mut() else {
            return Err(self.fail("no entry open for writing"));
        };
        if let Err(e) = open.file.write_all(data) {
            let msg = format!("write failed: {e}");
            return Err(self.fail(msg));
        }
        open.hasher.update(data);
        open.size += data.len() as u64;
        Ok(data.len())
    }
}

impl FlashContext for DirContext {
    fn begin(&mut self, parts: &Value) -> Result<(), BackendError> {
        let Some(parts) = parts.as_object() else {
            return Err(self.fail("parts must be an object"));
        };

        let mut sources = BTreeMap::new();
        for (part, desc) in parts {
            match desc.get("src").and_then(Value::as_str) {
                Some(src) => {
                    sources.insert(src.to_string(), part.clone());
                }
                None => return Err(self.fail(format!("part {part} has no src"))),
            }
        }

        let state = self.backend.boot_state()?;
        let staging = 1 - state.active_slot.min(1);
        let dir = self.backend.slot_dir(staging);
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
        }
        fs::create_dir_all(&dir)?;
        info!("Staging {} parts into slot {}", sources.len(), staging);

        self.staging = Some(staging);
        self.sources = sources;
        self.written.clear();
        Ok(())
    }

    fn file_begin(&mut self, file: &FileInfo) -> FileAction {
        let Some(part) = self.sources.get(&file.name).cloned() else {
            debug!("{} is not part of the write plan, skipping", file.name);
            return FileAction::Skip;
        };
        let dir = match self.staging_dir() {
            Ok(dir) => dir,
            Err(e) => {
                self.status = Some(e.0);
                return FileAction::Abort;
            }
        };
        match File::create(dir.join(&file.name)) {
            Ok(handle) => {
                debug!("Writing {} for part {}", file.name, part);
                self.current = Some(OpenPart {
                    part,
                    file: handle,
                    hasher: Sha256::new(),
                    size: 0,
                });
                FileAction::Write
            }
            Err(e) => {
                self.status = Some(format!("cannot create {}: {e}", file.name));
                FileAction::Abort
            }
        }
    }

    fn file_data(&mut self, _file: &FileInfo, data: &[u8]) -> Result<usize, BackendError> {
        self.write_current(data)
    }

    fn file_end(&mut self, file: &FileInfo, tail: &[u8]) -> Result<usize, BackendError> {
        let n = self.write_current(tail)?;
        let Some(open) = self.current.take() else {
            return Err(self.fail("no entry open for writing"));
        };
        if let Err(e) = open.file.sync_all() {
            let msg = format!("sync failed: {e}");
            return Err(self.fail(msg));
        }
        let record = PartRecord {
            src: file.name.clone(),
            size: open.size,
            sha256: hex::encode(open.hasher.finalize()),
        };
        debug!("Part {} written, sha256 {}", open.part, record.sha256);
        self.written.insert(open.part, record);
        Ok(n)
    }

    fn finalize(&mut self) -> Result<(), BackendError> {
        let staging = self.staging_dir()?;
        let missing: Vec<_> = self
            .sources
            .values()
            .filter(|part| !self.written.contains_key(*part))
            .cloned()
            .collect();
        if !missing.is_empty() {
            return Err(self.fail(format!("parts not written: {}", missing.join(", "))));
        }

        let content = serde_json::to_string_pretty(&self.written)
            .map_err(|e| BackendError(format!("cannot encode parts: {e}")))?;
        fs::write(staging.join(PARTS_FILE), content)?;

        let active = self.backend.active_dir()?;
        let merged = merge_fs(&active.join(FS_DIR), &staging.join(FS_DIR))?;
        if merged > 0 {
            info!("Carried over {} files from the old filesystem", merged);
        }

        let mut state = self.backend.boot_state()?;
        let staging_slot = self.staging.unwrap_or(state.active_slot);
        state.revert_slot = state.active_slot;
        state.active_slot = staging_slot;
        state.committed = false;
        self.backend.store_state(&state)?;
        info!("Slot {} selected for next boot", staging_slot);
        Ok(())
    }

    fn status_message(&self) -> Option<String> {
        self.status.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn write_entry(ctx: &mut DirContext, name: &str, body: &[u8]) {
        let file = FileInfo::new(name, body.len() as u32);
        assert_eq!(ctx.file_begin(&file), FileAction::Write);
        let (head, tail) = body.split_at(body.len() / 2);
        ctx.file_data(&file, head).unwrap();
        ctx.file_end(&file, tail).unwrap();
    }

    #[test]
    fn test_fresh_backend_is_committed() {
        let dir = TempDir::new().unwrap();
        let backend = DirBackend::open(dir.path()).unwrap();
        assert!(backend.is_committed().unwrap());
        assert_eq!(backend.boot_state().unwrap(), BootState::default());
    }

    #[test]
    fn test_stage_and_switch_slot() {
        let dir = TempDir::new().unwrap();
        let backend = DirBackend::open(dir.path()).unwrap();
        let mut ctx = backend.create_context().unwrap();

        ctx.begin(&json!({"app": {"src": "fw.bin"}})).unwrap();
        assert_eq!(ctx.file_begin(&FileInfo::new("notes.txt", 3)), FileAction::Skip);
        write_entry(&mut ctx, "fw.bin", b"firmware");
        ctx.finalize().unwrap();

        let state = backend.boot_state().unwrap();
        assert_eq!(state.active_slot, 1);
        assert_eq!(state.revert_slot, 0);
        assert!(!state.committed);
        assert_eq!(fs::read(backend.slot_dir(1).join("fw.bin")).unwrap(), b"firmware");

        let parts = backend.slot_parts(1).unwrap();
        assert_eq!(parts["app"].size, 8);
        assert_eq!(parts["app"].sha256, hex::encode(Sha256::digest(b"firmware")));
    }

    #[test]
    fn test_finalize_requires_every_part() {
        let dir = TempDir::new().unwrap();
        let backend = DirBackend::open(dir.path()).unwrap();
        let mut ctx = backend.create_context().unwrap();

        ctx.begin(&json!({"app": {"src": "fw.bin"}, "fs": {"src": "fs.bin"}}))
            .unwrap();
        write_entry(&mut ctx, "fw.bin", b"firmware");
        let err = ctx.finalize().unwrap_err();
        assert_eq!(err.0, "parts not written: fs");
        assert!(backend.is_committed().unwrap());
    }

    #[test]
    fn test_plan_without_src_is_rejected() {
        let dir = TempDir::new().unwrap();
        let backend = DirBackend::open(dir.path()).unwrap();
        let mut ctx = backend.create_context().unwrap();
        assert!(ctx.begin(&json!({"app": {}})).is_err());
        assert_eq!(ctx.status_message().unwrap(), "part app has no src");
        assert!(ctx.begin(&json!(["fw.bin"])).is_err());
    }

    #[test]
    fn test_commit_and_revert() {
        let dir = TempDir::new().unwrap();
        let backend = DirBackend::open(dir.path()).unwrap();
        let mut ctx = backend.create_context().unwrap();
        ctx.begin(&json!({"app": {"src": "fw.bin"}})).unwrap();
        write_entry(&mut ctx, "fw.bin", b"v2");
        ctx.finalize().unwrap();

        backend.revert().unwrap();
        let state = backend.boot_state().unwrap();
        assert_eq!(state.active_slot, 0);
        assert!(state.committed);

        // Second update lands in slot 1 again and is committed.
        let mut ctx = backend.create_context().unwrap();
        ctx.begin(&json!({"app": {"src": "fw.bin"}})).unwrap();
        write_entry(&mut ctx, "fw.bin", b"v3");
        ctx.finalize().unwrap();
        backend.commit().unwrap();
        let state = backend.boot_state().unwrap();
        assert_eq!(state.active_slot, 1);
        assert_eq!(state.revert_slot, 1);
        assert!(state.committed);
    }

    #[test]
    fn test_user_files_survive_update() {
        let dir = TempDir::new().unwrap();
        let backend = DirBackend::open(dir.path()).unwrap();
        let fs_dir = backend.slot_dir(0).join(FS_DIR);
        fs::create_dir_all(&fs_dir).unwrap();
        fs::write(fs_dir.join("wifi.json"), "{}").unwrap();

        let mut ctx = backend.create_context().unwrap();
        ctx.begin(&json!({"app": {"src": "fw.bin"}})).unwrap();
        write_entry(&mut ctx, "fw.bin", b"v2");
        ctx.finalize().unwrap();

        let carried = backend.slot_dir(1).join(FS_DIR).join("wifi.json");
        assert_eq!(fs::read_to_string(carried).unwrap(), "{}");
    }
}
