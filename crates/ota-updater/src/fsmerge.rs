//! Filesystem image merging.
//!
//! A filesystem image update replaces the whole directory tree. Files the
//! user created on the old filesystem are carried over into the new one so
//! they survive the update.

use std::fs;
use std::io;
use std::path::Path;

use tracing::{debug, warn};

/// Copy every file present under `old` and absent under `new` into `new`.
///
/// Directories are merged recursively. Files that exist in both trees keep
/// the new content. Returns the number of files copied.
pub fn merge_fs(old: &Path, new: &Path) -> io::Result<usize> {
    if !old.is_dir() {
        debug!("Nothing to merge from {:?}", old);
        return Ok(0);
    }
    fs::create_dir_all(new)?;

    let mut copied = 0;
    for entry in fs::read_dir(old)? {
        let entry = entry?;
        let src = entry.path();
        let dst = new.join(entry.file_name());
        let file_type = entry.file_type()?;

        if file_type.is_dir() {
            copied += merge_fs(&src, &dst)?;
        } else if file_type.is_file() && !dst.exists() {
            copy_file(&src, &dst)?;
            debug!("Merged {:?} -> {:?}", src, dst);
            copied += 1;
        }
    }
    Ok(copied)
}

fn copy_file(src: &Path, dst: &Path) -> io::Result<()> {
    if let Err(e) = fs::copy(src, dst) {
        warn!("Failed to copy {:?}: {}", src, e);
        // Do not leave a truncated file behind.
        let _ = fs::remove_file(dst);
        return Err(e);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_merge_keeps_new_content() {
        let dir = TempDir::new().unwrap();
        let old = dir.path().join("old");
        let new = dir.path().join("new");
        fs::create_dir_all(old.join("data")).unwrap();
        fs::create_dir_all(&new).unwrap();

        fs::write(old.join("conf.json"), "old").unwrap();
        fs::write(old.join("user.txt"), "mine").unwrap();
        fs::write(old.join("data/log.txt"), "log").unwrap();
        fs::write(new.join("conf.json"), "new").unwrap();

        let copied = merge_fs(&old, &new).unwrap();
        assert_eq!(copied, 2);
        assert_eq!(fs::read_to_string(new.join("conf.json")).unwrap(), "new");
        assert_eq!(fs::read_to_string(new.join("user.txt")).unwrap(), "mine");
        assert_eq!(fs::read_to_string(new.join("data/log.txt")).unwrap(), "log");
    }

    #[test]
    fn test_missing_old_tree() {
        let dir = TempDir::new().unwrap();
        let copied = merge_fs(&dir.path().join("absent"), &dir.path().join("new")).unwrap();
        assert_eq!(copied, 0);
    }
}
