//! Directory-backed device plumbing shared by the commands.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context};
use tokio::io::AsyncReadExt;
use tokio::sync::broadcast::{self, error::TryRecvError};
use tracing::{debug, warn};

use ota_updater::{
    DirBackend, FinalizeOptions, FlashContext, OtaManager, PackageBuilder, SessionHandle,
    StatusEvent, TokioScheduler, UpdateConfig, UpdateError, UpdateResult,
};

/// A device rooted at a directory, with its update manager.
pub struct Device {
    pub backend: Arc<DirBackend>,
    pub manager: OtaManager<DirBackend>,
    events: broadcast::Receiver<StatusEvent>,
}

impl Device {
    /// Open the device at `root`. A relative commit state path is resolved
    /// against the device directory.
    pub fn open(root: &Path, mut config: UpdateConfig) -> anyhow::Result<Self> {
        if config.commit_state_file.is_relative() {
            config.commit_state_file = root.join(&config.commit_state_file);
        }
        let backend = Arc::new(
            DirBackend::open(root).with_context(|| format!("cannot open device at {}", root.display()))?,
        );
        let scheduler = Arc::new(TokioScheduler::new()?);
        let manager = OtaManager::new(config, Arc::clone(&backend), scheduler);
        let events = manager.subscribe();
        Ok(Self {
            backend,
            manager,
            events,
        })
    }

    /// Print the status events published so far, one JSON object per line.
    pub fn print_events(&mut self) {
        loop {
            match self.events.try_recv() {
                Ok(event) => match serde_json::to_string(&event) {
                    Ok(line) => println!("{line}"),
                    Err(e) => warn!("Cannot encode status event: {}", e),
                },
                Err(TryRecvError::Lagged(n)) => warn!("{} status events dropped", n),
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
            }
        }
    }
}

/// Stream a package file into a session, stopping early if the session is
/// cancelled.
pub async fn stream_package<C: FlashContext>(
    session: &SessionHandle<C>,
    path: &Path,
    chunk_size: usize,
    mut on_chunk: impl FnMut(),
) -> anyhow::Result<UpdateResult> {
    let mut file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("cannot open {}", path.display()))?;
    let mut abort = session.abort_signal();
    let mut buf = vec![0u8; chunk_size.max(1)];

    loop {
        let n = tokio::select! {
            read = file.read(&mut buf) => read?,
            _ = abort.changed() => {
                session.abort("transport closed");
                return Err(UpdateError::TimedOut.into());
            }
        };
        if n == 0 {
            break;
        }
        let result = session.process(&buf[..n]);
        on_chunk();
        let result = result?;
        if result != UpdateResult::Pending {
            return Ok(result);
        }
    }
    debug!("Read {} bytes from {}", session.bytes_downloaded(), path.display());
    Ok(session.result())
}

/// Apply a package file and finalize it once complete.
pub async fn apply_package<C: FlashContext>(
    session: &SessionHandle<C>,
    path: &Path,
    chunk_size: usize,
    finalize: FinalizeOptions,
    on_chunk: impl FnMut(),
) -> anyhow::Result<UpdateResult> {
    let result = stream_package(session, path, chunk_size, on_chunk).await?;
    if result != UpdateResult::Pending {
        return Ok(result);
    }
    if !session.is_write_finished() {
        session.abort("package is truncated");
        bail!("package ended before the end of the archive");
    }
    Ok(session.finalize(finalize)?)
}

/// A package entry given on the command line as `PATH` or `NAME=PATH`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackEntry {
    pub name: String,
    pub path: PathBuf,
}

impl std::str::FromStr for PackEntry {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some((name, path)) = s.split_once('=') {
            if name.is_empty() || path.is_empty() {
                bail!("invalid entry {s:?}, expected NAME=PATH");
            }
            return Ok(Self {
                name: name.to_string(),
                path: PathBuf::from(path),
            });
        }
        let path = PathBuf::from(s);
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| anyhow!("cannot derive an entry name from {s:?}"))?
            .to_string();
        Ok(Self { name, path })
    }
}

/// Build a package from a manifest file and entry files.
pub fn build_package(
    manifest: &Path,
    entries: &[PackEntry],
    descriptors: bool,
) -> anyhow::Result<Vec<u8>> {
    let content = std::fs::read_to_string(manifest)
        .with_context(|| format!("cannot read manifest {}", manifest.display()))?;
    let value: serde_json::Value =
        serde_json::from_str(&content).context("manifest is not valid JSON")?;
    // Reject packages the device would refuse anyway.
    ota_updater::Manifest::parse(content.as_bytes())?;

    let mut builder = PackageBuilder::new(value).with_descriptors(descriptors);
    for entry in entries {
        let data = std::fs::read(&entry.path)
            .with_context(|| format!("cannot read {}", entry.path.display()))?;
        builder = builder.entry(&entry.name, &data);
    }
    Ok(builder.build())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ota_updater::FirmwareInfo;
    use tempfile::TempDir;

    #[test]
    fn test_pack_entry_parsing() {
        let entry: PackEntry = "app=build/out/fw.bin".parse().unwrap();
        assert_eq!(entry.name, "app");
        assert_eq!(entry.path, PathBuf::from("build/out/fw.bin"));

        let entry: PackEntry = "build/out/fw.bin".parse().unwrap();
        assert_eq!(entry.name, "fw.bin");

        assert!("=fw.bin".parse::<PackEntry>().is_err());
    }

    #[tokio::test]
    async fn test_pack_and_apply() {
        let dir = TempDir::new().unwrap();
        let manifest = dir.path().join("manifest.json");
        std::fs::write(
            &manifest,
            r#"{"platform": "sim", "version": "2.0", "build_id": "x",
                "parts": {"app": {"src": "fw.bin"}}}"#,
        )
        .unwrap();
        let image = dir.path().join("fw.bin");
        std::fs::write(&image, vec![7u8; 5000]).unwrap();

        let data = build_package(
            &manifest,
            &[image.to_str().unwrap().parse().unwrap()],
            false,
        )
        .unwrap();
        let package = dir.path().join("update.zip");
        std::fs::write(&package, data).unwrap();

        let config = UpdateConfig {
            firmware: FirmwareInfo {
                platform: "sim".to_string(),
                version: "1.0".to_string(),
                build_id: "w".to_string(),
            },
            ..UpdateConfig::default()
        };
        let device_dir = dir.path().join("device");
        let device = Device::open(&device_dir, config).unwrap();
        let session = device.manager.start_session(Default::default()).unwrap();
        let result = apply_package(
            &session,
            &package,
            333,
            FinalizeOptions { commit_timeout: 5 },
            || {},
        )
        .await
        .unwrap();

        assert_eq!(result, UpdateResult::Success);
        assert_eq!(device.backend.boot_state().unwrap().active_slot, 1);
        assert!(device_dir.join("updater.dat").exists());
    }

    #[tokio::test]
    async fn test_truncated_package_is_rejected() {
        let dir = TempDir::new().unwrap();
        let manifest = dir.path().join("manifest.json");
        std::fs::write(
            &manifest,
            r#"{"platform": "sim", "version": "2.0", "build_id": "x",
                "parts": {"app": {"src": "fw.bin"}}}"#,
        )
        .unwrap();
        let image = dir.path().join("fw.bin");
        std::fs::write(&image, b"firmware").unwrap();
        let data = build_package(&manifest, &[image.to_str().unwrap().parse().unwrap()], false)
            .unwrap();
        let package = dir.path().join("update.zip");
        std::fs::write(&package, &data[..data.len() / 2]).unwrap();

        let mut config = UpdateConfig::default();
        config.firmware.platform = "sim".to_string();
        let device = Device::open(&dir.path().join("device"), config).unwrap();
        let session = device.manager.start_session(Default::default()).unwrap();
        let err = apply_package(&session, &package, 64, FinalizeOptions::default(), || {})
            .await
            .unwrap_err();
        assert!(err.to_string().contains("before the end of the archive"));
        assert!(session.is_finished());
    }
}
