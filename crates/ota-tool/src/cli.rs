//! CLI command definitions and argument parsing

use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use serde_json::json;
use tracing::info;

use ota_updater::{
    BootDecision, FinalizeOptions, SessionOptions, UpdateConfig, UpdateError, UpdateResult,
};

use crate::device::{apply_package, build_package, Device, PackEntry};
use crate::ExitCode;

/// OTA Tool - build update packages and drive directory-backed devices
#[derive(Parser, Debug)]
#[command(name = "ota-tool")]
#[command(version, about = "OTA Tool - build update packages and drive directory-backed devices")]
pub struct Cli {
    /// Command to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Debug mode (per-record parser tracing)
    #[arg(long, global = true)]
    pub debug: bool,

    /// Config file path
    #[arg(long, global = true, env = "OTA_TOOL_CONFIG")]
    pub config: Option<PathBuf>,
}

impl Cli {
    /// Execute the CLI command with a pre-loaded configuration
    pub async fn execute_with_config(self, config: UpdateConfig) -> anyhow::Result<ExitCode> {
        match self.command {
            Commands::Pack(args) => args.execute(),
            Commands::Apply(args) => args.execute(config).await,
            Commands::Boot(args) => args.execute(config).await,
            Commands::Commit(args) => {
                let device = Device::open(&args.device, config)?;
                let changed = device.manager.commit()?;
                println!("{}", json!({ "committed": true, "changed": changed }));
                Ok(ExitCode::Success)
            }
            Commands::Revert(args) => {
                let device = Device::open(&args.device.device, config)?;
                let changed = device.manager.revert(args.reboot)?;
                println!("{}", json!({ "reverted": changed }));
                Ok(ExitCode::Success)
            }
            Commands::Status(args) => {
                let device = Device::open(&args.device, config)?;
                let state = device.backend.boot_state()?;
                let parts = device.backend.slot_parts(state.active_slot)?;
                let commit_timeout = device.manager.lifecycle().store().load()?;
                let status = json!({
                    "boot": state,
                    "parts": parts,
                    "commit_timeout": commit_timeout,
                });
                println!("{}", serde_json::to_string_pretty(&status)?);
                Ok(ExitCode::Success)
            }
        }
    }
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Build a stored update package
    Pack(PackArgs),
    /// Stream a package into a device
    Apply(ApplyArgs),
    /// Run the post-reboot lifecycle
    Boot(BootArgs),
    /// Commit the running firmware
    Commit(DeviceArgs),
    /// Revert to the previous firmware
    Revert(RevertArgs),
    /// Show the device boot state
    Status(DeviceArgs),
}

/// Device selection shared by the device commands
#[derive(Args, Debug)]
pub struct DeviceArgs {
    /// Device directory
    #[arg(long, short = 'D', default_value = "device")]
    pub device: PathBuf,
}

/// Package building arguments
#[derive(Args, Debug)]
pub struct PackArgs {
    /// Manifest JSON file, stored first in the package
    #[arg(long, short)]
    pub manifest: PathBuf,

    /// Output package path
    #[arg(long, short)]
    pub out: PathBuf,

    /// Write sizes and CRCs in trailing data descriptors
    #[arg(long)]
    pub descriptors: bool,

    /// Entries as PATH or NAME=PATH
    #[arg(required = true)]
    pub entries: Vec<PackEntry>,
}

impl PackArgs {
    pub fn execute(self) -> anyhow::Result<ExitCode> {
        let data = build_package(&self.manifest, &self.entries, self.descriptors)?;
        std::fs::write(&self.out, &data)?;
        info!("Wrote {} bytes to {}", data.len(), self.out.display());
        println!(
            "{}",
            json!({ "package": self.out, "size": data.len(), "entries": self.entries.len() })
        );
        Ok(ExitCode::Success)
    }
}

/// Package application arguments
#[derive(Args, Debug)]
pub struct ApplyArgs {
    #[command(flatten)]
    pub device: DeviceArgs,

    /// Package file
    pub package: PathBuf,

    /// Seconds to wait for a commit after reboot (0 disables the watchdog)
    #[arg(long, default_value_t = 0)]
    pub commit_timeout: u64,

    /// Session timeout in seconds (defaults to the configured timeout)
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Bytes fed to the engine per call
    #[arg(long, default_value_t = 4096)]
    pub chunk_size: usize,

    /// Apply even if the package has the running version
    #[arg(long)]
    pub force: bool,

    /// Override the running platform
    #[arg(long)]
    pub platform: Option<String>,

    /// Override the running version
    #[arg(long = "fw-version")]
    pub fw_version: Option<String>,

    /// Override the running build ID
    #[arg(long)]
    pub build_id: Option<String>,
}

impl ApplyArgs {
    pub async fn execute(self, mut config: UpdateConfig) -> anyhow::Result<ExitCode> {
        if let Some(platform) = self.platform {
            config.firmware.platform = platform;
        }
        if let Some(version) = self.fw_version {
            config.firmware.version = version;
        }
        if let Some(build_id) = self.build_id {
            config.firmware.build_id = build_id;
        }
        if self.chunk_size == 0 {
            eprintln!("Error: chunk size must be positive");
            return Ok(ExitCode::InvalidInput);
        }

        let archive_size = tokio::fs::metadata(&self.package).await?.len();
        let mut device = Device::open(&self.device.device, config)?;
        let options = SessionOptions {
            timeout: self.timeout.map(Duration::from_secs),
            archive_size: Some(archive_size),
            ignore_same_version: self.force.then_some(false),
        };

        let session = match device.manager.start_session(options) {
            Ok(session) => session,
            Err(e) => {
                device.print_events();
                eprintln!("Error: {e}");
                return Ok(ExitCode::from_update_error(&e));
            }
        };

        let finalize = FinalizeOptions {
            commit_timeout: self.commit_timeout,
        };
        let outcome = tokio::select! {
            outcome = apply_package(&session, &self.package, self.chunk_size, finalize, || device.print_events()) => outcome,
            _ = tokio::signal::ctrl_c() => {
                session.abort("interrupted");
                Err(anyhow::anyhow!("interrupted"))
            }
        };
        device.print_events();

        match outcome {
            Ok(UpdateResult::Success) => {
                info!("Update applied, reboot to activate");
                Ok(ExitCode::Success)
            }
            Ok(UpdateResult::UpToDate) => {
                println!("{}", json!({ "result": "up to date" }));
                Ok(ExitCode::Success)
            }
            Ok(result) => {
                eprintln!("Error: {} ({})", result, session.status_message().unwrap_or_default());
                Ok(ExitCode::UpdateFailed)
            }
            Err(e) => {
                eprintln!("Error: {e}");
                Ok(match e.downcast_ref::<UpdateError>() {
                    Some(err) => ExitCode::from_update_error(err),
                    None => ExitCode::UpdateFailed,
                })
            }
        }
    }
}

/// Post-reboot lifecycle arguments
#[derive(Args, Debug)]
pub struct BootArgs {
    #[command(flatten)]
    pub device: DeviceArgs,

    /// The new firmware failed to start; revert immediately
    #[arg(long)]
    pub failed: bool,

    /// First boot after the update
    #[arg(long)]
    pub first: bool,

    /// Stay running until an armed watchdog fires or the firmware is committed
    #[arg(long)]
    pub wait: bool,
}

impl BootArgs {
    pub async fn execute(self, config: UpdateConfig) -> anyhow::Result<ExitCode> {
        let mut device = Device::open(&self.device.device, config)?;
        let decision = device.manager.boot_finish(!self.failed, self.first)?;
        device.print_events();

        let armed = match decision {
            BootDecision::NothingToDo => "nothing to do".to_string(),
            BootDecision::Reverted => "reverted".to_string(),
            BootDecision::Committed => "committed".to_string(),
            BootDecision::WatchdogArmed(timeout) => format!("watchdog armed for {}s", timeout.as_secs()),
        };
        println!("{}", json!({ "boot": armed }));

        if let BootDecision::WatchdogArmed(timeout) = decision {
            if self.wait {
                let poll = Duration::from_millis(250);
                let deadline = tokio::time::Instant::now() + timeout + poll;
                while tokio::time::Instant::now() < deadline {
                    tokio::time::sleep(poll).await;
                    if device.manager.is_committed()? {
                        break;
                    }
                }
                device.print_events();
                let state = device.backend.boot_state()?;
                println!("{}", json!({ "boot": state }));
            }
        }
        Ok(ExitCode::Success)
    }
}

/// Revert arguments
#[derive(Args, Debug)]
pub struct RevertArgs {
    #[command(flatten)]
    pub device: DeviceArgs,

    /// Restart the device after reverting
    #[arg(long)]
    pub reboot: bool,
}
