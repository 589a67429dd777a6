//! Update manifest parsing and validation.
//!
//! The manifest is the first entry of every update package. It names the
//! target platform, the version and build id being installed, and carries a
//! `parts` description that is forwarded verbatim to the flashing backend.
//!
//! ```json
//! {
//!   "name": "app",
//!   "platform": "esp32",
//!   "version": "1.2.0",
//!   "build_id": "20240101-120000/abc",
//!   "parts": { "app": { "src": "fw.bin" } }
//! }
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::UpdateError;

/// Name of the manifest entry inside an update package.
pub const MANIFEST_FILENAME: &str = "manifest.json";

/// Identity of the firmware currently running on the device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirmwareInfo {
    /// Platform identifier the firmware was built for
    pub platform: String,
    /// Running firmware version
    pub version: String,
    /// Running firmware build id
    pub build_id: String,
}

impl Default for FirmwareInfo {
    fn default() -> Self {
        Self {
            platform: current_platform(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            build_id: "dev".to_string(),
        }
    }
}

/// Parsed update manifest.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Manifest {
    /// Application name (informational, may be empty)
    pub name: String,
    /// Target platform
    pub platform: String,
    /// Version being installed
    pub version: String,
    /// Build id being installed
    pub build_id: String,
    /// Write plan, opaque to the engine
    pub parts: Value,
}

impl Manifest {
    /// Parse and validate a manifest body.
    ///
    /// `platform`, `version`, `build_id` and `parts` must all be present and
    /// non-empty.
    pub fn parse(body: &[u8]) -> Result<Self, UpdateError> {
        let value: Value =
            serde_json::from_slice(body).map_err(|e| UpdateError::ManifestParse(e.to_string()))?;
        let obj = value
            .as_object()
            .ok_or_else(|| UpdateError::ManifestParse("manifest is not a JSON object".to_string()))?;

        let manifest = Self {
            name: text_field(obj, "name"),
            platform: text_field(obj, "platform"),
            version: text_field(obj, "version"),
            build_id: text_field(obj, "build_id"),
            parts: obj.get("parts").cloned().unwrap_or(Value::Null),
        };

        if manifest.platform.is_empty() {
            return Err(UpdateError::MissingManifestField("platform"));
        }
        if manifest.version.is_empty() {
            return Err(UpdateError::MissingManifestField("version"));
        }
        if manifest.build_id.is_empty() {
            return Err(UpdateError::MissingManifestField("build_id"));
        }
        if is_empty_value(&manifest.parts) {
            return Err(UpdateError::MissingManifestField("parts"));
        }

        Ok(manifest)
    }

    /// Reject manifests built for another platform.
    pub fn check_platform(&self, device_platform: &str) -> Result<(), UpdateError> {
        if platform_matches(&self.platform, device_platform) {
            Ok(())
        } else {
            Err(UpdateError::WrongPlatform {
                expected: device_platform.to_string(),
                actual: self.platform.clone(),
            })
        }
    }

    /// Whether this manifest describes exactly the running firmware.
    pub fn is_same_version(&self, running: &FirmwareInfo) -> bool {
        self.version == running.version && self.build_id == running.build_id
    }
}

/// Case-insensitive prefix comparison over the device identifier's length.
///
/// A manifest platform that merely starts with the device identifier (for
/// example `esp32-devkit` on an `esp32` device) is accepted.
pub fn platform_matches(manifest_platform: &str, device_platform: &str) -> bool {
    let manifest = manifest_platform.as_bytes();
    let device = device_platform.as_bytes();
    manifest.len() >= device.len() && manifest[..device.len()].eq_ignore_ascii_case(device)
}

/// Platform identifier of the build target.
pub fn current_platform() -> String {
    let arch = if cfg!(target_arch = "x86_64") {
        "x86_64"
    } else if cfg!(target_arch = "aarch64") {
        "aarch64"
    } else if cfg!(target_arch = "arm") {
        "arm"
    } else if cfg!(target_arch = "riscv32") {
        "riscv32"
    } else {
        "unknown"
    };
    arch.to_string()
}

fn text_field(obj: &Map<String, Value>, key: &str) -> String {
    match obj.get(key) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}

fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(m) => m.is_empty(),
        Value::Bool(_) | Value::Number(_) => false,
    }
}
