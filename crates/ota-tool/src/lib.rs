//! OTA Tool - CLI for firmware update packages and devices
//!
//! This crate provides a command-line interface for:
//! - Building stored update packages from a manifest and images
//! - Streaming a package into a directory-backed device
//! - Running the post-reboot commit / revert lifecycle
//! - Inspecting a device's boot slots

pub mod cli;
pub mod device;

pub use cli::Cli;

/// Exit codes for CLI operations
///
/// - 0: Success - operation completed successfully
/// - 1: General error - unspecified error occurred
/// - 2: Update failed - the package was rejected or could not be applied
/// - 3: Timeout - the update session timed out
/// - 5: Invalid input - bad arguments or data provided
/// - 6: Not committed - the previous update awaits commit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitCode {
    /// Operation completed successfully (exit code 0)
    Success = 0,
    /// General error (exit code 1)
    GeneralError = 1,
    /// Update failed (exit code 2)
    UpdateFailed = 2,
    /// Update session timed out (exit code 3)
    Timeout = 3,
    /// Invalid input provided (exit code 5)
    InvalidInput = 5,
    /// Previous update not committed (exit code 6)
    NotCommitted = 6,
}

impl From<ExitCode> for i32 {
    fn from(code: ExitCode) -> Self {
        code as i32
    }
}

impl ExitCode {
    /// Convert to process exit code
    pub fn to_exit_code(self) -> std::process::ExitCode {
        std::process::ExitCode::from(self as u8)
    }

    /// Map an engine error to the exit code reported for it.
    pub fn from_update_error(err: &ota_updater::UpdateError) -> Self {
        use ota_updater::UpdateError;
        match err {
            UpdateError::TimedOut => ExitCode::Timeout,
            UpdateError::NotCommitted => ExitCode::NotCommitted,
            UpdateError::ConfigError(_) => ExitCode::InvalidInput,
            UpdateError::IoError(_) => ExitCode::GeneralError,
            _ => ExitCode::UpdateFailed,
        }
    }
}

#[cfg(test)]
mod exit_code_tests {
    use super::*;
    use ota_updater::UpdateError;

    #[test]
    fn test_exit_code_values() {
        assert_eq!(ExitCode::Success as i32, 0);
        assert_eq!(ExitCode::GeneralError as i32, 1);
        assert_eq!(ExitCode::UpdateFailed as i32, 2);
        assert_eq!(ExitCode::Timeout as i32, 3);
        assert_eq!(ExitCode::InvalidInput as i32, 5);
        assert_eq!(ExitCode::NotCommitted as i32, 6);
    }

    #[test]
    fn test_update_error_mapping() {
        assert_eq!(ExitCode::from_update_error(&UpdateError::TimedOut), ExitCode::Timeout);
        assert_eq!(
            ExitCode::from_update_error(&UpdateError::NotCommitted),
            ExitCode::NotCommitted
        );
        assert_eq!(
            ExitCode::from_update_error(&UpdateError::InvalidHeader),
            ExitCode::UpdateFailed
        );
    }
}
