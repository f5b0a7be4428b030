//! Error handling module for DataVault
//!
//! Provides centralized error handling with proper error types using thiserror.
//! All errors in the library should use these types for consistency.
//!
//! Fatal variants abort the current invocation; non-fatal findings (missing
//! artifacts, already-stopped services) are aggregated in a
//! [`crate::types::RunSummary`] instead of being raised here.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for DataVault
#[derive(Error, Debug)]
pub enum VaultError {
    /// No block device matched the configured device class
    #[error("No block device matched class '{0}'")]
    DeviceNotFound(String),

    /// A destructive step was requested without an exact confirmation phrase
    #[error("Confirmation required: {0}")]
    ConfirmationRequired(String),

    /// The mount point could not be released after graceful, forced, and lazy attempts
    #[error("Unable to release mount point {}: still busy after graceful, forced, and lazy unmount", .0.display())]
    Unmountable(PathBuf),

    /// Filesystem creation on the device failed
    #[error("Format failed on {device}: {reason}")]
    FormatFailed { device: PathBuf, reason: String },

    /// Mounting the device failed
    #[error("Mount failed for {device} at {mountpoint}: {reason}")]
    MountFailed {
        device: PathBuf,
        mountpoint: PathBuf,
        reason: String,
    },

    /// Configuration errors (loading, parsing, validation)
    #[error("Configuration error: {0}")]
    Config(String),

    /// External command errors (mkfs, mount, systemctl, tar, ...)
    #[error("System error: {0}")]
    System(String),

    /// IO errors (file operations, directory walks)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for DataVault operations
pub type Result<T> = std::result::Result<T, VaultError>;

// Convenient error constructors
impl VaultError {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a system (external command) error
    pub fn system(msg: impl Into<String>) -> Self {
        Self::System(msg.into())
    }

    /// Create a confirmation-required error
    pub fn confirmation(msg: impl Into<String>) -> Self {
        Self::ConfirmationRequired(msg.into())
    }
}
