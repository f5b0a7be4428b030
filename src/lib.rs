//! DataVault Library
//!
//! Provisions a removable high-speed storage device for application data
//! and periodically captures, verifies, and expires backups of that data.
//!
//! Restore is a documented manual procedure, not an automated entry
//! point: mount the device (`datavault provision` with `use-existing`),
//! pick a set under `<mountRoot>/backups/<scope>/<timestamp>/`, check it
//! with `datavault verify`, then unpack the archive artifacts with `tar`
//! and feed dump artifacts to the store's restore tool.

pub mod backup;
pub mod cli;
pub mod config;
pub mod error;
pub mod guard;
pub mod inventory;
pub mod layout;
pub mod manifest;
pub mod retention;
pub mod sysexec;
pub mod types;

// Re-export main types for convenience
pub use backup::{
    run_backup, BackupReport, Capturer, Dataset, DatasetKind, ServiceController,
    ServicePauseGuard, SysCapturer, SystemdController,
};
pub use config::VaultConfig;
pub use error::{Result, VaultError};
pub use guard::{
    classify, confirmation_phrase, controlled_release, provision, Decision, DecisionProvider,
    DevicePrompt, GuardState, MountRecord, MountTable, Mounter, ProvisionOutcome,
    RecoveryDecision, SysMounter,
};
pub use inventory::{resolve_device, BlockDevice, DeviceInventory, LsblkInventory};
pub use layout::{apply_ownership, provision_tree, NamespaceSchema, OwnershipPolicy};
pub use manifest::{verify_set, write_manifest, ArtifactEntry, Manifest, MANIFEST_NAME};
pub use retention::{parse_set_timestamp, sweep, RetentionPolicy, SweepReport};
pub use types::{BackupScope, DeviceClass, FilesystemKind, Finding, RunSummary};
