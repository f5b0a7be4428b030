//! Mount/Format Guard: safely bring the storage device to a mounted,
//! usable state.
//!
//! The guard is a state machine over a device that may already be in any
//! of several states — empty, carrying a foreign filesystem, already
//! mounted here or elsewhere, partially provisioned. Its one hard rule:
//! any state reachable only via a destructive, irreversible action
//! requires an explicit choice plus an exact confirmation phrase, and is
//! never entered on ambiguous input.
//!
//! # States
//!
//! ```text
//! UNMOUNTED_NO_FS ──format──▶ mount ──▶ PROVISIONED
//! UNMOUNTED_HAS_FS ┐
//! MOUNTED_AT_TARGET ├──▶ DECISION {format, use-existing, skip}
//! MOUNTED_ELSEWHERE ┘        │            │             │
//!                     confirm phrase   mount-if-needed  release
//!                            │            │             │
//!                       PROVISIONED  PROVISIONED     SKIPPED
//! ```
//!
//! A format or mount failure on this path re-enters DECISION with
//! {format-again, skip, abort}; a second failure is fatal. A `skip` from
//! a mounted state runs the controlled release escalation: graceful
//! unmount, then terminate holders and retry, then lazy unmount, then
//! `Unmountable`.

use crate::config::VaultConfig;
use crate::error::{Result, VaultError};
use crate::inventory::{resolve_device, BlockDevice, DeviceInventory};
use crate::sysexec::run_command;
use crate::types::FilesystemKind;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Bounded number of decision rounds before giving up.
const MAX_DECISION_ROUNDS: usize = 3;

// ============================================================================
// Mount table
// ============================================================================

/// Persisted (device, path, fs-type, options) tuple.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountRecord {
    pub device: PathBuf,
    pub mount_path: PathBuf,
    pub fstype: FilesystemKind,
    pub options: String,
}

/// Append-only persisted list of mount records, one JSON object per line.
///
/// At most one record per mount path: appends are keyed by path, so a
/// second provisioning run recognizes the existing record instead of
/// duplicating it.
#[derive(Debug, Clone)]
pub struct MountTable {
    path: PathBuf,
}

impl MountTable {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Read all records. A missing table file means no mounts yet.
    pub fn load(&self) -> Result<Vec<MountRecord>> {
        let data = match fs::read_to_string(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut records = Vec::new();
        for line in data.lines().filter(|l| !l.trim().is_empty()) {
            records.push(serde_json::from_str(line)?);
        }
        Ok(records)
    }

    /// Find the record for a mount path, if any.
    pub fn find(&self, mount_path: &Path) -> Result<Option<MountRecord>> {
        Ok(self
            .load()?
            .into_iter()
            .find(|r| r.mount_path == mount_path))
    }

    /// Append a record unless one already exists for its mount path.
    ///
    /// Returns true if the record was written.
    pub fn append_if_absent(&self, record: &MountRecord) -> Result<bool> {
        if self.find(&record.mount_path)?.is_some() {
            info!(
                "mount record for {} already present, not duplicating",
                record.mount_path.display()
            );
            return Ok(false);
        }
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{}", serde_json::to_string(record)?)?;
        info!(
            "persisted mount record: {} at {}",
            record.device.display(),
            record.mount_path.display()
        );
        Ok(true)
    }
}

// ============================================================================
// Guard states and decisions
// ============================================================================

/// Observable states of the guard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardState {
    UnmountedNoFs,
    UnmountedHasFs,
    MountedAtTarget,
    MountedElsewhere,
    /// Terminal success
    Provisioned,
    /// Terminal: caller declined, no error raised
    Skipped,
    /// Terminal error
    Failed,
}

impl GuardState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Provisioned | Self::Skipped | Self::Failed)
    }
}

impl fmt::Display for GuardState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::UnmountedNoFs => "unmounted, no filesystem",
            Self::UnmountedHasFs => "unmounted, existing filesystem",
            Self::MountedAtTarget => "mounted at target",
            Self::MountedElsewhere => "mounted elsewhere",
            Self::Provisioned => "provisioned",
            Self::Skipped => "skipped",
            Self::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

/// Classify a device relative to the target mount point.
pub fn classify(device: &BlockDevice, target: &Path) -> GuardState {
    match (&device.mountpoint, &device.fs_signature) {
        (Some(at), _) if at == target => GuardState::MountedAtTarget,
        (Some(_), _) => GuardState::MountedElsewhere,
        (None, Some(_)) => GuardState::UnmountedHasFs,
        (None, None) => GuardState::UnmountedNoFs,
    }
}

/// Choice offered when the device already carries a filesystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Destroy the existing filesystem; needs the confirmation phrase
    Format,
    /// Keep the existing filesystem, mount if needed
    UseExisting,
    /// Leave the device alone and end without error
    Skip,
}

/// Choice offered after a mount failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryDecision {
    FormatAgain,
    Skip,
    Abort,
}

/// Context handed to the decision provider when prompting.
#[derive(Debug, Clone)]
pub struct DevicePrompt {
    pub device: PathBuf,
    pub fs_signature: Option<String>,
    pub state: GuardState,
}

/// Capability that supplies decisions and confirmation tokens.
///
/// Replaces interactive terminal prompts so the state machine is
/// testable with scripted responses. For a destructive format the
/// provider must return the exact phrase produced by
/// [`confirmation_phrase`]; it is never inferred from context.
pub trait DecisionProvider {
    fn choose(&mut self, prompt: &DevicePrompt) -> Result<Decision>;
    fn confirm_format(&mut self, prompt: &DevicePrompt) -> Result<String>;
    fn choose_recovery(&mut self, prompt: &DevicePrompt) -> Result<RecoveryDecision>;
}

/// The exact phrase required to authorize a destructive format.
pub fn confirmation_phrase(device: &Path) -> String {
    format!("FORMAT {}", device.display())
}

// ============================================================================
// Mounter capability
// ============================================================================

/// Low-level mount operations behind an interface so tests can simulate
/// damaged media and non-responsive mount holders without touching real
/// devices.
pub trait Mounter {
    fn format(&self, device: &Path, fs: FilesystemKind) -> Result<()>;
    fn mount(&self, device: &Path, mountpoint: &Path, fs: FilesystemKind, options: &str)
        -> Result<()>;
    fn unmount(&self, mountpoint: &Path) -> Result<()>;
    /// Terminate processes holding the mount point.
    fn force_release(&self, mountpoint: &Path) -> Result<()>;
    fn lazy_unmount(&self, mountpoint: &Path) -> Result<()>;
}

/// Production mounter shelling out to the host's mount tooling.
#[derive(Debug, Default)]
pub struct SysMounter;

impl Mounter for SysMounter {
    fn format(&self, device: &Path, fs: FilesystemKind) -> Result<()> {
        let dev = device.display().to_string();
        let args: Vec<&str> = match fs {
            FilesystemKind::Ext4 => vec!["-F", &dev],
            FilesystemKind::Xfs | FilesystemKind::Btrfs => vec!["-f", &dev],
            FilesystemKind::Vfat => vec![&dev],
        };
        run_command(fs.mkfs_command(), &args)?.ensure_success(fs.mkfs_command())
    }

    fn mount(
        &self,
        device: &Path,
        mountpoint: &Path,
        fs: FilesystemKind,
        options: &str,
    ) -> Result<()> {
        fs::create_dir_all(mountpoint)?;
        let dev = device.display().to_string();
        let mnt = mountpoint.display().to_string();
        let fstype = fs.to_string();
        let mut args = vec!["-t", &fstype];
        if !options.is_empty() {
            args.push("-o");
            args.push(options);
        }
        args.push(&dev);
        args.push(&mnt);
        run_command("mount", &args)?.ensure_success("mount")
    }

    fn unmount(&self, mountpoint: &Path) -> Result<()> {
        let mnt = mountpoint.display().to_string();
        run_command("umount", &[&mnt])?.ensure_success("umount")
    }

    fn force_release(&self, mountpoint: &Path) -> Result<()> {
        let mnt = mountpoint.display().to_string();
        // fuser exits non-zero when no holders were found; both outcomes
        // leave the point releasable, so only spawn failures propagate.
        let _ = run_command("fuser", &["-km", &mnt])?;
        std::thread::sleep(std::time::Duration::from_millis(500));
        Ok(())
    }

    fn lazy_unmount(&self, mountpoint: &Path) -> Result<()> {
        let mnt = mountpoint.display().to_string();
        run_command("umount", &["-l", &mnt])?.ensure_success("umount -l")
    }
}

/// Release a mount point, escalating graceful → forced → lazy.
///
/// Raises `Unmountable` rather than silently giving up.
pub fn controlled_release(mounter: &dyn Mounter, mountpoint: &Path) -> Result<()> {
    match mounter.unmount(mountpoint) {
        Ok(()) => {
            info!("released mount point {}", mountpoint.display());
            return Ok(());
        }
        Err(e) => warn!("graceful unmount of {} failed: {}", mountpoint.display(), e),
    }

    if let Err(e) = mounter.force_release(mountpoint) {
        warn!("terminating holders of {} failed: {}", mountpoint.display(), e);
    }
    match mounter.unmount(mountpoint) {
        Ok(()) => {
            info!("released {} after terminating holders", mountpoint.display());
            return Ok(());
        }
        Err(e) => warn!("unmount retry of {} failed: {}", mountpoint.display(), e),
    }

    match mounter.lazy_unmount(mountpoint) {
        Ok(()) => {
            info!("lazy unmount of {} scheduled", mountpoint.display());
            Ok(())
        }
        Err(_) => Err(VaultError::Unmountable(mountpoint.to_path_buf())),
    }
}

// ============================================================================
// Provisioning driver
// ============================================================================

/// Outcome of a provisioning run that did not fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvisionOutcome {
    /// Device mounted and recorded; payload is the mount path
    Provisioned(PathBuf),
    /// Caller declined; device left alone
    Skipped,
}

enum StepOutcome {
    /// Mounted; payload is the filesystem actually mounted, which the
    /// mount record must carry for future remounts
    Done(FilesystemKind),
    Skipped,
}

/// Filesystem to mount a pre-existing signature with.
///
/// Falls back to the configured filesystem when the signature is not
/// one the guard knows how to mount.
fn existing_filesystem(device: &BlockDevice, fallback: FilesystemKind) -> FilesystemKind {
    device
        .fs_signature
        .as_deref()
        .and_then(|sig| sig.parse::<FilesystemKind>().ok())
        .unwrap_or(fallback)
}

/// Bring the candidate device to a mounted, usable state.
///
/// Consults the mount table first: an existing record for the target
/// path makes a second run an idempotent no-op (remounting if the device
/// is not currently mounted) that returns the same mount path.
pub fn provision(
    config: &VaultConfig,
    inventory: &dyn DeviceInventory,
    decisions: &mut dyn DecisionProvider,
    mounter: &dyn Mounter,
) -> Result<ProvisionOutcome> {
    let table = MountTable::new(config.mount_table.clone());
    let device = resolve_device(inventory, config.device_class)?;
    let state = classify(&device, &config.mount_point);
    info!(
        "device {} is {} (target {})",
        device.path.display(),
        state,
        config.mount_point.display()
    );

    if let Some(record) = table.find(&config.mount_point)? {
        info!(
            "mount record for {} already exists; provisioning is idempotent",
            config.mount_point.display()
        );
        if state != GuardState::MountedAtTarget {
            mounter
                .mount(
                    &record.device,
                    &record.mount_path,
                    record.fstype,
                    &record.options,
                )
                .map_err(|e| VaultError::MountFailed {
                    device: record.device.clone(),
                    mountpoint: record.mount_path.clone(),
                    reason: e.to_string(),
                })?;
        }
        return Ok(ProvisionOutcome::Provisioned(config.mount_point.clone()));
    }

    let outcome = match state {
        // No filesystem signature: nothing to destroy, no confirmation needed
        GuardState::UnmountedNoFs => {
            let prompt = prompt_for(&device, state);
            format_and_mount(config, decisions, mounter, &device, &prompt)?
        }
        GuardState::UnmountedHasFs | GuardState::MountedAtTarget | GuardState::MountedElsewhere => {
            decision_rounds(config, decisions, mounter, &device, state)?
        }
        GuardState::Provisioned | GuardState::Skipped | GuardState::Failed => {
            unreachable!("classify never returns a terminal state")
        }
    };

    match outcome {
        StepOutcome::Skipped => Ok(ProvisionOutcome::Skipped),
        StepOutcome::Done(fstype) => {
            table.append_if_absent(&MountRecord {
                device: device.path.clone(),
                mount_path: config.mount_point.clone(),
                fstype,
                options: config.mount_options.clone(),
            })?;
            Ok(ProvisionOutcome::Provisioned(config.mount_point.clone()))
        }
    }
}

fn prompt_for(device: &BlockDevice, state: GuardState) -> DevicePrompt {
    DevicePrompt {
        device: device.path.clone(),
        fs_signature: device.fs_signature.clone(),
        state,
    }
}

/// The DECISION sub-state for a device carrying a filesystem.
///
/// A destructive format is accepted only together with the exact
/// confirmation phrase; any mismatch aborts the format and re-enters the
/// decision. A failed use-existing mount also re-enters once; the second
/// failure is fatal.
fn decision_rounds(
    config: &VaultConfig,
    decisions: &mut dyn DecisionProvider,
    mounter: &dyn Mounter,
    device: &BlockDevice,
    state: GuardState,
) -> Result<StepOutcome> {
    let prompt = prompt_for(device, state);
    let mut still_mounted = matches!(
        state,
        GuardState::MountedAtTarget | GuardState::MountedElsewhere
    );
    let mut mount_failures = 0;

    // Release the pre-existing mount at most once across rounds.
    let release = |mounter: &dyn Mounter, still_mounted: &mut bool| -> Result<()> {
        if *still_mounted {
            if let Some(mountpoint) = device.mountpoint.as_deref() {
                controlled_release(mounter, mountpoint)?;
            }
            *still_mounted = false;
        }
        Ok(())
    };

    for round in 1..=MAX_DECISION_ROUNDS {
        match decisions.choose(&prompt)? {
            Decision::Format => {
                let expected = confirmation_phrase(&device.path);
                let phrase = decisions.confirm_format(&prompt)?;
                if phrase != expected {
                    warn!(
                        "confirmation mismatch for {} (round {}), format aborted",
                        device.path.display(),
                        round
                    );
                    continue;
                }
                release(mounter, &mut still_mounted)?;
                return format_and_mount(config, decisions, mounter, device, &prompt);
            }
            Decision::UseExisting => {
                let fstype = existing_filesystem(device, config.filesystem);
                if state == GuardState::MountedAtTarget && still_mounted {
                    info!("device already mounted at target, using as-is");
                    return Ok(StepOutcome::Done(fstype));
                }
                release(mounter, &mut still_mounted)?;
                match mounter.mount(
                    &device.path,
                    &config.mount_point,
                    fstype,
                    &config.mount_options,
                ) {
                    Ok(()) => return Ok(StepOutcome::Done(fstype)),
                    Err(e) => {
                        mount_failures += 1;
                        if mount_failures >= 2 {
                            return Err(VaultError::MountFailed {
                                device: device.path.clone(),
                                mountpoint: config.mount_point.clone(),
                                reason: e.to_string(),
                            });
                        }
                        warn!("mount of existing filesystem failed, re-entering decision: {}", e);
                        continue;
                    }
                }
            }
            Decision::Skip => {
                release(mounter, &mut still_mounted)?;
                info!("caller declined, device {} left alone", device.path.display());
                return Ok(StepOutcome::Skipped);
            }
        }
    }

    Err(VaultError::confirmation(format!(
        "no valid decision for {} after {} rounds",
        device.path.display(),
        MAX_DECISION_ROUNDS
    )))
}

/// Format the device, then mount it.
///
/// A failure in either step (incompatible or damaged medium) re-enters
/// DECISION with {format-again, skip, abort}; a failure in the retry is
/// fatal.
fn format_and_mount(
    config: &VaultConfig,
    decisions: &mut dyn DecisionProvider,
    mounter: &dyn Mounter,
    device: &BlockDevice,
    prompt: &DevicePrompt,
) -> Result<StepOutcome> {
    let first_err = match do_format(config, mounter, device)
        .and_then(|()| do_mount(config, mounter, device))
    {
        Ok(()) => return Ok(StepOutcome::Done(config.filesystem)),
        Err(e) => e,
    };
    warn!(
        "provisioning step failed on {}: {}",
        device.path.display(),
        first_err
    );

    match decisions.choose_recovery(prompt)? {
        RecoveryDecision::FormatAgain => {
            do_format(config, mounter, device)?;
            do_mount(config, mounter, device)?;
            Ok(StepOutcome::Done(config.filesystem))
        }
        RecoveryDecision::Skip => {
            info!("caller skipped after mount failure on {}", device.path.display());
            Ok(StepOutcome::Skipped)
        }
        RecoveryDecision::Abort => Err(first_err),
    }
}

fn do_format(config: &VaultConfig, mounter: &dyn Mounter, device: &BlockDevice) -> Result<()> {
    info!(
        "formatting {} as {}",
        device.path.display(),
        config.filesystem
    );
    mounter
        .format(&device.path, config.filesystem)
        .map_err(|e| VaultError::FormatFailed {
            device: device.path.clone(),
            reason: e.to_string(),
        })
}

fn do_mount(config: &VaultConfig, mounter: &dyn Mounter, device: &BlockDevice) -> Result<()> {
    mounter
        .mount(
            &device.path,
            &config.mount_point,
            config.filesystem,
            &config.mount_options,
        )
        .map_err(|e| VaultError::MountFailed {
            device: device.path.clone(),
            mountpoint: config.mount_point.clone(),
            reason: e.to_string(),
        })
}
