//! Integration tests for the provisioning path: device resolution, the
//! mount/format guard state machine, and directory layout.
//!
//! All device and terminal interactions go through scripted fakes; no
//! real block devices, mounts, or prompts are involved.

use datavault::{
    classify, confirmation_phrase, guard, provision_tree, BackupScope, BlockDevice, Decision,
    DecisionProvider, DeviceInventory, DevicePrompt, FilesystemKind, GuardState, MountTable,
    Mounter, ProvisionOutcome, RecoveryDecision, VaultConfig, VaultError,
};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};

// =============================================================================
// Fakes
// =============================================================================

struct FakeInventory(Vec<BlockDevice>);

impl DeviceInventory for FakeInventory {
    fn enumerate(&self) -> datavault::Result<Vec<BlockDevice>> {
        Ok(self.0.clone())
    }
}

fn usb_device(fs: Option<&str>, mounted_at: Option<&str>) -> BlockDevice {
    BlockDevice {
        name: "sdb".to_string(),
        path: PathBuf::from("/dev/sdb"),
        fs_signature: fs.map(str::to_string),
        mountpoint: mounted_at.map(PathBuf::from),
        transport: Some("usb".to_string()),
        removable: true,
        size_bytes: 500_107_862_016,
    }
}

/// Scripted decision provider; panics if asked for more than scripted.
#[derive(Default)]
struct ScriptedDecisions {
    choices: VecDeque<Decision>,
    phrases: VecDeque<String>,
    recoveries: VecDeque<RecoveryDecision>,
}

impl ScriptedDecisions {
    fn choices(mut self, choices: &[Decision]) -> Self {
        self.choices = choices.iter().copied().collect();
        self
    }

    fn phrases(mut self, phrases: &[&str]) -> Self {
        self.phrases = phrases.iter().map(|s| s.to_string()).collect();
        self
    }

    fn recoveries(mut self, recoveries: &[RecoveryDecision]) -> Self {
        self.recoveries = recoveries.iter().copied().collect();
        self
    }
}

impl DecisionProvider for ScriptedDecisions {
    fn choose(&mut self, _prompt: &DevicePrompt) -> datavault::Result<Decision> {
        Ok(self.choices.pop_front().expect("unscripted choose() call"))
    }

    fn confirm_format(&mut self, _prompt: &DevicePrompt) -> datavault::Result<String> {
        Ok(self.phrases.pop_front().expect("unscripted confirm_format() call"))
    }

    fn choose_recovery(&mut self, _prompt: &DevicePrompt) -> datavault::Result<RecoveryDecision> {
        Ok(self
            .recoveries
            .pop_front()
            .expect("unscripted choose_recovery() call"))
    }
}

/// Mounter recording its calls, with scriptable failures.
#[derive(Default)]
struct FakeMounter {
    calls: RefCell<Vec<String>>,
    /// Number of format() calls that fail before formats start succeeding
    failing_formats: RefCell<usize>,
    /// Number of mount() calls that fail before mounts start succeeding
    failing_mounts: RefCell<usize>,
    /// Number of unmount() calls that fail
    failing_unmounts: RefCell<usize>,
    lazy_fails: bool,
}

impl FakeMounter {
    fn calls(&self) -> Vec<String> {
        self.calls.borrow().clone()
    }

    fn count(&self, op: &str) -> usize {
        self.calls
            .borrow()
            .iter()
            .filter(|c| c.starts_with(op))
            .count()
    }
}

impl Mounter for FakeMounter {
    fn format(&self, device: &Path, fs: FilesystemKind) -> datavault::Result<()> {
        self.calls
            .borrow_mut()
            .push(format!("format {} {}", device.display(), fs));
        let mut failing = self.failing_formats.borrow_mut();
        if *failing > 0 {
            *failing -= 1;
            return Err(VaultError::system("simulated mkfs failure"));
        }
        Ok(())
    }

    fn mount(
        &self,
        device: &Path,
        mountpoint: &Path,
        fs: FilesystemKind,
        _options: &str,
    ) -> datavault::Result<()> {
        self.calls.borrow_mut().push(format!(
            "mount {} {} {}",
            device.display(),
            mountpoint.display(),
            fs
        ));
        let mut failing = self.failing_mounts.borrow_mut();
        if *failing > 0 {
            *failing -= 1;
            return Err(VaultError::system("simulated mount failure"));
        }
        Ok(())
    }

    fn unmount(&self, mountpoint: &Path) -> datavault::Result<()> {
        self.calls
            .borrow_mut()
            .push(format!("unmount {}", mountpoint.display()));
        let mut failing = self.failing_unmounts.borrow_mut();
        if *failing > 0 {
            *failing -= 1;
            return Err(VaultError::system("simulated busy mount"));
        }
        Ok(())
    }

    fn force_release(&self, mountpoint: &Path) -> datavault::Result<()> {
        self.calls
            .borrow_mut()
            .push(format!("force_release {}", mountpoint.display()));
        Ok(())
    }

    fn lazy_unmount(&self, mountpoint: &Path) -> datavault::Result<()> {
        self.calls
            .borrow_mut()
            .push(format!("lazy_unmount {}", mountpoint.display()));
        if self.lazy_fails {
            return Err(VaultError::system("simulated lazy failure"));
        }
        Ok(())
    }
}

/// Config rooted in a temp dir so mount table and layout are real files.
fn test_config(root: &Path) -> VaultConfig {
    let mut config = VaultConfig::default();
    config.mount_point = root.join("mnt");
    config.mount_table = root.join("state/mounts.json");
    std::fs::create_dir_all(&config.mount_point).expect("mkdir mount point");
    config
}

// =============================================================================
// Guard scenarios
// =============================================================================

#[test]
fn blank_device_is_formatted_and_mounted_without_prompting() {
    let root = tempfile::tempdir().expect("tempdir");
    let config = test_config(root.path());
    let inventory = FakeInventory(vec![usb_device(None, None)]);
    let mut decisions = ScriptedDecisions::default(); // any prompt would panic
    let mounter = FakeMounter::default();

    let outcome =
        guard::provision(&config, &inventory, &mut decisions, &mounter).expect("provision");
    assert_eq!(outcome, ProvisionOutcome::Provisioned(config.mount_point.clone()));
    assert_eq!(mounter.count("format"), 1);
    assert_eq!(mounter.count("mount "), 1);

    let table = MountTable::new(config.mount_table.clone());
    assert_eq!(table.load().expect("table").len(), 1);
}

#[test]
fn provision_twice_is_idempotent_and_returns_same_path() {
    let root = tempfile::tempdir().expect("tempdir");
    let config = test_config(root.path());
    let mounter = FakeMounter::default();

    let inventory = FakeInventory(vec![usb_device(None, None)]);
    let mut decisions = ScriptedDecisions::default();
    let first =
        guard::provision(&config, &inventory, &mut decisions, &mounter).expect("first run");

    // Second run: device now carries a filesystem and sits at the target
    let target = config.mount_point.to_string_lossy().to_string();
    let inventory = FakeInventory(vec![usb_device(Some("ext4"), Some(&target))]);
    let mut decisions = ScriptedDecisions::default();
    let second =
        guard::provision(&config, &inventory, &mut decisions, &mounter).expect("second run");

    assert_eq!(first, second);
    assert_eq!(mounter.count("format"), 1, "second run must not format");

    let table = MountTable::new(config.mount_table.clone());
    assert_eq!(table.load().expect("table").len(), 1, "record never duplicated");
}

#[test]
fn mount_record_triggers_remount_after_reboot() {
    let root = tempfile::tempdir().expect("tempdir");
    let config = test_config(root.path());
    let mounter = FakeMounter::default();

    let inventory = FakeInventory(vec![usb_device(None, None)]);
    guard::provision(&config, &inventory, &mut ScriptedDecisions::default(), &mounter)
        .expect("first run");

    // After a reboot the device has a filesystem but is unmounted
    let inventory = FakeInventory(vec![usb_device(Some("ext4"), None)]);
    let outcome =
        guard::provision(&config, &inventory, &mut ScriptedDecisions::default(), &mounter)
            .expect("remount run");
    assert_eq!(outcome, ProvisionOutcome::Provisioned(config.mount_point.clone()));
    assert_eq!(mounter.count("mount "), 2, "remounted from the persisted record");
    assert_eq!(mounter.count("format"), 1);
}

#[test]
fn format_requires_exact_confirmation_phrase() {
    let root = tempfile::tempdir().expect("tempdir");
    let config = test_config(root.path());
    let inventory = FakeInventory(vec![usb_device(Some("ext4"), None)]);
    let mounter = FakeMounter::default();

    // Wrong phrase re-enters the decision; right phrase proceeds
    let mut decisions = ScriptedDecisions::default()
        .choices(&[Decision::Format, Decision::Format])
        .phrases(&["format /dev/sdb", &confirmation_phrase(Path::new("/dev/sdb"))]);

    let outcome =
        guard::provision(&config, &inventory, &mut decisions, &mounter).expect("provision");
    assert!(matches!(outcome, ProvisionOutcome::Provisioned(_)));
    assert_eq!(mounter.count("format"), 1);
}

#[test]
fn repeated_confirmation_mismatch_never_formats() {
    let root = tempfile::tempdir().expect("tempdir");
    let config = test_config(root.path());
    let inventory = FakeInventory(vec![usb_device(Some("ext4"), None)]);
    let mounter = FakeMounter::default();

    let mut decisions = ScriptedDecisions::default()
        .choices(&[Decision::Format, Decision::Format, Decision::Format])
        .phrases(&["yes", "FORMAT", "FORMAT /dev/sdc"]);

    let err = guard::provision(&config, &inventory, &mut decisions, &mounter)
        .expect_err("must refuse without exact phrase");
    assert!(matches!(err, VaultError::ConfirmationRequired(_)));
    assert_eq!(mounter.count("format"), 0, "format must never run");
}

#[test]
fn use_existing_mounts_without_formatting() {
    let root = tempfile::tempdir().expect("tempdir");
    let config = test_config(root.path());
    let inventory = FakeInventory(vec![usb_device(Some("ext4"), None)]);
    let mounter = FakeMounter::default();
    let mut decisions = ScriptedDecisions::default().choices(&[Decision::UseExisting]);

    let outcome =
        guard::provision(&config, &inventory, &mut decisions, &mounter).expect("provision");
    assert!(matches!(outcome, ProvisionOutcome::Provisioned(_)));
    assert_eq!(mounter.count("format"), 0);
    assert_eq!(mounter.count("mount "), 1);
}

#[test]
fn use_existing_mounts_with_the_detected_filesystem() {
    let root = tempfile::tempdir().expect("tempdir");
    let config = test_config(root.path()); // config filesystem stays ext4
    let inventory = FakeInventory(vec![usb_device(Some("vfat"), None)]);
    let mounter = FakeMounter::default();
    let mut decisions = ScriptedDecisions::default().choices(&[Decision::UseExisting]);

    let outcome =
        guard::provision(&config, &inventory, &mut decisions, &mounter).expect("provision");
    assert!(matches!(outcome, ProvisionOutcome::Provisioned(_)));

    let expected_mount = format!("mount /dev/sdb {} vfat", config.mount_point.display());
    assert!(
        mounter.calls().contains(&expected_mount),
        "must mount the filesystem the device actually carries, got {:?}",
        mounter.calls()
    );

    // The record carries the detected type so remounts keep working
    let table = MountTable::new(config.mount_table.clone());
    let record = table
        .find(&config.mount_point)
        .expect("find")
        .expect("present");
    assert_eq!(record.fstype, FilesystemKind::Vfat);
}

#[test]
fn use_existing_unknown_signature_falls_back_to_configured_filesystem() {
    let root = tempfile::tempdir().expect("tempdir");
    let config = test_config(root.path());
    let inventory = FakeInventory(vec![usb_device(Some("ntfs"), None)]);
    let mounter = FakeMounter::default();
    let mut decisions = ScriptedDecisions::default().choices(&[Decision::UseExisting]);

    guard::provision(&config, &inventory, &mut decisions, &mounter).expect("provision");

    let table = MountTable::new(config.mount_table.clone());
    let record = table
        .find(&config.mount_point)
        .expect("find")
        .expect("present");
    assert_eq!(record.fstype, config.filesystem);
}

#[test]
fn skip_from_mounted_elsewhere_releases_and_ends_clean() {
    let root = tempfile::tempdir().expect("tempdir");
    let config = test_config(root.path());
    let inventory = FakeInventory(vec![usb_device(Some("ext4"), Some("/media/old"))]);
    let mounter = FakeMounter::default();
    let mut decisions = ScriptedDecisions::default().choices(&[Decision::Skip]);

    let outcome =
        guard::provision(&config, &inventory, &mut decisions, &mounter).expect("provision");
    assert_eq!(outcome, ProvisionOutcome::Skipped);
    assert_eq!(mounter.calls(), vec!["unmount /media/old"]);

    let table = MountTable::new(config.mount_table.clone());
    assert!(table.load().expect("table").is_empty(), "skip records nothing");
}

#[test]
fn release_escalates_through_force_and_lazy() {
    let root = tempfile::tempdir().expect("tempdir");
    let config = test_config(root.path());
    let inventory = FakeInventory(vec![usb_device(Some("ext4"), Some("/media/old"))]);
    let mounter = FakeMounter {
        failing_unmounts: RefCell::new(2),
        ..FakeMounter::default()
    };
    let mut decisions = ScriptedDecisions::default().choices(&[Decision::Skip]);

    let outcome =
        guard::provision(&config, &inventory, &mut decisions, &mounter).expect("provision");
    assert_eq!(outcome, ProvisionOutcome::Skipped);
    assert_eq!(
        mounter.calls(),
        vec![
            "unmount /media/old",
            "force_release /media/old",
            "unmount /media/old",
            "lazy_unmount /media/old",
        ]
    );
}

#[test]
fn exhausted_release_escalation_is_unmountable() {
    let root = tempfile::tempdir().expect("tempdir");
    let config = test_config(root.path());
    let inventory = FakeInventory(vec![usb_device(Some("ext4"), Some("/media/old"))]);
    let mounter = FakeMounter {
        failing_unmounts: RefCell::new(2),
        lazy_fails: true,
        ..FakeMounter::default()
    };
    let mut decisions = ScriptedDecisions::default().choices(&[Decision::Skip]);

    let err = guard::provision(&config, &inventory, &mut decisions, &mounter)
        .expect_err("release must not silently give up");
    assert!(matches!(err, VaultError::Unmountable(_)));
}

#[test]
fn mount_failure_after_format_offers_recovery() {
    let root = tempfile::tempdir().expect("tempdir");
    let config = test_config(root.path());
    let inventory = FakeInventory(vec![usb_device(None, None)]);
    let mounter = FakeMounter {
        failing_mounts: RefCell::new(1),
        ..FakeMounter::default()
    };
    let mut decisions =
        ScriptedDecisions::default().recoveries(&[RecoveryDecision::FormatAgain]);

    let outcome =
        guard::provision(&config, &inventory, &mut decisions, &mounter).expect("provision");
    assert!(matches!(outcome, ProvisionOutcome::Provisioned(_)));
    assert_eq!(mounter.count("format"), 2);
    assert_eq!(mounter.count("mount "), 2);
}

#[test]
fn format_failure_offers_recovery_too() {
    let root = tempfile::tempdir().expect("tempdir");
    let config = test_config(root.path());
    let inventory = FakeInventory(vec![usb_device(None, None)]);
    let mounter = FakeMounter {
        failing_formats: RefCell::new(1),
        ..FakeMounter::default()
    };
    let mut decisions =
        ScriptedDecisions::default().recoveries(&[RecoveryDecision::FormatAgain]);

    let outcome =
        guard::provision(&config, &inventory, &mut decisions, &mounter).expect("provision");
    assert!(matches!(outcome, ProvisionOutcome::Provisioned(_)));
    assert_eq!(mounter.count("format"), 2);
}

#[test]
fn abort_after_format_failure_surfaces_format_error() {
    let root = tempfile::tempdir().expect("tempdir");
    let config = test_config(root.path());
    let inventory = FakeInventory(vec![usb_device(None, None)]);
    let mounter = FakeMounter {
        failing_formats: RefCell::new(1),
        ..FakeMounter::default()
    };
    let mut decisions = ScriptedDecisions::default().recoveries(&[RecoveryDecision::Abort]);

    let err = guard::provision(&config, &inventory, &mut decisions, &mounter)
        .expect_err("abort after format failure");
    assert!(matches!(err, VaultError::FormatFailed { .. }));
}

#[test]
fn second_mount_failure_after_format_is_fatal() {
    let root = tempfile::tempdir().expect("tempdir");
    let config = test_config(root.path());
    let inventory = FakeInventory(vec![usb_device(None, None)]);
    let mounter = FakeMounter {
        failing_mounts: RefCell::new(2),
        ..FakeMounter::default()
    };
    let mut decisions =
        ScriptedDecisions::default().recoveries(&[RecoveryDecision::FormatAgain]);

    let err = guard::provision(&config, &inventory, &mut decisions, &mounter)
        .expect_err("second failure is fatal");
    assert!(matches!(err, VaultError::MountFailed { .. }));
}

#[test]
fn abort_after_mount_failure_surfaces_the_error() {
    let root = tempfile::tempdir().expect("tempdir");
    let config = test_config(root.path());
    let inventory = FakeInventory(vec![usb_device(None, None)]);
    let mounter = FakeMounter {
        failing_mounts: RefCell::new(1),
        ..FakeMounter::default()
    };
    let mut decisions = ScriptedDecisions::default().recoveries(&[RecoveryDecision::Abort]);

    let err = guard::provision(&config, &inventory, &mut decisions, &mounter)
        .expect_err("abort ends in failure");
    assert!(matches!(err, VaultError::MountFailed { .. }));
}

#[test]
fn no_matching_device_is_device_not_found() {
    let root = tempfile::tempdir().expect("tempdir");
    let config = test_config(root.path());
    let inventory = FakeInventory(vec![]);
    let mounter = FakeMounter::default();
    let mut decisions = ScriptedDecisions::default();

    let err = guard::provision(&config, &inventory, &mut decisions, &mounter)
        .expect_err("no candidate device");
    assert!(matches!(err, VaultError::DeviceNotFound(_)));
}

// =============================================================================
// End-to-end: use-existing with data on the device
// =============================================================================

#[test]
fn use_existing_preserves_data_and_completes_namespace() {
    let root = tempfile::tempdir().expect("tempdir");
    let config = test_config(root.path());

    // The "device" already holds user files at the (fake-mounted) target
    let pre_existing = config.mount_point.join("holiday.jpg");
    std::fs::write(&pre_existing, b"jpeg bytes").expect("write pre-existing file");

    let inventory = FakeInventory(vec![usb_device(Some("ext4"), None)]);
    let mounter = FakeMounter::default();
    let mut decisions = ScriptedDecisions::default().choices(&[Decision::UseExisting]);

    let outcome =
        guard::provision(&config, &inventory, &mut decisions, &mounter).expect("provision");
    let ProvisionOutcome::Provisioned(mount_path) = outcome else {
        panic!("expected provisioned outcome");
    };
    assert_eq!(mounter.count("format"), 0, "zero data loss requires zero formats");

    provision_tree(&mount_path, &config.namespace).expect("layout");
    assert!(config.namespace.is_complete(&mount_path));
    assert_eq!(
        std::fs::read(&pre_existing).expect("original file intact"),
        b"jpeg bytes"
    );
}

// =============================================================================
// Classification sanity shared with the devices listing
// =============================================================================

#[test]
fn classification_tracks_mount_target() {
    let target = Path::new("/mnt/vault");
    assert_eq!(classify(&usb_device(None, None), target), GuardState::UnmountedNoFs);
    assert_eq!(
        classify(&usb_device(Some("ext4"), Some("/mnt/vault")), target),
        GuardState::MountedAtTarget
    );
}

#[test]
fn scope_parsing_accepts_full_and_dataset_names() {
    use std::str::FromStr;
    assert_eq!(BackupScope::from_str("full").expect("infallible"), BackupScope::Full);
    assert!(matches!(
        BackupScope::from_str("photos").expect("infallible"),
        BackupScope::Dataset(_)
    ));
}
