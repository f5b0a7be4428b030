//! Block-device inventory and device resolution.
//!
//! The resolver consumes a [`DeviceInventory`] returning typed records
//! rather than scraping textual tool output: the production
//! implementation asks `lsblk --json` and deserializes the report with
//! serde, and tests substitute a fake inventory. Resolution is
//! side-effect free and safe to call repeatedly.

use crate::error::{Result, VaultError};
use crate::sysexec::run_command;
use crate::types::DeviceClass;
use serde::Deserialize;
use std::path::PathBuf;
use tracing::{debug, info};

/// One enumerated block device, flattened to whole-disk granularity.
///
/// A filesystem signature or an active mount on any partition counts
/// against the disk itself: the guard must never format a disk whose
/// children carry data it did not ask about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockDevice {
    /// Kernel name (e.g. `sda`)
    pub name: String,
    /// Device node path (e.g. `/dev/sda`)
    pub path: PathBuf,
    /// Filesystem signature on the disk or any of its partitions
    pub fs_signature: Option<String>,
    /// Where the disk (or one of its partitions) is currently mounted
    pub mountpoint: Option<PathBuf>,
    /// Transport (usb, sata, nvme, ...)
    pub transport: Option<String>,
    /// Removable-media flag from the kernel
    pub removable: bool,
    /// Capacity in bytes
    pub size_bytes: u64,
}

impl BlockDevice {
    /// True if this device matches the given class filter.
    pub fn matches(&self, class: DeviceClass) -> bool {
        let transport_ok = match class {
            DeviceClass::UsbRemovable => self.transport.as_deref() == Some("usb"),
            DeviceClass::SataRemovable => self.transport.as_deref() == Some("sata"),
            DeviceClass::AnyRemovable => true,
        };
        self.removable && transport_ok
    }
}

/// Source of block-device records.
///
/// One implementation per host platform; tests use scripted fakes.
pub trait DeviceInventory {
    /// Enumerate all whole-disk block devices, in stable kernel order.
    fn enumerate(&self) -> Result<Vec<BlockDevice>>;
}

/// Select exactly one candidate device for the class.
///
/// Zero matches is `DeviceNotFound`. Multiple matches select the first
/// in enumeration order — deterministic, and logged so the operator can
/// see what was passed over.
pub fn resolve_device(
    inventory: &dyn DeviceInventory,
    class: DeviceClass,
) -> Result<BlockDevice> {
    let devices = inventory.enumerate()?;
    let mut matching = devices.into_iter().filter(|d| d.matches(class));

    let chosen = matching
        .next()
        .ok_or_else(|| VaultError::DeviceNotFound(class.to_string()))?;

    let passed_over: Vec<String> = matching.map(|d| d.name).collect();
    if !passed_over.is_empty() {
        info!(
            "multiple devices match class '{}': chose {} (first in enumeration order), passed over {:?}",
            class, chosen.name, passed_over
        );
    }
    debug!("resolved device {} for class '{}'", chosen.path.display(), class);
    Ok(chosen)
}

// ============================================================================
// lsblk-backed inventory
// ============================================================================

/// Inventory backed by `lsblk --json` on the host.
#[derive(Debug, Default)]
pub struct LsblkInventory;

/// Top-level shape of `lsblk --json` output.
#[derive(Debug, Deserialize)]
struct LsblkReport {
    blockdevices: Vec<LsblkNode>,
}

/// One node in the lsblk tree (disk or partition).
#[derive(Debug, Deserialize)]
struct LsblkNode {
    name: String,
    path: Option<String>,
    #[serde(rename = "type")]
    node_type: String,
    fstype: Option<String>,
    mountpoint: Option<String>,
    tran: Option<String>,
    #[serde(default, deserialize_with = "flag")]
    rm: bool,
    #[serde(default)]
    size: Option<u64>,
    #[serde(default)]
    children: Vec<LsblkNode>,
}

/// lsblk emits booleans on current util-linux and "0"/"1" strings on
/// older releases; accept both.
fn flag<'de, D>(deserializer: D) -> std::result::Result<bool, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Flag {
        Bool(bool),
        Text(String),
    }
    Ok(match Flag::deserialize(deserializer)? {
        Flag::Bool(b) => b,
        Flag::Text(s) => s == "1" || s.eq_ignore_ascii_case("true"),
    })
}

impl LsblkNode {
    fn into_block_device(self) -> BlockDevice {
        // Signature/mount from the disk node itself or any partition.
        let mut fs_signature = self.fstype;
        let mut mountpoint = self.mountpoint;
        for child in &self.children {
            if fs_signature.is_none() {
                fs_signature = child.fstype.clone();
            }
            if mountpoint.is_none() {
                mountpoint = child.mountpoint.clone();
            }
        }
        let path = self
            .path
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(format!("/dev/{}", self.name)));
        BlockDevice {
            name: self.name,
            path,
            fs_signature,
            mountpoint: mountpoint.map(PathBuf::from),
            transport: self.tran,
            removable: self.rm,
            size_bytes: self.size.unwrap_or(0),
        }
    }
}

impl LsblkInventory {
    fn parse_report(json: &str) -> Result<Vec<BlockDevice>> {
        let report: LsblkReport = serde_json::from_str(json)?;
        Ok(report
            .blockdevices
            .into_iter()
            .filter(|node| node.node_type == "disk")
            .map(LsblkNode::into_block_device)
            .collect())
    }
}

impl DeviceInventory for LsblkInventory {
    fn enumerate(&self) -> Result<Vec<BlockDevice>> {
        let output = run_command(
            "lsblk",
            &[
                "--json",
                "--bytes",
                "--output",
                "NAME,PATH,TYPE,FSTYPE,MOUNTPOINT,TRAN,RM,SIZE",
            ],
        )?;
        output.ensure_success("lsblk")?;
        Self::parse_report(&output.stdout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(name: &str, tran: Option<&str>, removable: bool) -> BlockDevice {
        BlockDevice {
            name: name.to_string(),
            path: PathBuf::from(format!("/dev/{}", name)),
            fs_signature: None,
            mountpoint: None,
            transport: tran.map(str::to_string),
            removable,
            size_bytes: 500_107_862_016,
        }
    }

    struct FakeInventory(Vec<BlockDevice>);

    impl DeviceInventory for FakeInventory {
        fn enumerate(&self) -> Result<Vec<BlockDevice>> {
            Ok(self.0.clone())
        }
    }

    #[test]
    fn test_resolve_no_match_is_device_not_found() {
        let inv = FakeInventory(vec![device("sda", Some("sata"), false)]);
        let err = resolve_device(&inv, DeviceClass::UsbRemovable).expect_err("no usb device");
        assert!(matches!(err, VaultError::DeviceNotFound(_)));
    }

    #[test]
    fn test_resolve_picks_first_in_enumeration_order() {
        let inv = FakeInventory(vec![
            device("sda", Some("sata"), false),
            device("sdb", Some("usb"), true),
            device("sdc", Some("usb"), true),
        ]);
        let chosen = resolve_device(&inv, DeviceClass::UsbRemovable).expect("two candidates");
        assert_eq!(chosen.name, "sdb");
    }

    #[test]
    fn test_resolve_is_repeatable() {
        let inv = FakeInventory(vec![device("sdb", Some("usb"), true)]);
        let first = resolve_device(&inv, DeviceClass::UsbRemovable).expect("candidate");
        let second = resolve_device(&inv, DeviceClass::UsbRemovable).expect("candidate");
        assert_eq!(first, second);
    }

    #[test]
    fn test_class_matching() {
        assert!(device("sdb", Some("usb"), true).matches(DeviceClass::UsbRemovable));
        assert!(!device("sdb", Some("usb"), false).matches(DeviceClass::UsbRemovable));
        assert!(!device("sda", Some("sata"), true).matches(DeviceClass::UsbRemovable));
        assert!(device("sda", Some("sata"), true).matches(DeviceClass::AnyRemovable));
    }

    #[test]
    fn test_parse_lsblk_report_filters_partitions() {
        let json = r#"{
            "blockdevices": [
                {
                    "name": "sda", "path": "/dev/sda", "type": "disk",
                    "fstype": null, "mountpoint": null, "tran": "usb",
                    "rm": true, "size": 500107862016,
                    "children": [
                        {"name": "sda1", "path": "/dev/sda1", "type": "part",
                         "fstype": "ext4", "mountpoint": "/media/old", "rm": true}
                    ]
                },
                {
                    "name": "nvme0n1", "path": "/dev/nvme0n1", "type": "disk",
                    "fstype": null, "mountpoint": null, "tran": "nvme",
                    "rm": false, "size": 1000204886016
                }
            ]
        }"#;
        let devices = LsblkInventory::parse_report(json).expect("valid report");
        assert_eq!(devices.len(), 2);

        // Partition signature and mount propagate to the disk record
        assert_eq!(devices[0].fs_signature.as_deref(), Some("ext4"));
        assert_eq!(devices[0].mountpoint, Some(PathBuf::from("/media/old")));
        assert!(devices[0].removable);

        assert_eq!(devices[1].name, "nvme0n1");
        assert!(!devices[1].removable);
    }

    #[test]
    fn test_parse_lsblk_report_legacy_string_flags() {
        let json = r#"{
            "blockdevices": [
                {"name": "sdb", "type": "disk", "fstype": null,
                 "mountpoint": null, "tran": "usb", "rm": "1", "size": 1024}
            ]
        }"#;
        let devices = LsblkInventory::parse_report(json).expect("valid report");
        assert!(devices[0].removable);
        assert_eq!(devices[0].path, PathBuf::from("/dev/sdb"));
    }
}
