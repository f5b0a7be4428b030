//! Configuration for a DataVault deployment.
//!
//! One immutable [`VaultConfig`] is resolved at startup (defaults,
//! optionally overlaid by a JSON file) and passed into every component —
//! no global or environment-derived configuration anywhere else.

use crate::backup::{Dataset, DatasetKind};
use crate::error::{Result, VaultError};
use crate::layout::{NamespaceSchema, OwnershipPolicy};
use crate::retention::RetentionPolicy;
use crate::types::{BackupScope, DeviceClass, FilesystemKind};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Immutable configuration value for one invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultConfig {
    /// Device class the resolver filters for
    pub device_class: DeviceClass,
    /// Where the provisioned device is mounted
    pub mount_point: PathBuf,
    /// Filesystem used when formatting
    pub filesystem: FilesystemKind,
    /// Mount options recorded and used on every mount
    pub mount_options: String,
    /// Path of the persisted mount table
    pub mount_table: PathBuf,
    /// Ownership/permission policy for the provisioned tree
    pub ownership: OwnershipPolicy,
    /// Service name → required subpaths
    pub namespace: NamespaceSchema,
    /// High-value datasets the backup capturer knows about
    pub datasets: Vec<Dataset>,
    /// Backup scope → maximum age in days
    pub retention: RetentionPolicy,
    /// Skip destructive steps, log what would happen (CLI flag, never persisted)
    #[serde(skip)]
    pub dry_run: bool,
}

impl Default for VaultConfig {
    fn default() -> Self {
        let mut namespace = BTreeMap::new();
        namespace.insert(
            "photo-service".to_string(),
            vec![
                "upload".to_string(),
                "database".to_string(),
                "cache".to_string(),
            ],
        );

        let datasets = vec![
            Dataset {
                name: "photos".to_string(),
                kind: DatasetKind::Subtree {
                    source: PathBuf::from("photo-service/upload"),
                },
                services: vec!["photo-app".to_string()],
            },
            Dataset {
                name: "appdb".to_string(),
                kind: DatasetKind::Database {
                    dump_program: "pg_dump".to_string(),
                    dump_args: vec!["appdb".to_string()],
                },
                services: vec!["photo-db".to_string(), "photo-cache".to_string()],
            },
        ];

        let mut retention = BTreeMap::new();
        retention.insert("full".to_string(), 30);
        retention.insert("photos".to_string(), 7);
        retention.insert("appdb".to_string(), 7);

        Self {
            device_class: DeviceClass::default(),
            mount_point: PathBuf::from("/mnt/vault"),
            filesystem: FilesystemKind::Ext4,
            mount_options: "defaults,noatime".to_string(),
            mount_table: PathBuf::from("/var/lib/datavault/mounts.json"),
            ownership: OwnershipPolicy::default(),
            namespace: NamespaceSchema(namespace),
            datasets,
            retention: RetentionPolicy(retention),
            dry_run: false,
        }
    }
}

impl VaultConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from a JSON file.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let data = fs::read_to_string(&path).map_err(|e| {
            VaultError::config(format!(
                "failed to read config {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;
        let config: Self = serde_json::from_str(&data)
            .map_err(|e| VaultError::config(format!("invalid config JSON: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a JSON file.
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(&path, json).map_err(|e| {
            VaultError::config(format!(
                "failed to write config {}: {}",
                path.as_ref().display(),
                e
            ))
        })
    }

    /// Check invariants a component would otherwise trip over at runtime.
    pub fn validate(&self) -> Result<()> {
        if !self.mount_point.is_absolute() {
            return Err(VaultError::config(format!(
                "mount_point must be absolute, got {}",
                self.mount_point.display()
            )));
        }
        if self.namespace.is_empty() {
            return Err(VaultError::config("namespace schema must not be empty"));
        }

        let mut seen = std::collections::BTreeSet::new();
        for dataset in &self.datasets {
            if dataset.name.is_empty() || dataset.name.contains('/') {
                return Err(VaultError::config(format!(
                    "dataset name '{}' must be non-empty and contain no '/'",
                    dataset.name
                )));
            }
            if !seen.insert(&dataset.name) {
                return Err(VaultError::config(format!(
                    "duplicate dataset name '{}'",
                    dataset.name
                )));
            }
            if let DatasetKind::Subtree { source } = &dataset.kind {
                if source.is_absolute() {
                    return Err(VaultError::config(format!(
                        "dataset '{}' source must be relative to the mount root",
                        dataset.name
                    )));
                }
            }
        }

        for (scope, days) in &self.retention.0 {
            if *days == 0 {
                return Err(VaultError::config(format!(
                    "retention window for scope '{}' must be at least 1 day",
                    scope
                )));
            }
        }
        Ok(())
    }

    /// Root directory holding all backup scopes.
    pub fn backups_dir(&self) -> PathBuf {
        self.mount_point.join("backups")
    }

    /// Datasets captured by the given scope.
    pub fn datasets_for_scope(&self, scope: &BackupScope) -> Result<Vec<Dataset>> {
        match scope {
            BackupScope::Full => Ok(self.datasets.clone()),
            BackupScope::Dataset(name) => self
                .datasets
                .iter()
                .find(|d| &d.name == name)
                .cloned()
                .map(|d| vec![d])
                .ok_or_else(|| {
                    VaultError::config(format!("unknown dataset '{}' in backup scope", name))
                }),
        }
    }
}
