//! Directory layout provisioning on the mounted device.
//!
//! The namespace schema maps logical service names to the relative
//! subpaths each service needs. Provisioning is create-if-absent and
//! never deletes anything; it is complete exactly when every declared
//! path exists under the mount root. Ownership and permissions are then
//! applied to the whole tree in one sweep so no subpath keeps stale
//! permissions from an earlier partial run.

use crate::error::{Result, VaultError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Static mapping from logical service name to required subpaths.
///
/// BTreeMap keeps iteration (and thus creation and logging) in a stable
/// order across runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct NamespaceSchema(pub BTreeMap<String, Vec<String>>);

impl NamespaceSchema {
    /// All declared paths, relative to the mount root.
    pub fn declared_paths(&self) -> Vec<PathBuf> {
        self.0
            .iter()
            .flat_map(|(service, subpaths)| {
                subpaths
                    .iter()
                    .map(move |sub| Path::new(service).join(sub))
            })
            .collect()
    }

    /// True when every declared path exists under `root`.
    pub fn is_complete(&self, root: &Path) -> bool {
        self.declared_paths().iter().all(|p| root.join(p).is_dir())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Uniform ownership and permission policy for the provisioned tree.
///
/// `uid`/`gid` of `None` leave ownership untouched, which also lets the
/// test suite run unprivileged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnershipPolicy {
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    /// Mode applied to every directory in the tree (octal)
    pub dir_mode: u32,
}

impl Default for OwnershipPolicy {
    fn default() -> Self {
        Self {
            uid: None,
            gid: None,
            dir_mode: 0o2775,
        }
    }
}

/// Create every declared subpath that does not already exist.
///
/// Returns the number of directories created. Existing directories and
/// their contents are left untouched.
pub fn provision_tree(root: &Path, schema: &NamespaceSchema) -> Result<usize> {
    if !root.is_dir() {
        return Err(VaultError::config(format!(
            "mount root {} does not exist or is not a directory",
            root.display()
        )));
    }

    let mut created = 0;
    for rel in schema.declared_paths() {
        let full = root.join(&rel);
        if full.is_dir() {
            debug!("namespace path exists: {}", full.display());
            continue;
        }
        fs::create_dir_all(&full)?;
        info!("created namespace path {}", full.display());
        created += 1;
    }
    Ok(created)
}

/// Apply one uniform ownership and mode policy to the entire tree.
///
/// Walks every directory under `root` including the root itself. A
/// tree-wide sweep (rather than only the paths just created) repairs
/// anything a prior partial run left behind.
pub fn apply_ownership(root: &Path, policy: &OwnershipPolicy) -> Result<usize> {
    let mut touched = 0;
    apply_recursive(root, policy, &mut touched)?;
    info!(
        "applied ownership policy to {} director{} under {}",
        touched,
        if touched == 1 { "y" } else { "ies" },
        root.display()
    );
    Ok(touched)
}

fn apply_recursive(dir: &Path, policy: &OwnershipPolicy, touched: &mut usize) -> Result<()> {
    apply_to_path(dir, policy)?;
    *touched += 1;

    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            apply_recursive(&path, policy, touched)?;
        } else if policy.uid.is_some() || policy.gid.is_some() {
            chown_path(&path, policy)?;
        }
    }
    Ok(())
}

fn apply_to_path(path: &Path, policy: &OwnershipPolicy) -> Result<()> {
    fs::set_permissions(path, fs::Permissions::from_mode(policy.dir_mode))?;
    if policy.uid.is_some() || policy.gid.is_some() {
        chown_path(path, policy)?;
    }
    Ok(())
}

fn chown_path(path: &Path, policy: &OwnershipPolicy) -> Result<()> {
    nix::unistd::chown(
        path,
        policy.uid.map(nix::unistd::Uid::from_raw),
        policy.gid.map(nix::unistd::Gid::from_raw),
    )
    .map_err(|e| VaultError::system(format!("chown {} failed: {}", path.display(), e)))
}
