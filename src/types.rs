//! Shared vocabulary types for DataVault.
//!
//! Closed vocabularies (filesystems, device classes) are enums with strum
//! derives so CLI parsing, config files, and log output all agree on the
//! same strings. Free-form values (dataset names) stay `String`.

use serde::{Deserialize, Serialize};
use std::fmt;
use strum::{Display, EnumString};

/// Filesystem used when formatting the provisioned device.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, Default,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum FilesystemKind {
    #[default]
    Ext4,
    Xfs,
    Btrfs,
    Vfat,
}

impl FilesystemKind {
    /// Name of the mkfs helper for this filesystem.
    pub fn mkfs_command(self) -> &'static str {
        match self {
            Self::Ext4 => "mkfs.ext4",
            Self::Xfs => "mkfs.xfs",
            Self::Btrfs => "mkfs.btrfs",
            Self::Vfat => "mkfs.vfat",
        }
    }
}

/// Device class filter for the resolver.
///
/// Matching is transport + removable flag; "high-speed removable" in
/// practice means a USB 3 SSD, so that is the default.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, Default,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case", ascii_case_insensitive)]
pub enum DeviceClass {
    /// Removable device on the USB transport
    #[default]
    UsbRemovable,
    /// Removable device on the SATA transport (hot-swap bays)
    SataRemovable,
    /// Any device flagged removable, regardless of transport
    AnyRemovable,
}

/// Scope of a single backup invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupScope {
    /// Capture every configured dataset
    Full,
    /// Capture one named dataset
    Dataset(String),
}

impl BackupScope {
    /// Directory name under `<mountRoot>/backups/` for this scope.
    pub fn dir_name(&self) -> &str {
        match self {
            Self::Full => "full",
            Self::Dataset(name) => name,
        }
    }
}

impl fmt::Display for BackupScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.dir_name())
    }
}

impl std::str::FromStr for BackupScope {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("full") {
            Ok(Self::Full)
        } else {
            Ok(Self::Dataset(s.to_string()))
        }
    }
}

/// A non-fatal finding collected during a run.
///
/// Findings never abort an invocation; they are aggregated into the
/// [`RunSummary`] so an operator can act without re-running everything.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Finding {
    /// An expected artifact was not found in the backup set
    ArtifactMissing { set_id: String, artifact: String },
    /// An expected artifact exists but is zero bytes
    ArtifactEmpty { set_id: String, artifact: String },
    /// A dependent service was already stopped when the pause began.
    ///
    /// The service surface does not distinguish "was never running" from
    /// "failed to stop"; both land here as a note, not an error.
    ServiceAlreadyStopped { service: String },
    /// A dependent service could not be restarted after capture
    ServiceResumeFailed { service: String, reason: String },
}

impl Finding {
    /// Findings that mark a degraded (but still reported) backup.
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            Self::ArtifactMissing { .. }
                | Self::ArtifactEmpty { .. }
                | Self::ServiceResumeFailed { .. }
        )
    }
}

impl fmt::Display for Finding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ArtifactMissing { set_id, artifact } => {
                write!(f, "artifact missing: {} in set {}", artifact, set_id)
            }
            Self::ArtifactEmpty { set_id, artifact } => {
                write!(f, "artifact empty (0 bytes): {} in set {}", artifact, set_id)
            }
            Self::ServiceAlreadyStopped { service } => {
                write!(f, "service '{}' was already stopped before capture", service)
            }
            Self::ServiceResumeFailed { service, reason } => {
                write!(f, "service '{}' failed to resume: {}", service, reason)
            }
        }
    }
}

/// Aggregated non-fatal findings for one invocation.
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    findings: Vec<Finding>,
}

impl RunSummary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a finding.
    pub fn note(&mut self, finding: Finding) {
        tracing::warn!("{}", finding);
        self.findings.push(finding);
    }

    /// Absorb all findings from another summary.
    pub fn merge(&mut self, other: RunSummary) {
        self.findings.extend(other.findings);
    }

    pub fn findings(&self) -> &[Finding] {
        &self.findings
    }

    /// True when no finding marks a degraded result.
    pub fn is_clean(&self) -> bool {
        !self.findings.iter().any(Finding::is_failure)
    }

    /// Multi-line operator-facing report.
    pub fn render(&self) -> String {
        if self.findings.is_empty() {
            return "run summary: clean".to_string();
        }
        let mut lines = vec![format!("run summary: {} finding(s)", self.findings.len())];
        for finding in &self.findings {
            lines.push(format!("  - {}", finding));
        }
        lines.join("\n")
    }
}
