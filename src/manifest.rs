//! Backup-set manifests and the verification pass.
//!
//! After capture, the manifest records each expected artifact's presence
//! and byte size plus the overall set size and capture time. It is the
//! last file written into a set, so a set carrying a manifest is never
//! half-written. Verification is a separate pass that re-stats every
//! expected artifact; a missing or zero-byte artifact becomes a finding
//! in the run summary, never an abort — a partial backup still carries
//! value and must be reported rather than discarded.

use crate::error::{Result, VaultError};
use crate::types::{Finding, RunSummary};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::{debug, info};

/// File name of the manifest inside every backup set.
pub const MANIFEST_NAME: &str = "manifest.json";

/// Recorded status of one artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactEntry {
    pub name: String,
    pub bytes: u64,
    pub present: bool,
}

/// Summary of one backup set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub artifacts: Vec<ArtifactEntry>,
    pub total_bytes: u64,
    pub captured_at: DateTime<Utc>,
}

impl Manifest {
    /// Build a manifest by stat-ing each expected artifact under `dir`.
    pub fn enumerate(dir: &Path, expected: &[String], captured_at: DateTime<Utc>) -> Manifest {
        let mut artifacts = Vec::with_capacity(expected.len());
        let mut total_bytes = 0;
        for name in expected {
            let path = dir.join(name);
            let entry = match fs::metadata(&path) {
                Ok(meta) if meta.is_file() => {
                    total_bytes += meta.len();
                    ArtifactEntry {
                        name: name.clone(),
                        bytes: meta.len(),
                        present: true,
                    }
                }
                _ => ArtifactEntry {
                    name: name.clone(),
                    bytes: 0,
                    present: false,
                },
            };
            debug!(
                "manifest entry {}: present={} bytes={}",
                entry.name, entry.present, entry.bytes
            );
            artifacts.push(entry);
        }
        Manifest {
            artifacts,
            total_bytes,
            captured_at,
        }
    }

    /// Load a manifest from a backup-set directory.
    pub fn load(dir: &Path) -> Result<Manifest> {
        let path = dir.join(MANIFEST_NAME);
        let data = fs::read_to_string(&path).map_err(|e| {
            VaultError::config(format!(
                "no readable manifest at {} ({}); the set may be partial or still capturing",
                path.display(),
                e
            ))
        })?;
        Ok(serde_json::from_str(&data)?)
    }

    /// Write the manifest into `dir`. Callers must do this last.
    pub fn write(&self, dir: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(dir.join(MANIFEST_NAME), json)?;
        Ok(())
    }
}

/// Enumerate, write, and return the manifest for a freshly captured set.
///
/// Artifacts recorded absent are additionally noted in the summary so
/// the invocation reports them without aborting.
pub fn write_manifest(
    dir: &Path,
    set_id: &str,
    expected: &[String],
    captured_at: DateTime<Utc>,
    summary: &mut RunSummary,
) -> Result<Manifest> {
    let manifest = Manifest::enumerate(dir, expected, captured_at);
    for entry in &manifest.artifacts {
        if !entry.present {
            summary.note(Finding::ArtifactMissing {
                set_id: set_id.to_string(),
                artifact: entry.name.clone(),
            });
        }
    }
    manifest.write(dir)?;
    info!(
        "wrote manifest for set {}: {} artifact(s), {} bytes total",
        set_id,
        manifest.artifacts.len(),
        manifest.total_bytes
    );
    Ok(manifest)
}

/// Re-check every expected artifact of an existing backup set.
///
/// The expected list is the manifest's own artifact list, so verification
/// survives copies of the set directory. Failures are findings, not
/// errors; the pass always completes.
pub fn verify_set(dir: &Path, set_id: &str, summary: &mut RunSummary) -> Result<Manifest> {
    let manifest = Manifest::load(dir)?;
    for entry in &manifest.artifacts {
        let path = dir.join(&entry.name);
        match fs::metadata(&path) {
            Ok(meta) if meta.is_file() && meta.len() > 0 => {
                debug!("verified artifact {} ({} bytes)", entry.name, meta.len());
            }
            Ok(_) => {
                summary.note(Finding::ArtifactEmpty {
                    set_id: set_id.to_string(),
                    artifact: entry.name.clone(),
                });
            }
            Err(_) => {
                summary.note(Finding::ArtifactMissing {
                    set_id: set_id.to_string(),
                    artifact: entry.name.clone(),
                });
            }
        }
    }
    Ok(manifest)
}
