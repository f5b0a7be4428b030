//! Backup capture: pause dependent services, copy data, resume services.
//!
//! The capturer stops exactly the services whose data could be corrupted
//! by a concurrent read — the union of the dependent-service lists of the
//! datasets in scope — and guarantees they are resumed on every exit
//! path. Resume is called explicitly on both the success and failure
//! paths, with a `Drop` backstop that restarts and logs if a panic
//! unwinds past the capture loop.
//!
//! A set's identifying timestamp token is generated once, before the
//! first byte is written. All artifacts land in a `.tmp-<token>`
//! directory that is renamed to its final name only after the manifest
//! is written, so a set is never partially visible under its final name.

use crate::config::VaultConfig;
use crate::error::{Result, VaultError};
use crate::manifest::{self, Manifest};
use crate::retention::TOKEN_FORMAT;
use crate::sysexec::{run_command, run_command_to_file};
use crate::types::{BackupScope, Finding, RunSummary};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Copy strategy for one dataset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum DatasetKind {
    /// Filesystem subtree, captured as a compressed archive
    Subtree {
        /// Source path relative to the mount root
        source: PathBuf,
    },
    /// Relational store, captured as a structured dump on stdout
    Database {
        dump_program: String,
        #[serde(default)]
        dump_args: Vec<String>,
    },
}

/// One high-value dataset and the services that must pause around its capture.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dataset {
    pub name: String,
    #[serde(flatten)]
    pub kind: DatasetKind,
    /// Services whose data this capture reads
    #[serde(default)]
    pub services: Vec<String>,
}

impl Dataset {
    /// File name of this dataset's artifact inside a backup set.
    pub fn artifact_name(&self) -> String {
        match self.kind {
            DatasetKind::Subtree { .. } => format!("{}.tar.gz", self.name),
            DatasetKind::Database { .. } => format!("{}.sql", self.name),
        }
    }
}

/// Service control surface, addressed by logical name.
///
/// Owned by the external service orchestrator; the production
/// implementation shells to systemctl, tests use scripted fakes.
pub trait ServiceController {
    fn stop(&self, service: &str) -> Result<()>;
    fn start(&self, service: &str) -> Result<()>;
    fn is_active(&self, service: &str) -> Result<bool>;
}

/// systemd-backed service controller.
#[derive(Debug, Default)]
pub struct SystemdController;

impl ServiceController for SystemdController {
    fn stop(&self, service: &str) -> Result<()> {
        run_command("systemctl", &["stop", service])?.ensure_success(&format!("systemctl stop {}", service))
    }

    fn start(&self, service: &str) -> Result<()> {
        run_command("systemctl", &["start", service])?.ensure_success(&format!("systemctl start {}", service))
    }

    fn is_active(&self, service: &str) -> Result<bool> {
        // Non-zero exit means inactive, not an error
        Ok(run_command("systemctl", &["is-active", "--quiet", service])?.success)
    }
}

/// Scoped pause of dependent services with guaranteed resume.
///
/// Only services observed active and successfully stopped are resumed;
/// an already-stopped service is a recorded no-op. The surface cannot
/// distinguish "was never running" from "failed to stop", so both land
/// in the summary as the same note.
pub struct ServicePauseGuard<'a> {
    controller: &'a dyn ServiceController,
    paused: Vec<String>,
    resumed: bool,
}

impl<'a> ServicePauseGuard<'a> {
    /// Stop each service, recording already-stopped ones as notes.
    ///
    /// The guard value exists before the first fallible call, so
    /// services stopped by earlier iterations are restarted by `Drop`
    /// even when a later status check errors out of the loop.
    pub fn pause(
        controller: &'a dyn ServiceController,
        services: &[String],
        summary: &mut RunSummary,
    ) -> Result<Self> {
        let mut guard = Self {
            controller,
            paused: Vec::new(),
            resumed: false,
        };
        for service in services {
            if !controller.is_active(service)? {
                summary.note(Finding::ServiceAlreadyStopped {
                    service: service.clone(),
                });
                continue;
            }
            match controller.stop(service) {
                Ok(()) => {
                    info!("paused service {}", service);
                    guard.paused.push(service.clone());
                }
                Err(e) => {
                    // Same ambiguity as above: treat as non-fatal no-op
                    warn!("stop {} failed, continuing: {}", service, e);
                    summary.note(Finding::ServiceAlreadyStopped {
                        service: service.clone(),
                    });
                }
            }
        }
        Ok(guard)
    }

    /// Restart every paused service, recording failures as findings.
    pub fn resume(&mut self, summary: &mut RunSummary) {
        if self.resumed {
            return;
        }
        self.resumed = true;
        for service in &self.paused {
            match self.controller.start(service) {
                Ok(()) => info!("resumed service {}", service),
                Err(e) => summary.note(Finding::ServiceResumeFailed {
                    service: service.clone(),
                    reason: e.to_string(),
                }),
            }
        }
    }
}

impl Drop for ServicePauseGuard<'_> {
    fn drop(&mut self) {
        if self.resumed {
            return;
        }
        // Backstop for panics; failures can only be logged here
        for service in &self.paused {
            if let Err(e) = self.controller.start(service) {
                warn!("resume of {} failed during unwind: {}", service, e);
            }
        }
        self.resumed = true;
    }
}

/// Artifact copy strategy, injectable for tests.
pub trait Capturer {
    /// Produce the dataset's artifact at `dest`.
    fn capture(&self, dataset: &Dataset, mount_root: &Path, dest: &Path) -> Result<()>;
}

/// Production capturer: tar for subtrees, a dump command for databases.
#[derive(Debug, Default)]
pub struct SysCapturer;

impl Capturer for SysCapturer {
    fn capture(&self, dataset: &Dataset, mount_root: &Path, dest: &Path) -> Result<()> {
        match &dataset.kind {
            DatasetKind::Subtree { source } => {
                let src = mount_root.join(source);
                if !src.is_dir() {
                    return Err(VaultError::config(format!(
                        "dataset '{}' source {} does not exist",
                        dataset.name,
                        src.display()
                    )));
                }
                let dest_str = dest.display().to_string();
                let src_str = src.display().to_string();
                run_command("tar", &["-czf", &dest_str, "-C", &src_str, "."])?
                    .ensure_success(&format!("tar archive of {}", src.display()))
            }
            DatasetKind::Database {
                dump_program,
                dump_args,
            } => {
                let args: Vec<&str> = dump_args.iter().map(String::as_str).collect();
                run_command_to_file(dump_program, &args, dest)?
                    .ensure_success(&format!("{} dump for dataset '{}'", dump_program, dataset.name))
            }
        }
    }
}

/// Result of one backup invocation.
#[derive(Debug)]
pub struct BackupReport {
    /// Timestamp token identifying the set
    pub set_id: String,
    /// Final set directory
    pub set_dir: PathBuf,
    pub manifest: Manifest,
    pub summary: RunSummary,
}

/// Generate the next set token for a scope directory.
///
/// The token is taken once before any write. A second call within the
/// same time resolution gets a zero-padded `-NN` suffix rather than
/// overwriting; the padding keeps the suffixes themselves in
/// lexicographic order, so ids stay strictly increasing.
pub fn next_set_token(scope_dir: &Path, now: DateTime<Utc>) -> String {
    let base = now.format(TOKEN_FORMAT).to_string();
    let mut candidate = base.clone();
    let mut n = 1;
    while scope_dir.join(&candidate).exists()
        || scope_dir.join(format!(".tmp-{}", candidate)).exists()
    {
        candidate = format!("{}-{:02}", base, n);
        n += 1;
    }
    candidate
}

/// Capture one backup set for the scope.
///
/// Per-artifact capture failures are degraded results, not aborts: the
/// artifact is simply absent, the manifest records it, and the summary
/// carries the finding. Services are resumed before any error leaves
/// this function.
pub fn run_backup(
    config: &VaultConfig,
    controller: &dyn ServiceController,
    capturer: &dyn Capturer,
    scope: &BackupScope,
) -> Result<BackupReport> {
    let datasets = config.datasets_for_scope(scope)?;
    let services = dependent_services(&datasets);
    let scope_dir = config.backups_dir().join(scope.dir_name());
    fs::create_dir_all(&scope_dir)?;

    let captured_at = Utc::now();
    let set_id = next_set_token(&scope_dir, captured_at);
    let tmp_dir = scope_dir.join(format!(".tmp-{}", set_id));
    let final_dir = scope_dir.join(&set_id);
    fs::create_dir(&tmp_dir)?;

    info!(
        "backup scope '{}': set {} with {} dataset(s), pausing {:?}",
        scope,
        set_id,
        datasets.len(),
        services
    );

    let mut summary = RunSummary::new();
    let mut guard = ServicePauseGuard::pause(controller, &services, &mut summary)?;

    for dataset in &datasets {
        let dest = tmp_dir.join(dataset.artifact_name());
        match capturer.capture(dataset, &config.mount_point, &dest) {
            Ok(()) => debug!("captured artifact {}", dest.display()),
            Err(e) => {
                // Missing artifact is recorded by the manifest pass below
                warn!("capture of dataset '{}' failed: {}", dataset.name, e);
            }
        }
    }

    guard.resume(&mut summary);

    let expected: Vec<String> = datasets.iter().map(Dataset::artifact_name).collect();
    let manifest =
        manifest::write_manifest(&tmp_dir, &set_id, &expected, captured_at, &mut summary)?;

    // The set becomes visible under its final name only now, complete
    fs::rename(&tmp_dir, &final_dir)?;
    info!("backup set {} complete at {}", set_id, final_dir.display());

    Ok(BackupReport {
        set_id,
        set_dir: final_dir,
        manifest,
        summary,
    })
}

/// Human-readable plan of what a backup would do, for dry runs.
pub fn plan_backup(config: &VaultConfig, scope: &BackupScope) -> Result<Vec<String>> {
    let datasets = config.datasets_for_scope(scope)?;
    let services = dependent_services(&datasets);
    let mut lines = vec![format!(
        "would create set under {}",
        config.backups_dir().join(scope.dir_name()).display()
    )];
    lines.push(format!("would pause services: {:?}", services));
    for dataset in &datasets {
        lines.push(format!("would capture {}", dataset.artifact_name()));
    }
    Ok(lines)
}

/// Union of dependent services, order-preserving and deduplicated.
fn dependent_services(datasets: &[Dataset]) -> Vec<String> {
    let mut services = Vec::new();
    for dataset in datasets {
        for service in &dataset.services {
            if !services.contains(service) {
                services.push(service.clone());
            }
        }
    }
    services
}
