//! Age-based retention sweeping of backup sets.
//!
//! Each scope has a maximum age in days. A set's age comes from the
//! timestamp token encoded in its directory name — not filesystem
//! metadata, so a copied set keeps its true age. Sets newer than the
//! window are never deleted; deletion races with a concurrent or prior
//! sweep are tolerated, not errors.

use crate::error::Result;
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use tracing::{debug, info, warn};

/// Timestamp layout of a backup-set token (`20260830-143000`).
pub const TOKEN_FORMAT: &str = "%Y%m%d-%H%M%S";

/// Per-scope maximum age, in whole days.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RetentionPolicy(pub BTreeMap<String, u32>);

impl RetentionPolicy {
    pub fn window_days(&self, scope: &str) -> Option<u32> {
        self.0.get(scope).copied()
    }
}

/// Outcome of one sweep.
#[derive(Debug, Clone, Default)]
pub struct SweepReport {
    /// Set directories examined across all scopes
    pub examined: usize,
    /// Set ids removed (scope-qualified, e.g. `full/20260801-020000`)
    pub deleted: Vec<String>,
    /// Sets inside their window and kept
    pub kept: usize,
}

/// Parse the capture timestamp out of a set directory name.
///
/// Accepts a bare token or a token with a `-N` disambiguation suffix,
/// nothing else: a name that merely starts with a token (an operator's
/// renamed or annotated directory) is not a backup set and must never
/// become sweep-eligible.
pub fn parse_set_timestamp(name: &str) -> Option<DateTime<Utc>> {
    let token = name.get(..15)?;
    let naive = NaiveDateTime::parse_from_str(token, TOKEN_FORMAT).ok()?;

    let rest = &name[15..];
    let suffix_ok = rest.is_empty()
        || rest
            .strip_prefix('-')
            .is_some_and(|n| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()));
    if !suffix_ok {
        return None;
    }
    Some(Utc.from_utc_datetime(&naive))
}

/// Delete every backup set older than its scope's retention window.
///
/// Scopes absent from the policy are never touched. In-progress sets
/// (`.tmp-` prefix) and directories whose names carry no parsable token
/// are skipped with a warning.
pub fn sweep(
    backups_root: &Path,
    policy: &RetentionPolicy,
    now: DateTime<Utc>,
    dry_run: bool,
) -> Result<SweepReport> {
    let mut report = SweepReport::default();

    for (scope, days) in &policy.0 {
        let scope_dir = backups_root.join(scope);
        if !scope_dir.is_dir() {
            debug!("no backup sets for scope '{}' yet", scope);
            continue;
        }

        for entry in fs::read_dir(&scope_dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with(".tmp-") {
                debug!("skipping in-progress set {}/{}", scope, name);
                continue;
            }
            report.examined += 1;

            let Some(captured_at) = parse_set_timestamp(&name) else {
                warn!(
                    "skipping {}/{}: directory name carries no capture timestamp",
                    scope, name
                );
                continue;
            };

            let age_days = (now - captured_at).num_days();
            if age_days <= i64::from(*days) {
                debug!("keeping {}/{} (age {} days)", scope, name, age_days);
                report.kept += 1;
                continue;
            }

            let set_id = format!("{}/{}", scope, name);
            if dry_run {
                info!("dry-run: would delete expired set {} (age {} days)", set_id, age_days);
                report.deleted.push(set_id);
                continue;
            }

            match fs::remove_dir_all(entry.path()) {
                Ok(()) => {
                    info!("deleted expired set {} (age {} days)", set_id, age_days);
                    report.deleted.push(set_id);
                }
                // Already removed by a concurrent or prior sweep
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    debug!("set {} already removed, ignoring", set_id);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    info!(
        "retention sweep: examined {}, deleted {}, kept {}",
        report.examined,
        report.deleted.len(),
        report.kept
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn token_for(now: DateTime<Utc>, age_days: i64) -> String {
        (now - Duration::days(age_days)).format(TOKEN_FORMAT).to_string()
    }

    fn make_set(root: &Path, scope: &str, name: &str) {
        let dir = root.join(scope).join(name);
        fs::create_dir_all(&dir).expect("mkdir set");
        fs::write(dir.join("manifest.json"), b"{}").expect("write manifest");
    }

    #[test]
    fn test_parse_set_timestamp() {
        let ts = parse_set_timestamp("20260830-143000").expect("valid token");
        assert_eq!(ts.format(TOKEN_FORMAT).to_string(), "20260830-143000");

        // Disambiguation suffix is ignored
        assert!(parse_set_timestamp("20260830-143000-2").is_some());
        assert!(parse_set_timestamp("20260830-143000-12").is_some());

        assert!(parse_set_timestamp("notatoken").is_none());
        assert!(parse_set_timestamp("2026").is_none());

        // Token-prefixed names are not backup sets
        assert!(parse_set_timestamp("20260830-143000-keep-this").is_none());
        assert!(parse_set_timestamp("20260830-143000.bak").is_none());
        assert!(parse_set_timestamp("20260830-143000-").is_none());
    }

    #[test]
    fn test_sweep_deletes_exactly_the_expired_sets() {
        let root = tempfile::tempdir().expect("tempdir");
        let now = Utc::now();

        for age in [1, 8, 10, 40] {
            make_set(root.path(), "full", &token_for(now, age));
        }

        let mut policy = RetentionPolicy::default();
        policy.0.insert("full".to_string(), 7);

        let report = sweep(root.path(), &policy, now, false).expect("sweep");
        assert_eq!(report.examined, 4);
        assert_eq!(report.deleted.len(), 3);
        assert_eq!(report.kept, 1);

        // The 1-day set survives
        let remaining: Vec<_> = fs::read_dir(root.path().join("full"))
            .expect("scope dir")
            .map(|e| e.expect("entry").file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(remaining, vec![token_for(now, 1)]);
    }

    #[test]
    fn test_sweep_never_deletes_inside_window() {
        let root = tempfile::tempdir().expect("tempdir");
        let now = Utc::now();
        make_set(root.path(), "full", &token_for(now, 7));

        let mut policy = RetentionPolicy::default();
        policy.0.insert("full".to_string(), 7);

        let report = sweep(root.path(), &policy, now, false).expect("sweep");
        assert!(report.deleted.is_empty(), "age equal to window is kept");
        assert_eq!(report.kept, 1);
    }

    #[test]
    fn test_sweep_ignores_unparsable_and_tmp_directories() {
        let root = tempfile::tempdir().expect("tempdir");
        let now = Utc::now();
        make_set(root.path(), "full", "scratch-notes");
        make_set(root.path(), "full", &format!(".tmp-{}", token_for(now, 30)));

        let mut policy = RetentionPolicy::default();
        policy.0.insert("full".to_string(), 7);

        let report = sweep(root.path(), &policy, now, false).expect("sweep");
        assert!(report.deleted.is_empty());
        assert!(root.path().join("full/scratch-notes").is_dir());
    }

    #[test]
    fn test_sweep_spares_annotated_directories_with_token_prefix() {
        let root = tempfile::tempdir().expect("tempdir");
        let now = Utc::now();
        let annotated = format!("{}-keep-this", token_for(now, 30));
        make_set(root.path(), "full", &annotated);

        let mut policy = RetentionPolicy::default();
        policy.0.insert("full".to_string(), 7);

        let report = sweep(root.path(), &policy, now, false).expect("sweep");
        assert!(report.deleted.is_empty());
        assert!(root.path().join("full").join(&annotated).is_dir());
    }

    #[test]
    fn test_sweep_dry_run_deletes_nothing() {
        let root = tempfile::tempdir().expect("tempdir");
        let now = Utc::now();
        let old = token_for(now, 30);
        make_set(root.path(), "full", &old);

        let mut policy = RetentionPolicy::default();
        policy.0.insert("full".to_string(), 7);

        let report = sweep(root.path(), &policy, now, true).expect("sweep");
        assert_eq!(report.deleted.len(), 1);
        assert!(root.path().join("full").join(&old).is_dir());
    }

    #[test]
    fn test_sweep_leaves_unpoliced_scopes_alone() {
        let root = tempfile::tempdir().expect("tempdir");
        let now = Utc::now();
        let old = token_for(now, 400);
        make_set(root.path(), "photos", &old);

        let mut policy = RetentionPolicy::default();
        policy.0.insert("full".to_string(), 7);

        let report = sweep(root.path(), &policy, now, false).expect("sweep");
        assert_eq!(report.examined, 0);
        assert!(root.path().join("photos").join(&old).is_dir());
    }

    #[test]
    fn test_sweep_missing_scope_dir_is_fine() {
        let root = tempfile::tempdir().expect("tempdir");
        let mut policy = RetentionPolicy::default();
        policy.0.insert("full".to_string(), 7);
        let report = sweep(root.path(), &policy, Utc::now(), false).expect("sweep");
        assert_eq!(report.examined, 0);
    }
}
