//! DataVault - Main entry point
//!
//! Thin dispatch layer: parse the CLI, resolve one immutable
//! configuration, wire the production capabilities together, and print
//! outcomes. All decision logic lives in the library.

use anyhow::{Context, Result};
use chrono::Utc;
use std::str::FromStr;
use tracing::info;
use tracing_subscriber::EnvFilter;

use datavault::cli::{Cli, Commands, ConsoleDecisionProvider};
use datavault::{
    backup, classify, guard, layout, manifest, resolve_device, retention, BackupScope,
    DeviceInventory, LsblkInventory, ProvisionOutcome, SysCapturer, SysMounter,
    SystemdController, VaultConfig,
};

/// Initialize tracing with RUST_LOG override, info default.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse_args();

    let mut config = match &cli.config {
        Some(path) => VaultConfig::load_from_file(path)
            .with_context(|| format!("loading configuration {}", path.display()))?,
        None => {
            let config = VaultConfig::default();
            config.validate().context("validating default configuration")?;
            config
        }
    };
    config.dry_run = cli.dry_run;

    match cli.command {
        Commands::Provision => run_provision(&config).context("provision failed"),
        Commands::Backup { scope } => {
            let scope = BackupScope::from_str(&scope).expect("scope parsing is infallible");
            run_backup_command(&config, &scope).context("backup failed")
        }
        Commands::Sweep => run_sweep(&config).context("retention sweep failed"),
        Commands::Verify { set } => run_verify(&set).context("verification failed"),
        Commands::Devices => run_devices(&config).context("device listing failed"),
    }
}

fn run_provision(config: &VaultConfig) -> Result<()> {
    let inventory = LsblkInventory;

    if config.dry_run {
        let device = resolve_device(&inventory, config.device_class)?;
        let state = classify(&device, &config.mount_point);
        println!(
            "dry-run: would provision {} ({}) at {}",
            device.path.display(),
            state,
            config.mount_point.display()
        );
        return Ok(());
    }

    let mut decisions = ConsoleDecisionProvider;
    let mounter = SysMounter;
    match guard::provision(config, &inventory, &mut decisions, &mounter)? {
        ProvisionOutcome::Provisioned(mount_path) => {
            let created = layout::provision_tree(&mount_path, &config.namespace)?;
            layout::apply_ownership(&mount_path, &config.ownership)?;
            info!("namespace complete ({} path(s) created this run)", created);
            println!("{}", mount_path.display());
        }
        ProvisionOutcome::Skipped => {
            println!("skipped: device left alone at operator's request");
        }
    }
    Ok(())
}

fn run_backup_command(config: &VaultConfig, scope: &BackupScope) -> Result<()> {
    if config.dry_run {
        for line in backup::plan_backup(config, scope)? {
            println!("dry-run: {}", line);
        }
        return Ok(());
    }

    let report = backup::run_backup(config, &SystemdController, &SysCapturer, scope)?;
    println!("{}", report.set_id);
    println!("{}", report.summary.render());
    Ok(())
}

fn run_sweep(config: &VaultConfig) -> Result<()> {
    let report = retention::sweep(
        &config.backups_dir(),
        &config.retention,
        Utc::now(),
        config.dry_run,
    )?;
    println!(
        "examined {} set(s), deleted {}, kept {}",
        report.examined,
        report.deleted.len(),
        report.kept
    );
    for set_id in &report.deleted {
        println!("  {} {}", if config.dry_run { "would delete" } else { "deleted" }, set_id);
    }
    Ok(())
}

fn run_verify(set_dir: &std::path::Path) -> Result<()> {
    let set_id = set_dir
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| set_dir.display().to_string());

    let mut summary = datavault::RunSummary::new();
    let manifest = manifest::verify_set(set_dir, &set_id, &mut summary)?;
    println!(
        "set {}: {} artifact(s), {} bytes, captured {}",
        set_id,
        manifest.artifacts.len(),
        manifest.total_bytes,
        manifest.captured_at
    );
    println!("{}", summary.render());
    Ok(())
}

fn run_devices(config: &VaultConfig) -> Result<()> {
    let devices = LsblkInventory.enumerate()?;
    if devices.is_empty() {
        println!("no block devices enumerated");
        return Ok(());
    }
    for device in devices {
        let marker = if device.matches(config.device_class) {
            "*"
        } else {
            " "
        };
        println!(
            "{} {:<12} {:>14} bytes  fs={:<8} mounted={:<16} transport={}",
            marker,
            device.path.display(),
            device.size_bytes,
            device.fs_signature.as_deref().unwrap_or("-"),
            device
                .mountpoint
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "-".to_string()),
            device.transport.as_deref().unwrap_or("-"),
        );
    }
    println!("(* matches configured class '{}')", config.device_class);
    Ok(())
}
