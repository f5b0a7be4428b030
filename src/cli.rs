//! Command-line interface and the interactive decision provider.

use crate::error::Result;
use crate::guard::{Decision, DecisionProvider, DevicePrompt, RecoveryDecision};
use clap::{Parser, Subcommand};
use std::io::{BufRead, Write};
use std::path::PathBuf;

/// DataVault - removable storage provisioning and backup orchestrator
#[derive(Parser)]
#[command(name = "datavault")]
#[command(about = "Provision removable storage for application data and manage its backups")]
#[command(version)]
pub struct Cli {
    /// Path to a JSON configuration file (defaults apply when omitted)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Dry-run mode: show what would be executed without making changes.
    ///
    /// Destructive operations (format, service stops, deletes) are
    /// skipped and logged. Read-only operations still execute so the
    /// preview is realistic.
    #[arg(long, global = true)]
    pub dry_run: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Bring the storage device to a mounted, provisioned state
    Provision,
    /// Capture a backup set for a scope ("full" or a dataset name)
    Backup {
        /// Backup scope
        scope: String,
    },
    /// Delete backup sets older than their scope's retention window
    Sweep,
    /// Re-check every artifact of an existing backup set
    Verify {
        /// Path of the backup-set directory
        set: PathBuf,
    },
    /// List enumerated block devices and mark class matches
    Devices,
}

impl Cli {
    pub fn parse_args() -> Self {
        <Self as clap::Parser>::parse()
    }
}

/// Terminal-backed decision provider for interactive runs.
///
/// The guard state machine itself never touches a terminal; it only sees
/// this capability, so tests drive it with scripted providers instead.
#[derive(Debug, Default)]
pub struct ConsoleDecisionProvider;

impl ConsoleDecisionProvider {
    fn ask(&self, question: &str) -> Result<String> {
        eprint!("{}", question);
        std::io::stderr().flush()?;
        let mut line = String::new();
        std::io::stdin().lock().read_line(&mut line)?;
        Ok(line.trim().to_string())
    }
}

impl DecisionProvider for ConsoleDecisionProvider {
    fn choose(&mut self, prompt: &DevicePrompt) -> Result<Decision> {
        let signature = prompt.fs_signature.as_deref().unwrap_or("unknown");
        loop {
            let answer = self.ask(&format!(
                "Device {} is {} (filesystem: {}).\nChoose [format/use-existing/skip]: ",
                prompt.device.display(),
                prompt.state,
                signature
            ))?;
            match answer.as_str() {
                "format" => return Ok(Decision::Format),
                "use-existing" => return Ok(Decision::UseExisting),
                "skip" => return Ok(Decision::Skip),
                other => eprintln!("unrecognized choice '{}'", other),
            }
        }
    }

    fn confirm_format(&mut self, prompt: &DevicePrompt) -> Result<String> {
        self.ask(&format!(
            "Formatting destroys all data on {}.\nType the exact phrase 'FORMAT {}' to proceed: ",
            prompt.device.display(),
            prompt.device.display()
        ))
    }

    fn choose_recovery(&mut self, prompt: &DevicePrompt) -> Result<RecoveryDecision> {
        loop {
            let answer = self.ask(&format!(
                "Mounting {} failed after format.\nChoose [format-again/skip/abort]: ",
                prompt.device.display()
            ))?;
            match answer.as_str() {
                "format-again" => return Ok(RecoveryDecision::FormatAgain),
                "skip" => return Ok(RecoveryDecision::Skip),
                "abort" => return Ok(RecoveryDecision::Abort),
                other => eprintln!("unrecognized choice '{}'", other),
            }
        }
    }
}
