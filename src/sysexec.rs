//! sysexec.rs - Synchronous execution of external system commands.
//!
//! Every shell-out in DataVault (mkfs, mount, umount, fuser, systemctl,
//! tar, dump tools) goes through [`run_command`] so command lines are
//! logged uniformly and exit status handling lives in one place. All
//! invocations are blocking; this system is invoked on demand, not a
//! resident daemon.

use crate::error::{Result, VaultError};
use std::path::Path;
use std::process::{Command, Stdio};
use tracing::{debug, info};

/// Captured result of one external command.
#[derive(Debug, Clone)]
pub struct CmdOutput {
    /// Standard output, lossily decoded.
    pub stdout: String,
    /// Standard error, lossily decoded.
    pub stderr: String,
    /// Exit code (None if terminated by signal).
    pub exit_code: Option<i32>,
    /// Whether the command exited with code 0.
    pub success: bool,
}

impl CmdOutput {
    /// Check that the command succeeded and return a system error if not.
    pub fn ensure_success(&self, context: &str) -> Result<()> {
        if self.success {
            Ok(())
        } else {
            let code = self.exit_code.unwrap_or(-1);
            Err(VaultError::system(format!(
                "{} failed (exit code {}): {}",
                context,
                code,
                self.stderr.trim()
            )))
        }
    }
}

/// Run an external command with arguments, capturing stdout/stderr.
///
/// A non-zero exit is not an error here; callers decide via
/// [`CmdOutput::ensure_success`] because some tools (fuser, systemctl
/// is-active) signal ordinary conditions through their exit code.
pub fn run_command(program: &str, args: &[&str]) -> Result<CmdOutput> {
    debug!("exec: {} {}", program, args.join(" "));

    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .map_err(|e| VaultError::system(format!("failed to spawn {}: {}", program, e)))?;

    let result = CmdOutput {
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        exit_code: output.status.code(),
        success: output.status.success(),
    };

    if result.success {
        debug!("exec ok: {}", program);
    } else {
        info!(
            "exec failed: {} (exit code {:?}): {}",
            program,
            result.exit_code,
            result.stderr.trim()
        );
    }
    Ok(result)
}

/// Run a command and redirect its stdout into a file.
///
/// Used for dump-style captures (`pg_dump > artifact.sql`) where the
/// tool writes the payload to stdout.
pub fn run_command_to_file(program: &str, args: &[&str], dest: &Path) -> Result<CmdOutput> {
    debug!("exec: {} {} > {}", program, args.join(" "), dest.display());

    let file = std::fs::File::create(dest)?;
    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::from(file))
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| VaultError::system(format!("failed to spawn {}: {}", program, e)))?
        .wait_with_output()
        .map_err(|e| VaultError::system(format!("failed waiting for {}: {}", program, e)))?;

    Ok(CmdOutput {
        stdout: String::new(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        exit_code: output.status.code(),
        success: output.status.success(),
    })
}
