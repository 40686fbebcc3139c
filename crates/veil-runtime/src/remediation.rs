//! Reverting or injecting the daemon's mounts inside a target process.
//!
//! Namespace switching happens in a separate helper process so that no
//! daemon thread ever changes its own mount namespace.

use std::path::PathBuf;
use std::process::Command;

use nix::unistd::Pid;
use veil_common::error::{Result, VeilError};

/// Mount work performed inside another process's mount namespace.
pub trait Remediator: Send + Sync {
    /// Removes the daemon's mounts from the namespace of `pid`.
    ///
    /// # Errors
    ///
    /// Returns [`VeilError::Remediation`] if the work could not be done.
    fn revert(&self, pid: Pid) -> Result<()>;

    /// Adds the daemon's mounts to the namespace of `pid`.
    ///
    /// # Errors
    ///
    /// Returns [`VeilError::Remediation`] if the work could not be done.
    fn mount_into(&self, pid: Pid) -> Result<()>;
}

/// Applies the action appropriate for a matched target: in allow-list mode
/// targets receive the mounts, otherwise the mounts are reverted.
///
/// # Errors
///
/// Propagates the remediator's failure.
pub fn remediate(remediator: &dyn Remediator, pid: Pid, allowlist_mode: bool) -> Result<()> {
    if allowlist_mode {
        remediator.mount_into(pid)
    } else {
        remediator.revert(pid)
    }
}

/// [`Remediator`] running `<helper> revert|mount <pid>`.
#[derive(Debug, Clone)]
pub struct HelperRemediator {
    helper: PathBuf,
}

impl HelperRemediator {
    /// Creates a remediator invoking the given helper executable.
    #[must_use]
    pub fn new(helper: impl Into<PathBuf>) -> Self {
        Self {
            helper: helper.into(),
        }
    }

    fn run(&self, action: &str, pid: Pid) -> Result<()> {
        tracing::debug!(pid = pid.as_raw(), action, helper = %self.helper.display(), "running remediation helper");
        let output = Command::new(&self.helper)
            .arg(action)
            .arg(pid.to_string())
            .output()
            .map_err(|e| VeilError::Remediation {
                pid: pid.as_raw(),
                message: format!("failed to run {}: {e}", self.helper.display()),
            })?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(VeilError::Remediation {
                pid: pid.as_raw(),
                message: format!("{action} exited with {}: {}", output.status, stderr.trim()),
            });
        }
        Ok(())
    }
}

impl Remediator for HelperRemediator {
    fn revert(&self, pid: Pid) -> Result<()> {
        self.run("revert", pid)
    }

    fn mount_into(&self, pid: Pid) -> Result<()> {
        self.run("mount", pid)
    }
}
