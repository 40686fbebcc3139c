//! Domain primitive types used across the Veil workspace.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::constants::{AID_ISOLATED_END, AID_ISOLATED_START, AID_USER_OFFSET, ISOLATED_MAGIC};
use crate::error::{Result, VeilError};

/// Application identity shared by every per-user installation of a package.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AppId(u32);

impl AppId {
    /// Wraps a raw app id.
    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Derives the app id from a process owner's uid.
    #[must_use]
    pub const fn from_uid(uid: u32) -> Self {
        Self(uid % AID_USER_OFFSET)
    }

    /// Returns the raw numeric value.
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }

    /// Returns whether this id belongs to the isolated-service range.
    #[must_use]
    pub const fn is_isolated(self) -> bool {
        self.0 >= AID_ISOLATED_START && self.0 <= AID_ISOLATED_END
    }
}

impl fmt::Display for AppId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A validated (package identity, process name) pair.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DenylistEntry {
    /// Package name, or [`ISOLATED_MAGIC`].
    pub package: String,
    /// Exact process name, or a prefix for the isolated sentinel.
    pub process: String,
}

impl DenylistEntry {
    /// Builds a validated entry. An empty process name defaults to the package name.
    ///
    /// # Errors
    ///
    /// Returns [`VeilError::InvalidTarget`] if either name contains characters
    /// outside its allowed class.
    pub fn new(package: impl Into<String>, process: impl Into<String>) -> Result<Self> {
        let package = package.into();
        let mut process = process.into();
        if process.is_empty() {
            process.clone_from(&package);
        }
        if !is_valid_target(&package, &process) {
            return Err(VeilError::InvalidTarget {
                package,
                process,
                reason: "malformed package or process name",
            });
        }
        Ok(Self { package, process })
    }

    /// Returns whether this entry targets isolated services by prefix.
    #[must_use]
    pub fn is_isolated(&self) -> bool {
        self.package == ISOLATED_MAGIC
    }
}

impl fmt::Display for DenylistEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}", self.package, self.process)
    }
}

/// Checks the character classes of a (package, process) pair.
///
/// Normal packages allow `[A-Za-z0-9_.]` and need at least one `.`; their
/// process names allow `[A-Za-z0-9_.:]`. Under the isolated sentinel the
/// process name is checked only up to its first `:`.
#[must_use]
pub fn is_valid_target(package: &str, process: &str) -> bool {
    let name_char = |c: char| c.is_ascii_alphanumeric() || c == '_' || c == '.';

    if package == ISOLATED_MAGIC {
        let head = process.split(':').next().unwrap_or_default();
        return head.chars().all(name_char);
    }

    let package_valid =
        !package.is_empty() && package.chars().all(name_char) && package.contains('.');
    let process_valid = process.chars().all(|c| name_char(c) || c == ':');
    package_valid && process_valid
}
