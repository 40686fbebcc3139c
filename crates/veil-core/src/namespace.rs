//! Mount namespace identity.
//!
//! Two processes share a mount namespace exactly when their
//! `/proc/<pid>/ns/mnt` links resolve to the same (device, inode) pair.

use std::os::unix::fs::MetadataExt;
use std::path::Path;

use veil_common::error::{Result, VeilError};

/// Snapshot of a mount namespace's identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MountNs {
    /// Device of the nsfs inode.
    pub dev: u64,
    /// Inode number of the namespace.
    pub ino: u64,
}

impl MountNs {
    /// Reads the namespace identity behind a `ns/mnt` path.
    ///
    /// # Errors
    ///
    /// Returns an error if the path cannot be stat'ed (usually because the
    /// process already exited).
    pub fn read(path: &Path) -> Result<Self> {
        let meta = std::fs::metadata(path).map_err(|e| VeilError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        Ok(Self {
            dev: meta.dev(),
            ino: meta.ino(),
        })
    }
}

/// Returns whether the kernel exposes mount namespaces under `proc_root`.
#[must_use]
pub fn mount_ns_supported(proc_root: &Path) -> bool {
    let supported = proc_root.join("self/ns/mnt").exists();
    if !supported {
        tracing::warn!(proc_root = %proc_root.display(), "kernel does not support mount namespaces");
    }
    supported
}
