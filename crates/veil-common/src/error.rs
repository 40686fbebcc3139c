//! Unified error types for the Veil workspace.
//!
//! Store-level variants are translated into control-protocol response codes
//! by the runtime; monitor-level variants are logged and never leave the
//! monitor threads.

use std::path::PathBuf;

use thiserror::Error;

/// Top-level error type shared across the workspace.
#[derive(Debug, Error)]
pub enum VeilError {
    /// An I/O operation failed.
    #[error("I/O error at {path}: {source}")]
    Io {
        /// Path where the I/O error occurred.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// A configuration value is invalid.
    #[error("invalid configuration: {message}")]
    Config {
        /// Description of the invalid configuration.
        message: String,
    },

    /// A package or process name is malformed, or the package is not installed.
    #[error("invalid target {package}/{process}: {reason}")]
    InvalidTarget {
        /// Package identity that was rejected.
        package: String,
        /// Process name that was rejected.
        process: String,
        /// Why the pair was rejected.
        reason: &'static str,
    },

    /// The (package, process) pair is already on the denylist.
    #[error("{package}/{process} is already on the denylist")]
    AlreadyExists {
        /// Package identity.
        package: String,
        /// Process name.
        process: String,
    },

    /// Nothing on the denylist matched a removal request.
    #[error("{package}/{process} is not on the denylist")]
    NotFound {
        /// Package identity.
        package: String,
        /// Process name, empty when the whole package was requested.
        process: String,
    },

    /// The persistence layer failed.
    #[error("persistence failure: {message}")]
    Persistence {
        /// Description of the failed operation.
        message: String,
    },

    /// The host kernel does not support mount namespaces.
    #[error("mount namespaces are not supported by this kernel")]
    NamespaceUnsupported,

    /// A trace primitive failed, usually because its target already exited.
    #[error("{op} failed for pid {pid}: {errno}")]
    TraceFailure {
        /// Name of the trace operation.
        op: &'static str,
        /// Target process id.
        pid: i32,
        /// Kernel error.
        errno: nix::errno::Errno,
    },

    /// The remediation helper could not be run or reported failure.
    #[error("remediation of pid {pid} failed: {message}")]
    Remediation {
        /// Process that was being remediated.
        pid: i32,
        /// Description of the failure.
        message: String,
    },

    /// A control-protocol frame was malformed.
    #[error("protocol error: {message}")]
    Protocol {
        /// Description of the malformed frame.
        message: String,
    },

    /// Serialization or deserialization failed.
    #[error("serialization error: {source}")]
    Serialization {
        /// Underlying serialization error.
        #[from]
        source: serde_json::Error,
    },
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, VeilError>;
