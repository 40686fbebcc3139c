//! # veil-core
//!
//! Low-level Linux primitives for the Veil daemon.
//!
//! This crate provides safe abstractions over:
//! - **Procfs**: owner, command line, parentage, thread group, and security
//!   label of live processes, behind the [`procfs::ProcessTable`] trait.
//! - **Namespaces**: mount-namespace identity snapshots.
//! - **Ptrace**: the trace primitives used by the zygote monitor, behind the
//!   [`ptrace::Tracer`] trait.
//! - **Watches**: inotify watches on the package registry, user data
//!   directories, and supervisor executables.
//! - **Wake signals**: interrupting a thread blocked in a system call.
//!
//! All unsafe system calls are encapsulated in safe wrappers with
//! `// SAFETY:` documentation.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod namespace;
pub mod procfs;
pub mod ptrace;
pub mod wake;
pub mod watch;
