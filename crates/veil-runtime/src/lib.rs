//! Denylist enforcement for the Veil daemon.
//!
//! The [`daemon::Daemon`] context owns the [`denylist::DenylistStore`] and
//! starts the two process-birth monitors: the ptrace-based
//! [`monitor`] attached to every zygote, and the [`logcat`] fallback that
//! watches the system event log.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod client;
pub mod daemon;
pub mod denylist;
pub mod discovery;
pub mod logcat;
pub mod monitor;
pub mod protocol;
pub mod remediation;
pub mod server;

#[cfg(test)]
pub(crate) mod testing;
