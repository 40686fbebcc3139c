//! The denylist: which (package, process) pairs must never see the
//! daemon's mounts.
//!
//! [`DenylistStore`] keeps two indices behind one mutex and persists every
//! mutation through a [`DenylistDb`]. Package names are turned into app ids
//! by a [`PackageResolver`].

pub mod db;
pub mod packages;
pub mod store;

pub use db::{DenylistDb, SqliteDb};
pub use packages::{DataDirResolver, PackageResolver};
pub use store::{DenylistSnapshot, DenylistStore};
