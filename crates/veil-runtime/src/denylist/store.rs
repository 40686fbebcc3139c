//! In-memory denylist indices with lazy hydration and write-through
//! persistence.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use nix::sys::signal::Signal;
use veil_common::constants::ISOLATED_MAGIC;
use veil_common::error::{Result, VeilError};
use veil_common::types::{AppId, DenylistEntry};
use veil_core::procfs::{ProcessTable, crawl};

use super::db::DenylistDb;
use super::packages::PackageResolver;

#[derive(Debug, Default)]
struct Indices {
    pkg_to_procs: BTreeMap<String, BTreeSet<String>>,
    app_id_to_pkgs: HashMap<AppId, BTreeSet<String>>,
    /// Packages dropped under the lock whose rows still need deleting.
    stale: Vec<String>,
}

impl Indices {
    fn insert(&mut self, entry: &DenylistEntry, app_id: Option<AppId>) -> bool {
        let inserted = self
            .pkg_to_procs
            .entry(entry.package.clone())
            .or_default()
            .insert(entry.process.clone());
        if let Some(app_id) = app_id {
            let _ = self
                .app_id_to_pkgs
                .entry(app_id)
                .or_default()
                .insert(entry.package.clone());
        }
        inserted
    }

    fn remove(&mut self, package: &str, process: Option<&str>) -> bool {
        let Some(procs) = self.pkg_to_procs.get_mut(package) else {
            return false;
        };
        let removed = match process {
            Some(process) => procs.remove(process),
            None => {
                procs.clear();
                true
            }
        };
        if procs.is_empty() {
            let _ = self.pkg_to_procs.remove(package);
            self.forget_app_ids(package);
        }
        removed
    }

    fn forget_app_ids(&mut self, package: &str) {
        self.app_id_to_pkgs.retain(|_, pkgs| {
            let _ = pkgs.remove(package);
            !pkgs.is_empty()
        });
    }

    fn regular_packages(&self) -> Vec<String> {
        self.pkg_to_procs
            .keys()
            .filter(|pkg| *pkg != ISOLATED_MAGIC)
            .cloned()
            .collect()
    }

    /// Applies fresh resolutions. Packages removed since the names were
    /// collected are left alone.
    fn apply_scan(&mut self, resolved: Vec<(String, Option<AppId>)>) {
        for (package, app_id) in resolved {
            if !self.pkg_to_procs.contains_key(&package) {
                continue;
            }
            self.forget_app_ids(&package);
            match app_id {
                Some(app_id) => {
                    let _ = self
                        .app_id_to_pkgs
                        .entry(app_id)
                        .or_default()
                        .insert(package);
                }
                None => {
                    tracing::info!(pkg = %package, "denylist: package no longer installed");
                    let _ = self.pkg_to_procs.remove(&package);
                    self.stale.push(package);
                }
            }
        }
    }

    fn matches(&self, app_id: AppId, process: &str) -> bool {
        if app_id.is_isolated() {
            return self
                .pkg_to_procs
                .get(ISOLATED_MAGIC)
                .is_some_and(|prefixes| prefixes.iter().any(|p| process.starts_with(p.as_str())));
        }
        self.app_id_to_pkgs.get(&app_id).is_some_and(|pkgs| {
            pkgs.iter().any(|pkg| {
                self.pkg_to_procs
                    .get(pkg)
                    .is_some_and(|procs| procs.contains(process))
            })
        })
    }

    fn snapshot(&self) -> DenylistSnapshot {
        let entries = self
            .pkg_to_procs
            .iter()
            .flat_map(|(package, procs)| {
                procs.iter().map(|process| DenylistEntry {
                    package: package.clone(),
                    process: process.clone(),
                })
            })
            .collect();
        DenylistSnapshot { entries }
    }
}

/// Immutable copy of the denylist taken under the store lock.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DenylistSnapshot {
    entries: Vec<DenylistEntry>,
}

impl DenylistSnapshot {
    /// Iterates the captured pairs, sorted by package then process.
    pub fn iter(&self) -> std::slice::Iter<'_, DenylistEntry> {
        self.entries.iter()
    }

    /// Returns the number of captured pairs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns whether the denylist was empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<'a> IntoIterator for &'a DenylistSnapshot {
    type Item = &'a DenylistEntry;
    type IntoIter = std::slice::Iter<'a, DenylistEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// The shared denylist.
///
/// The indices are hydrated from the database on first use. The lock is
/// never held across persistence, process crawling or package resolution,
/// except while hydrating.
pub struct DenylistStore {
    indices: Mutex<Option<Indices>>,
    enforced: AtomicBool,
    db: Arc<dyn DenylistDb>,
    packages: Arc<dyn PackageResolver>,
    processes: Arc<dyn ProcessTable>,
}

impl std::fmt::Debug for DenylistStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DenylistStore")
            .field("enforced", &self.is_enforced())
            .finish_non_exhaustive()
    }
}

impl DenylistStore {
    /// Creates an unhydrated store.
    pub fn new(
        db: Arc<dyn DenylistDb>,
        packages: Arc<dyn PackageResolver>,
        processes: Arc<dyn ProcessTable>,
    ) -> Self {
        Self {
            indices: Mutex::new(None),
            enforced: AtomicBool::new(false),
            db,
            packages,
            processes,
        }
    }

    /// Returns whether enforcement is active.
    pub fn is_enforced(&self) -> bool {
        self.enforced.load(Ordering::Acquire)
    }

    /// Sets the enforcement flag and returns its previous value.
    pub fn set_enforced(&self, enforced: bool) -> bool {
        self.enforced.swap(enforced, Ordering::AcqRel)
    }

    fn lock(&self) -> MutexGuard<'_, Option<Indices>> {
        self.indices.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn load(&self) -> Result<Indices> {
        let mut indices = Indices::default();
        for entry in self.db.entries()? {
            if !veil_common::types::is_valid_target(&entry.package, &entry.process) {
                tracing::warn!(pkg = %entry.package, proc = %entry.process, "denylist: skipping malformed row");
                continue;
            }
            let _ = indices.insert(&entry, None);
        }
        let users = self.packages.users();
        let resolved = indices
            .regular_packages()
            .into_iter()
            .map(|pkg| {
                let app_id = self.packages.app_id(&users, &pkg);
                (pkg, app_id)
            })
            .collect();
        indices.apply_scan(resolved);
        tracing::debug!(packages = indices.pkg_to_procs.len(), "denylist: hydrated");
        Ok(indices)
    }

    /// Runs `f` on the hydrated indices, then deletes the rows of any
    /// package `f` (or hydration) dropped.
    fn with_indices<R>(&self, f: impl FnOnce(&mut Indices) -> R) -> Result<R> {
        let (result, stale) = {
            let mut guard = self.lock();
            let indices = match guard.take() {
                Some(indices) => indices,
                None => self.load()?,
            };
            let indices = guard.insert(indices);
            let result = f(indices);
            (result, std::mem::take(&mut indices.stale))
        };
        for package in stale {
            if let Err(e) = self.db.delete(&package, None) {
                tracing::warn!(pkg = %package, error = %e, "denylist: cannot delete stale rows");
            }
        }
        Ok(result)
    }

    /// Hydrates the indices if that has not happened yet.
    ///
    /// # Errors
    ///
    /// Returns [`VeilError::Persistence`] if the rows cannot be read; the
    /// store stays unhydrated and the next call retries.
    pub fn ensure_loaded(&self) -> Result<()> {
        self.with_indices(|_| ())
    }

    /// Adds `(package, process)`. An empty `process` means the package name.
    ///
    /// # Errors
    ///
    /// - [`VeilError::InvalidTarget`] for malformed names or a package that
    ///   is not installed for any user.
    /// - [`VeilError::AlreadyExists`] if the pair is already listed.
    /// - [`VeilError::Persistence`] if the row cannot be written; the
    ///   in-memory addition is kept.
    pub fn add(&self, package: &str, process: &str) -> Result<()> {
        let entry = DenylistEntry::new(package, process)?;
        let app_id = if entry.is_isolated() {
            None
        } else {
            Some(
                self.packages
                    .resolve(&entry.package)
                    .ok_or_else(|| VeilError::InvalidTarget {
                        package: entry.package.clone(),
                        process: entry.process.clone(),
                        reason: "package is not installed",
                    })?,
            )
        };

        if !self.with_indices(|indices| indices.insert(&entry, app_id))? {
            return Err(VeilError::AlreadyExists {
                package: entry.package,
                process: entry.process,
            });
        }
        tracing::info!(pkg = %entry.package, proc = %entry.process, "denylist: add");

        let persisted = self.db.insert(&entry);
        if self.is_enforced() {
            self.kill_running(&entry);
        }
        persisted
    }

    /// Removes `(package, process)`, or every process of `package` when
    /// `process` is empty.
    ///
    /// # Errors
    ///
    /// - [`VeilError::NotFound`] if nothing matched.
    /// - [`VeilError::Persistence`] if the rows cannot be deleted; the
    ///   in-memory removal is kept.
    pub fn remove(&self, package: &str, process: &str) -> Result<()> {
        let process = (!process.is_empty()).then_some(process);
        if !self.with_indices(|indices| indices.remove(package, process))? {
            return Err(VeilError::NotFound {
                package: package.to_owned(),
                process: process.unwrap_or_default().to_owned(),
            });
        }
        tracing::info!(pkg = %package, proc = process.unwrap_or("*"), "denylist: rm");
        self.db.delete(package, process)
    }

    /// Re-resolves every package against the current user profiles,
    /// dropping (and un-persisting) packages that are gone.
    ///
    /// Does nothing if the store has never been hydrated.
    ///
    /// # Errors
    ///
    /// Returns an error only if hydration is attempted and fails.
    pub fn rescan(&self) -> Result<()> {
        if self.lock().is_none() {
            return Ok(());
        }
        let packages = self.with_indices(|indices| indices.regular_packages())?;
        let users = self.packages.users();
        let resolved: Vec<_> = packages
            .into_iter()
            .map(|pkg| {
                let app_id = self.packages.app_id(&users, &pkg);
                (pkg, app_id)
            })
            .collect();
        self.with_indices(|indices| indices.apply_scan(resolved))
    }

    /// Rescans, then captures every listed pair.
    ///
    /// # Errors
    ///
    /// Returns [`VeilError::Persistence`] if hydration fails.
    pub fn list(&self) -> Result<DenylistSnapshot> {
        self.ensure_loaded()?;
        self.rescan()?;
        self.with_indices(|indices| indices.snapshot())
    }

    /// Returns whether a process named `process` running as `uid` is listed.
    ///
    /// Isolated uids match sentinel entries by prefix; other uids match the
    /// exact names of every package sharing their app id.
    pub fn is_target(&self, uid: u32, process: &str) -> bool {
        let app_id = AppId::from_uid(uid);
        self.with_indices(|indices| indices.matches(app_id, process))
            .unwrap_or_else(|e| {
                tracing::warn!(error = %e, "denylist: unavailable");
                false
            })
    }

    /// Returns whether any listed package runs under `uid`'s app id.
    pub fn has_app_id(&self, uid: u32) -> bool {
        let app_id = AppId::from_uid(uid);
        self.with_indices(|indices| indices.app_id_to_pkgs.contains_key(&app_id))
            .unwrap_or(false)
    }

    /// Kills running processes matching a freshly added entry.
    fn kill_running(&self, entry: &DenylistEntry) {
        let processes = &*self.processes;
        let result = crawl(processes, |pid| {
            let Ok(cmdline) = processes.cmdline(pid) else {
                return true;
            };
            let matched = if entry.is_isolated() {
                cmdline.starts_with(&entry.process)
            } else {
                cmdline == entry.process
            };
            if !matched {
                return true;
            }
            match processes.signal(pid, Signal::SIGKILL) {
                Ok(()) => tracing::debug!(pid = pid.as_raw(), proc = %cmdline, "denylist: kill"),
                Err(e) => tracing::debug!(pid = pid.as_raw(), error = %e, "denylist: kill failed"),
            }
            // Sentinel prefixes may match many processes.
            entry.is_isolated()
        });
        if let Err(e) = result {
            tracing::warn!(error = %e, "denylist: cannot crawl processes");
        }
    }
}
