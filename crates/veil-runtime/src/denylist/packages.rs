//! Resolving package names to app ids.

use std::os::unix::fs::MetadataExt;
use std::path::PathBuf;

use veil_common::types::AppId;

/// Maps an installed package to the app id it runs under.
pub trait PackageResolver: Send + Sync {
    /// Lists the user profiles present on the device.
    fn users(&self) -> Vec<u32>;

    /// Looks `package` up in the given user profiles and returns the app id
    /// of the first installation found.
    fn app_id(&self, users: &[u32], package: &str) -> Option<AppId>;

    /// Resolves `package` across every current user profile.
    fn resolve(&self, package: &str) -> Option<AppId> {
        self.app_id(&self.users(), package)
    }
}

/// [`PackageResolver`] reading the owner of `<root>/<user>/<package>`.
///
/// Every package gets a private data directory per user, owned by the uid
/// the package runs as in that profile.
#[derive(Debug, Clone)]
pub struct DataDirResolver {
    root: PathBuf,
}

impl DataDirResolver {
    /// Creates a resolver over the per-user data root.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl PackageResolver for DataDirResolver {
    fn users(&self) -> Vec<u32> {
        let Ok(entries) = std::fs::read_dir(&self.root) else {
            tracing::warn!(root = %self.root.display(), "cannot list user profiles");
            return Vec::new();
        };
        let mut users: Vec<u32> = entries
            .filter_map(std::result::Result::ok)
            .filter(|entry| entry.file_type().is_ok_and(|t| t.is_dir()))
            .filter_map(|entry| entry.file_name().to_str()?.parse().ok())
            .collect();
        users.sort_unstable();
        users
    }

    fn app_id(&self, users: &[u32], package: &str) -> Option<AppId> {
        users.iter().find_map(|user| {
            let path = self.root.join(user.to_string()).join(package);
            let meta = std::fs::metadata(path).ok()?;
            let app_id = AppId::from_uid(meta.uid());
            (app_id.get() != 0).then_some(app_id)
        })
    }
}
