//! Filesystem watches driving supervisor discovery.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use nix::sys::inotify::{AddWatchFlags, InitFlags, Inotify, WatchDescriptor};
use veil_common::error::{Result, VeilError};

pub use nix::sys::inotify::AddWatchFlags as WatchMask;

/// One filesystem change, resolved to the watched path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsEvent {
    /// Path that was registered with the watch.
    pub watched: PathBuf,
    /// Name of the affected entry inside a watched directory.
    pub name: Option<String>,
    /// Kernel event mask.
    pub mask: AddWatchFlags,
}

/// An inotify instance that remembers which path each watch refers to.
#[derive(Debug)]
pub struct FsWatcher {
    inotify: Inotify,
    watches: HashMap<WatchDescriptor, PathBuf>,
}

impl FsWatcher {
    /// Creates an empty watcher.
    ///
    /// # Errors
    ///
    /// Returns an error if `inotify_init1(2)` fails.
    pub fn new() -> Result<Self> {
        let inotify = Inotify::init(InitFlags::IN_CLOEXEC).map_err(|e| VeilError::Io {
            path: PathBuf::from("inotify"),
            source: std::io::Error::from(e),
        })?;
        Ok(Self {
            inotify,
            watches: HashMap::new(),
        })
    }

    /// Watches `path` for the events in `mask`.
    ///
    /// # Errors
    ///
    /// Returns an error if the watch cannot be added (usually a missing path).
    pub fn add(&mut self, path: &Path, mask: AddWatchFlags) -> Result<()> {
        let wd = self
            .inotify
            .add_watch(path, mask)
            .map_err(|e| VeilError::Io {
                path: path.to_path_buf(),
                source: std::io::Error::from(e),
            })?;
        tracing::debug!(path = %path.display(), ?mask, "watch added");
        let _ = self.watches.insert(wd, path.to_path_buf());
        Ok(())
    }

    /// Returns the number of registered watches.
    #[must_use]
    pub fn len(&self) -> usize {
        self.watches.len()
    }

    /// Returns whether no watch is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.watches.is_empty()
    }

    /// Blocks until at least one event is available and returns the batch.
    ///
    /// # Errors
    ///
    /// Returns an error if reading the inotify descriptor fails; `EINTR`
    /// is reported as an empty batch.
    pub fn read(&mut self) -> Result<Vec<FsEvent>> {
        let events = match self.inotify.read_events() {
            Ok(events) => events,
            Err(nix::errno::Errno::EINTR) => return Ok(Vec::new()),
            Err(e) => {
                return Err(VeilError::Io {
                    path: PathBuf::from("inotify"),
                    source: std::io::Error::from(e),
                });
            }
        };
        Ok(events
            .into_iter()
            .filter_map(|event| {
                let watched = self.watches.get(&event.wd)?.clone();
                Some(FsEvent {
                    watched,
                    name: event.name.map(|n| n.to_string_lossy().into_owned()),
                    mask: event.mask,
                })
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reports_creation_inside_watched_directory() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut watcher = FsWatcher::new().expect("inotify");
        watcher.add(dir.path(), AddWatchFlags::IN_CREATE).expect("watch");
        assert_eq!(watcher.len(), 1);

        std::fs::create_dir(dir.path().join("10")).expect("mkdir");

        let events = watcher.read().expect("read");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].watched, dir.path());
        assert_eq!(events[0].name.as_deref(), Some("10"));
        assert!(events[0].mask.contains(AddWatchFlags::IN_CREATE));
    }

    #[test]
    fn missing_path_cannot_be_watched() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut watcher = FsWatcher::new().expect("inotify");
        assert!(watcher.add(&dir.path().join("gone"), AddWatchFlags::IN_ATTRIB).is_err());
        assert!(watcher.is_empty());
    }
}
