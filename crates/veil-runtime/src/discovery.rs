//! Finding the supervisors to trace and noticing when to look again.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, mpsc};
use std::thread::JoinHandle;
use std::time::Duration;

use nix::unistd::Pid;
use veil_common::config::VeilConfig;
use veil_common::constants::{AID_ROOT, AID_SYSTEM, PACKAGES_XML, SUPERVISOR_NAMES, ZYGOTE_CONTEXT};
use veil_common::error::Result;
use veil_core::namespace::MountNs;
use veil_core::procfs::{ProcessTable, crawl};
use veil_core::wake::ThreadWaker;
use veil_core::watch::{FsEvent, FsWatcher, WatchMask};

const INIT: Pid = Pid::from_raw(1);

/// Result of one pass over the process table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SupervisorScan {
    /// Zygotes found, in pid order.
    pub zygotes: Vec<Pid>,
    /// Whether the system server is running.
    pub system_server: bool,
}

/// Returns whether `pid` is one of the spawning supervisors.
pub fn is_zygote(procs: &dyn ProcessTable, pid: Pid) -> bool {
    let named = procs
        .cmdline(pid)
        .is_ok_and(|cmd| SUPERVISOR_NAMES.contains(&cmd.as_str()));
    named
        && procs
            .security_label(pid)
            .is_ok_and(|label| label.contains(ZYGOTE_CONTEXT))
        && procs.ppid(pid).is_ok_and(|ppid| ppid == INIT)
        && procs.is_process(pid, AID_ROOT)
}

/// Classifies every live process.
///
/// # Errors
///
/// Returns an error if the process list cannot be read.
pub fn scan(procs: &dyn ProcessTable) -> Result<SupervisorScan> {
    let mut result = SupervisorScan::default();
    crawl(procs, |pid| {
        if is_zygote(procs, pid) {
            result.zygotes.push(pid);
        } else if procs.is_process(pid, AID_SYSTEM)
            && procs.ppid(pid).is_ok_and(|ppid| is_zygote(procs, ppid))
        {
            result.system_server = true;
        }
        true
    })?;
    result.zygotes.sort_unstable();
    Ok(result)
}

/// Snapshots the mount namespace of every zygote that has already left
/// init's namespace.
///
/// # Errors
///
/// Returns an error if the process list cannot be read.
pub fn supervisor_namespaces(procs: &dyn ProcessTable) -> Result<HashMap<Pid, MountNs>> {
    let init_ns = procs.mount_ns(INIT).ok();
    let found = scan(procs)?;
    Ok(found
        .zygotes
        .into_iter()
        .filter_map(|pid| {
            let ns = procs.mount_ns(pid).ok()?;
            (Some(ns) != init_ns).then_some((pid, ns))
        })
        .collect())
}

/// Filesystem locations that drive discovery.
#[derive(Debug, Clone)]
pub struct DiscoveryPaths {
    /// Per-user application data root.
    pub app_data_dir: PathBuf,
    /// Directory holding the package registry.
    pub system_data_dir: PathBuf,
    /// Base path of the supervisor executables.
    pub app_process: PathBuf,
}

impl DiscoveryPaths {
    /// Takes the paths from the daemon configuration.
    #[must_use]
    pub fn from_config(config: &VeilConfig) -> Self {
        Self {
            app_data_dir: config.app_data_dir.clone(),
            system_data_dir: config.system_data_dir.clone(),
            app_process: config.app_process.clone(),
        }
    }

    fn with_suffix(&self, suffix: &str) -> PathBuf {
        let mut path = self.app_process.clone().into_os_string();
        path.push(suffix);
        PathBuf::from(path)
    }

    /// Returns the supervisor executables present on this device.
    #[must_use]
    pub fn supervisor_executables(&self) -> Vec<PathBuf> {
        let split: Vec<PathBuf> = ["32", "64"]
            .into_iter()
            .map(|suffix| self.with_suffix(suffix))
            .filter(|path| path.exists())
            .collect();
        if split.is_empty() {
            vec![self.app_process.clone()]
        } else {
            split
        }
    }

    /// Returns how many zygotes this device runs: two when both the 32-bit
    /// and 64-bit executables exist, otherwise one.
    #[must_use]
    pub fn expected_zygotes(&self) -> usize {
        if self.with_suffix("32").exists() && self.with_suffix("64").exists() {
            2
        } else {
            1
        }
    }
}

/// What a filesystem change means for discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryEvent {
    /// A new user profile directory appeared and is now watched.
    UserAdded(PathBuf),
    /// Packages were installed, removed or moved.
    PackagesChanged,
    /// Supervisors may have (re)started.
    CheckSupervisors,
}

/// Maps a raw filesystem event to its meaning.
#[must_use]
pub fn classify(paths: &DiscoveryPaths, event: &FsEvent) -> DiscoveryEvent {
    if event.watched == paths.app_data_dir && event.mask.contains(WatchMask::IN_CREATE) {
        if let Some(name) = &event.name {
            return DiscoveryEvent::UserAdded(paths.app_data_dir.join(name));
        }
    }
    let registry_written = event.watched == paths.system_data_dir
        && event.name.as_deref() == Some(PACKAGES_XML);
    if registry_written || event.mask.contains(WatchMask::IN_ATTRIB) {
        return DiscoveryEvent::PackagesChanged;
    }
    DiscoveryEvent::CheckSupervisors
}

/// Registers every discovery watch.
///
/// # Errors
///
/// Returns an error if the inotify instance cannot be created. Individual
/// watches that cannot be added are logged and skipped.
pub fn setup_watches(paths: &DiscoveryPaths) -> Result<FsWatcher> {
    let mut watcher = FsWatcher::new()?;
    let mut watch = |path: &Path, mask: WatchMask| {
        if let Err(e) = watcher.add(path, mask) {
            tracing::warn!(path = %path.display(), error = %e, "cannot watch");
        }
    };

    watch(&paths.system_data_dir, WatchMask::IN_CLOSE_WRITE);
    watch(&paths.app_data_dir, WatchMask::IN_CREATE);
    if let Ok(users) = std::fs::read_dir(&paths.app_data_dir) {
        for user in users.filter_map(std::result::Result::ok) {
            watch(&user.path(), WatchMask::IN_ATTRIB);
        }
    }
    for exe in paths.supervisor_executables() {
        watch(&exe, WatchMask::IN_ACCESS);
    }
    Ok(watcher)
}

/// Thread forwarding filesystem events, see [`spawn_watch_bridge`].
#[derive(Debug)]
pub struct WatchBridge {
    stop: Arc<AtomicBool>,
    waker: ThreadWaker,
    thread: JoinHandle<()>,
}

impl WatchBridge {
    /// Interrupts the bridge's read and waits for it to exit.
    ///
    /// The watcher is closed with the thread. The wake handler must be
    /// installed.
    pub fn stop(self) {
        self.stop.store(true, Ordering::Release);
        while !self.thread.is_finished() {
            self.waker.wake();
            std::thread::sleep(Duration::from_millis(50));
        }
        if self.thread.join().is_err() {
            tracing::error!("watch bridge panicked");
        }
    }
}

/// Spawns the thread that reads filesystem events and forwards their
/// meaning to `sink`.
///
/// New user directories are watched by this thread before being reported.
/// The thread ends at the first event `sink` refuses, when reading fails, or
/// when [`WatchBridge::stop`] is called.
pub fn spawn_watch_bridge(
    mut watcher: FsWatcher,
    paths: DiscoveryPaths,
    sink: impl Fn(DiscoveryEvent) -> bool + Send + 'static,
) -> std::io::Result<WatchBridge> {
    let stop = Arc::new(AtomicBool::new(false));
    let thread_stop = Arc::clone(&stop);
    let (ready_tx, ready_rx) = mpsc::channel();
    let thread = std::thread::Builder::new()
        .name("veil-watch".to_owned())
        .spawn(move || {
            let _ = ready_tx.send(ThreadWaker::current());
            while !thread_stop.load(Ordering::Acquire) {
                let events = match watcher.read() {
                    Ok(events) => events,
                    Err(e) => {
                        tracing::warn!(error = %e, "watch bridge stopped");
                        return;
                    }
                };
                for event in &events {
                    let meaning = classify(&paths, event);
                    if let DiscoveryEvent::UserAdded(dir) = &meaning {
                        if let Err(e) = watcher.add(dir, WatchMask::IN_ATTRIB) {
                            tracing::debug!(path = %dir.display(), error = %e, "cannot watch new user");
                        }
                    }
                    if !sink(meaning) {
                        return;
                    }
                }
            }
        })?;
    let waker = ready_rx
        .recv()
        .map_err(|_| std::io::Error::other("watch bridge exited during startup"))?;
    Ok(WatchBridge { stop, waker, thread })
}
