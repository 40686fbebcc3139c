//! Syscall-level zygote monitor.
//!
//! One dedicated thread owns every trace primitive. It blocks waiting for
//! any tracee; messages for it are queued on a channel and followed by a
//! wake signal that interrupts the wait. A timer thread and an inotify
//! thread feed it discovery triggers.

pub mod decision;
pub mod pid_table;
mod zygote;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Sender};
use std::thread::JoinHandle;
use std::time::Duration;

use veil_common::error::{Result, VeilError};
use veil_core::procfs::ProcessTable;
use veil_core::ptrace::PtraceTracer;
use veil_core::wake::{ThreadWaker, install_wake_handler};

use crate::denylist::DenylistStore;
use crate::discovery::{self, DiscoveryEvent, DiscoveryPaths, WatchBridge};
use crate::remediation::Remediator;

/// Requests handled by the monitor thread between waits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorMessage {
    /// Re-resolve the denylist and look for zygotes.
    Rescan,
    /// Periodic zygote check.
    Tick,
    /// A discovery-relevant filesystem change.
    Watch(DiscoveryEvent),
    /// Detach everything and exit.
    Terminate,
}

/// Flags shared between the monitor thread and its helpers.
#[derive(Debug)]
pub struct MonitorShared {
    /// Whether the periodic zygote check should fire.
    pub timer_active: AtomicBool,
    /// Cleared once the monitor is stopping or stopped.
    pub running: AtomicBool,
    /// Messages queued but not yet taken by the monitor thread.
    pub pending: AtomicUsize,
}

impl Default for MonitorShared {
    fn default() -> Self {
        Self {
            timer_active: AtomicBool::new(true),
            running: AtomicBool::new(true),
            pending: AtomicUsize::new(0),
        }
    }
}

/// Everything the monitor thread needs from the daemon.
#[derive(Clone)]
pub struct MonitorContext {
    /// The shared denylist.
    pub store: Arc<DenylistStore>,
    /// Process table used for discovery and decisions.
    pub procs: Arc<dyn ProcessTable>,
    /// Mount remediation.
    pub remediator: Arc<dyn Remediator>,
    /// Inject into targets instead of reverting them.
    pub allowlist_mode: bool,
    /// Discovery locations.
    pub paths: DiscoveryPaths,
    /// Maximum number of tracked pids.
    pub pid_capacity: usize,
}

/// Queues messages for the monitor thread and wakes it.
#[derive(Debug, Clone)]
pub struct MonitorPoster {
    tx: Sender<MonitorMessage>,
    waker: ThreadWaker,
    shared: Arc<MonitorShared>,
}

impl MonitorPoster {
    /// Delivers `message`. Returns `false` once the monitor is gone.
    pub fn post(&self, message: MonitorMessage) -> bool {
        if !self.shared.running.load(Ordering::Acquire) {
            return false;
        }
        let _ = self.shared.pending.fetch_add(1, Ordering::AcqRel);
        if self.tx.send(message).is_err() {
            let _ = self.shared.pending.fetch_sub(1, Ordering::AcqRel);
            return false;
        }
        self.waker.wake();
        true
    }
}

/// Handle to a running zygote monitor.
#[derive(Debug)]
pub struct ZygoteMonitorHandle {
    poster: MonitorPoster,
    thread: JoinHandle<()>,
    bridge: Option<WatchBridge>,
}

impl ZygoteMonitorHandle {
    /// Starts the monitor thread and its discovery helpers.
    ///
    /// # Errors
    ///
    /// Returns an error if the wake handler cannot be installed or a thread
    /// cannot be spawned.
    pub fn spawn(ctx: MonitorContext, discovery_interval: Duration) -> Result<Self> {
        install_wake_handler()?;
        let shared = Arc::new(MonitorShared::default());
        let (tx, rx) = mpsc::channel();
        let (ready_tx, ready_rx) = mpsc::channel();

        let paths = ctx.paths.clone();
        let thread_shared = Arc::clone(&shared);
        let thread = std::thread::Builder::new()
            .name("veil-zygote".to_owned())
            .spawn(move || {
                let _ = ready_tx.send(ThreadWaker::current());
                let mut monitor = zygote::ZygoteMonitor::new(PtraceTracer::new(), ctx, thread_shared);
                monitor.run(&rx);
            })
            .map_err(|e| spawn_error("veil-zygote", &e))?;
        let waker = ready_rx.recv().map_err(|_| VeilError::Config {
            message: "zygote monitor exited during startup".to_owned(),
        })?;

        let mut handle = Self {
            poster: MonitorPoster { tx, waker, shared },
            thread,
            bridge: None,
        };
        if let Err(e) = spawn_timer(handle.poster.clone(), discovery_interval) {
            handle.stop();
            return Err(e);
        }
        match discovery::setup_watches(&paths) {
            Ok(watcher) => {
                let sink = handle.poster.clone();
                match discovery::spawn_watch_bridge(watcher, paths, move |event| {
                    sink.post(MonitorMessage::Watch(event))
                }) {
                    Ok(bridge) => handle.bridge = Some(bridge),
                    Err(e) => {
                        handle.stop();
                        return Err(spawn_error("veil-watch", &e));
                    }
                }
            }
            Err(e) => tracing::warn!(error = %e, "filesystem watches unavailable"),
        }
        Ok(handle)
    }

    /// Returns a poster for other components.
    #[must_use]
    pub fn poster(&self) -> MonitorPoster {
        self.poster.clone()
    }

    /// Returns whether the monitor thread has exited.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }

    /// Stops the watch bridge, asks the monitor to detach everything, then
    /// waits for it.
    pub fn stop(self) {
        if let Some(bridge) = self.bridge {
            bridge.stop();
        }
        let _ = self.poster.shared.pending.fetch_add(1, Ordering::AcqRel);
        let _ = self.poster.tx.send(MonitorMessage::Terminate);
        // The wake can land between the loop's message check and its wait.
        while !self.thread.is_finished() {
            if self.poster.shared.running.load(Ordering::Acquire) {
                self.poster.waker.wake();
            }
            std::thread::sleep(Duration::from_millis(50));
        }
        if self.thread.join().is_err() {
            tracing::error!("zygote monitor panicked");
        }
        self.poster.shared.running.store(false, Ordering::Release);
    }
}

fn spawn_error(name: &str, e: &std::io::Error) -> VeilError {
    VeilError::Config {
        message: format!("cannot spawn {name} thread: {e}"),
    }
}

/// Posts [`MonitorMessage::Tick`] every `interval` while the zygote set is
/// incomplete.
///
/// A wake that lands before the monitor enters its wait is lost, so each
/// round also re-wakes the monitor while messages are still queued.
fn spawn_timer(poster: MonitorPoster, interval: Duration) -> Result<()> {
    let _timer = std::thread::Builder::new()
        .name("veil-timer".to_owned())
        .spawn(move || {
            while poster.shared.running.load(Ordering::Acquire) {
                std::thread::sleep(interval);
                if poster.shared.pending.load(Ordering::Acquire) > 0 {
                    poster.waker.wake();
                }
                if poster.shared.timer_active.load(Ordering::Acquire)
                    && !poster.post(MonitorMessage::Tick)
                {
                    break;
                }
            }
        })
        .map_err(|e| spawn_error("veil-timer", &e))?;
    Ok(())
}
