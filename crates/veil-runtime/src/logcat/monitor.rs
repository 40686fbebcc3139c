//! Reacting to process-start events in the system log.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use nix::sys::signal::Signal;
use nix::unistd::Pid;
use veil_common::constants::{AID_ROOT, AID_SYSTEM, APP_ZYGOTE_CONTEXT};
use veil_core::namespace::MountNs;
use veil_core::procfs::ProcessTable;

use super::codec::{EventValue, LogBuffer, LogRecord, parse_event, parse_text};
use crate::denylist::DenylistStore;
use crate::discovery;
use crate::monitor::{MonitorMessage, MonitorPoster};
use crate::remediation::{self, Remediator};

/// `am_proc_start`: `[user, pid, uid, process name, type, component]`.
pub const TAG_PROC_START: u32 = 30_014;

/// `boot_progress_ams_ready`: the activity manager (re)started.
pub const TAG_AMS_READY: u32 = 3040;

const ZYGOTE_TAG: &str = "Zygote";
const CHILD_ZYGOTE_PREFIX: &str = "Child zygote";
const APP_ZYGOTE_INIT_TAG: &str = "AppZygoteInit";

/// How long a worker waits for a new process to leave its parent's
/// namespace.
#[derive(Debug, Clone, Copy)]
pub struct SeparationPolicy {
    /// Delay between polls.
    pub interval: Duration,
    /// Number of polls before giving up.
    pub attempts: u32,
}

/// How a separation wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Separation {
    /// The process now has its own namespace.
    Separated,
    /// The process exited.
    Vanished,
    /// The pid now belongs to a different process.
    Recycled,
    /// The namespace never changed.
    TimedOut,
}

/// Polls until `pid` leaves `parent_ns`.
///
/// `uid` is the owner the process is expected to end up with; while it is
/// still specializing it runs as root. Seeing root again after the expected
/// owner, or any other owner, means the pid was reused.
pub fn wait_for_separation(
    procs: &dyn ProcessTable,
    pid: Pid,
    uid: u32,
    parent_ns: MountNs,
    policy: SeparationPolicy,
) -> Separation {
    let mut specialized = false;
    for _ in 0..policy.attempts {
        let Ok(owner) = procs.uid(pid) else {
            return Separation::Vanished;
        };
        match owner {
            AID_ROOT if specialized => return Separation::Recycled,
            AID_ROOT => {}
            owner if owner == uid => specialized = true,
            _ => return Separation::Recycled,
        }
        match procs.mount_ns(pid) {
            Ok(ns) if ns != parent_ns => return Separation::Separated,
            Ok(_) => {}
            Err(_) => return Separation::Vanished,
        }
        std::thread::sleep(policy.interval);
    }
    Separation::TimedOut
}

/// Everything the log monitor needs from the daemon.
#[derive(Clone)]
pub struct LogContext {
    /// The shared denylist.
    pub store: Arc<DenylistStore>,
    /// Process table.
    pub procs: Arc<dyn ProcessTable>,
    /// Mount remediation.
    pub remediator: Arc<dyn Remediator>,
    /// Inject into targets instead of reverting them.
    pub allowlist_mode: bool,
    /// Worker polling bounds.
    pub separation: SeparationPolicy,
    /// The zygote monitor, when it runs alongside.
    pub zygote_monitor: Option<MonitorPoster>,
}

/// What handling one record started.
#[derive(Debug)]
pub enum Reaction {
    /// Nothing to do.
    Ignored,
    /// Supervisors were re-discovered.
    Rediscovered,
    /// The next `AppZygoteInit` record names an app zygote.
    AwaitingAppZygote,
    /// A worker was spawned for a candidate.
    Worker(JoinHandle<bool>),
}

/// Log-record handler state.
pub struct LogMonitor {
    ctx: LogContext,
    supervisors: HashMap<Pid, MountNs>,
    app_zygote_pending: bool,
}

impl LogMonitor {
    /// Creates a handler and snapshots the current supervisors.
    pub fn new(ctx: LogContext) -> Self {
        let mut monitor = Self {
            ctx,
            supervisors: HashMap::new(),
            app_zygote_pending: false,
        };
        monitor.rediscover();
        monitor
    }

    fn rediscover(&mut self) {
        match discovery::supervisor_namespaces(&*self.ctx.procs) {
            Ok(found) => {
                tracing::debug!(zygotes = found.len(), "logcat: supervisors refreshed");
                self.supervisors = found;
            }
            Err(e) => tracing::warn!(error = %e, "logcat: cannot scan supervisors"),
        }
    }

    /// Handles one record.
    pub fn handle(&mut self, record: &LogRecord) -> Reaction {
        match record.buffer {
            LogBuffer::Events => self.handle_event(record),
            LogBuffer::Main => self.handle_text(record),
            _ => Reaction::Ignored,
        }
    }

    fn handle_event(&mut self, record: &LogRecord) -> Reaction {
        if record.uid != Some(AID_SYSTEM) {
            return Reaction::Ignored;
        }
        let Some(event) = parse_event(&record.payload) else {
            return Reaction::Ignored;
        };
        match event.tag {
            TAG_AMS_READY => {
                tracing::info!("logcat: activity manager restarted");
                self.rediscover();
                if let Some(poster) = &self.ctx.zygote_monitor {
                    let _ = poster.post(MonitorMessage::Rescan);
                }
                Reaction::Rediscovered
            }
            TAG_PROC_START => {
                let pid = event.field(1).and_then(EventValue::as_i64);
                let uid = event.field(2).and_then(EventValue::as_i64);
                let name = event.field(3).and_then(EventValue::as_str);
                match (pid, uid, name) {
                    (Some(pid), Some(uid), Some(name)) => {
                        match (i32::try_from(pid), u32::try_from(uid)) {
                            (Ok(pid), Ok(uid)) => self.on_proc_start(Pid::from_raw(pid), uid, name),
                            _ => Reaction::Ignored,
                        }
                    }
                    _ => Reaction::Ignored,
                }
            }
            _ => Reaction::Ignored,
        }
    }

    fn on_proc_start(&mut self, pid: Pid, uid: u32, name: &str) -> Reaction {
        if !self.ctx.store.is_target(uid, name) {
            return Reaction::Ignored;
        }
        let Ok(ppid) = self.ctx.procs.ppid(pid) else {
            return Reaction::Ignored;
        };
        if !self.supervisors.contains_key(&ppid) {
            // The zygote may have restarted since the last snapshot.
            self.rediscover();
        }
        let Some(&parent_ns) = self.supervisors.get(&ppid) else {
            tracing::warn!(pid = pid.as_raw(), ppid = ppid.as_raw(), "logcat: parent is not a zygote, skip");
            return Reaction::Ignored;
        };
        tracing::debug!(pid = pid.as_raw(), uid, proc = name, "logcat: target started");

        let ctx = self.ctx.clone();
        let spawned = std::thread::Builder::new()
            .name("veil-logcat-worker".to_owned())
            .spawn(move || {
                let outcome = wait_for_separation(&*ctx.procs, pid, uid, parent_ns, ctx.separation);
                if outcome != Separation::Separated {
                    tracing::debug!(pid = pid.as_raw(), ?outcome, "logcat: candidate abandoned");
                    return false;
                }
                match remediation::remediate(&*ctx.remediator, pid, ctx.allowlist_mode) {
                    Ok(()) => true,
                    Err(e) => {
                        tracing::warn!(pid = pid.as_raw(), error = %e, "logcat: remediation failed");
                        false
                    }
                }
            });
        match spawned {
            Ok(worker) => Reaction::Worker(worker),
            Err(e) => {
                tracing::warn!(error = %e, "logcat: cannot spawn worker");
                Reaction::Ignored
            }
        }
    }

    fn handle_text(&mut self, record: &LogRecord) -> Reaction {
        let Some(line) = parse_text(&record.payload) else {
            return Reaction::Ignored;
        };
        if line.tag == ZYGOTE_TAG {
            if record.uid == Some(AID_ROOT) && line.message.starts_with(CHILD_ZYGOTE_PREFIX) {
                self.app_zygote_pending = true;
                return Reaction::AwaitingAppZygote;
            }
            return Reaction::Ignored;
        }
        if line.tag != APP_ZYGOTE_INIT_TAG || !self.app_zygote_pending {
            return Reaction::Ignored;
        }
        self.app_zygote_pending = false;
        self.on_app_zygote(Pid::from_raw(record.pid))
    }

    fn on_app_zygote(&self, pid: Pid) -> Reaction {
        let procs = &*self.ctx.procs;
        if !procs
            .security_label(pid)
            .is_ok_and(|label| label.contains(APP_ZYGOTE_CONTEXT))
        {
            return Reaction::Ignored;
        }
        let (Ok(cmdline), Ok(uid)) = (procs.cmdline(pid), procs.uid(pid)) else {
            return Reaction::Ignored;
        };
        if !self.ctx.store.is_target(uid, &cmdline) {
            return Reaction::Ignored;
        }
        tracing::debug!(pid = pid.as_raw(), uid, proc = %cmdline, "logcat: app zygote target");
        if let Err(e) = procs.signal(pid, Signal::SIGSTOP) {
            tracing::debug!(pid = pid.as_raw(), error = %e, "logcat: cannot stop app zygote");
            return Reaction::Ignored;
        }

        let ctx = self.ctx.clone();
        let spawned = std::thread::Builder::new()
            .name("veil-logcat-worker".to_owned())
            .spawn(move || {
                let done = remediation::remediate(&*ctx.remediator, pid, ctx.allowlist_mode)
                    .inspect_err(|e| {
                        tracing::warn!(pid = pid.as_raw(), error = %e, "logcat: remediation failed");
                    })
                    .is_ok();
                if let Err(e) = ctx.procs.signal(pid, Signal::SIGCONT) {
                    tracing::debug!(pid = pid.as_raw(), error = %e, "logcat: cannot resume app zygote");
                }
                done
            });
        match spawned {
            Ok(worker) => Reaction::Worker(worker),
            Err(e) => {
                tracing::warn!(error = %e, "logcat: cannot spawn worker");
                if let Err(e) = procs.signal(pid, Signal::SIGCONT) {
                    tracing::debug!(pid = pid.as_raw(), error = %e, "logcat: cannot resume app zygote");
                }
                Reaction::Ignored
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use veil_common::constants::ISOLATED_MAGIC;

    use super::*;
    use crate::denylist::SqliteDb;
    use crate::logcat::codec::tests::{event, int, record, string, text};
    use crate::logcat::codec::read_record;
    use crate::testing::{FakePackages, FakeProcesses, RecordingRemediator};

    const ZYGOTE: i32 = 500;
    const APP: i32 = 4242;

    struct Harness {
        procs: Arc<FakeProcesses>,
        remediator: Arc<RecordingRemediator>,
        monitor: LogMonitor,
    }

    fn harness() -> Harness {
        let procs = Arc::new(FakeProcesses::default());
        procs.spawn(1, 0, 0, "/init");
        procs.spawn(ZYGOTE, 1, 0, "zygote64");
        procs.set_label(ZYGOTE, "u:r:zygote:s0");
        procs.set_ns(ZYGOTE, 2);

        let packages = Arc::new(FakePackages::default());
        packages.install(0, "com.example.app", 10_123);
        let store = Arc::new(DenylistStore::new(
            Arc::new(SqliteDb::open_in_memory().expect("db")),
            packages,
            procs.clone(),
        ));
        store.add("com.example.app", "").expect("add");
        store.add(ISOLATED_MAGIC, "com.example.app:iso").expect("add");

        let remediator = Arc::new(RecordingRemediator::default());
        let monitor = LogMonitor::new(LogContext {
            store,
            procs: procs.clone(),
            remediator: remediator.clone(),
            allowlist_mode: false,
            separation: SeparationPolicy {
                interval: Duration::from_millis(1),
                attempts: 20,
            },
            zygote_monitor: None,
        });
        Harness {
            procs,
            remediator,
            monitor,
        }
    }

    fn decode(bytes: &[u8]) -> LogRecord {
        read_record(&mut &bytes[..]).unwrap().unwrap()
    }

    fn proc_start(uid_writer: u32, pid: i32, uid: i32, name: &str) -> LogRecord {
        decode(&record(
            2,
            600,
            uid_writer,
            &event(TAG_PROC_START, &[int(0), int(pid), int(uid), string(name), string("activity")]),
        ))
    }

    /// Joins the worker a reaction spawned, if any.
    fn finished(reaction: Reaction) -> Option<bool> {
        let Reaction::Worker(worker) = reaction else {
            return None;
        };
        Some(worker.join().expect("worker"))
    }

    #[test]
    fn separated_target_is_remediated() {
        let mut h = harness();
        h.procs.spawn(APP, ZYGOTE, 10_123, "com.example.app");
        h.procs.set_ns(APP, 9);

        let reaction = h.monitor.handle(&proc_start(1000, APP, 10_123, "com.example.app"));
        assert_eq!(finished(reaction), Some(true));
        assert_eq!(h.remediator.calls(), vec![("revert", Pid::from_raw(APP))]);
    }

    #[test]
    fn never_separating_target_is_not_remediated() {
        let mut h = harness();
        h.procs.spawn(APP, ZYGOTE, 10_123, "com.example.app");
        h.procs.set_ns(APP, 2);

        let reaction = h.monitor.handle(&proc_start(1000, APP, 10_123, "com.example.app"));
        assert_eq!(finished(reaction), Some(false));
        assert!(h.remediator.calls().is_empty());
    }

    #[test]
    fn events_from_untrusted_writers_are_ignored() {
        let mut h = harness();
        h.procs.spawn(APP, ZYGOTE, 10_123, "com.example.app");
        h.procs.set_ns(APP, 9);
        let reaction = h.monitor.handle(&proc_start(10_500, APP, 10_123, "com.example.app"));
        assert!(matches!(reaction, Reaction::Ignored));
    }

    #[test]
    fn non_targets_and_orphans_are_ignored() {
        let mut h = harness();
        h.procs.spawn(APP, ZYGOTE, 10_200, "org.other.app");
        assert!(matches!(
            h.monitor.handle(&proc_start(1000, APP, 10_200, "org.other.app")),
            Reaction::Ignored
        ));

        h.procs.spawn(APP + 1, 1, 10_123, "com.example.app");
        assert!(matches!(
            h.monitor.handle(&proc_start(1000, APP + 1, 10_123, "com.example.app")),
            Reaction::Ignored
        ));
    }

    #[test]
    fn vanished_or_recycled_candidates_are_abandoned() {
        let h = harness();
        let policy = SeparationPolicy {
            interval: Duration::from_millis(1),
            attempts: 5,
        };
        let parent = MountNs { dev: 4, ino: 2 };
        let pid = Pid::from_raw(APP);

        assert_eq!(
            wait_for_separation(&*h.procs, pid, 10_123, parent, policy),
            Separation::Vanished
        );

        h.procs.spawn(APP, ZYGOTE, 10_555, "other");
        h.procs.set_ns(APP, 9);
        assert_eq!(
            wait_for_separation(&*h.procs, pid, 10_123, parent, policy),
            Separation::Recycled
        );

        h.procs.set_uid(APP, 0);
        h.procs.set_ns(APP, 2);
        assert_eq!(
            wait_for_separation(&*h.procs, pid, 10_123, parent, policy),
            Separation::TimedOut
        );
    }

    #[test]
    fn ams_ready_refreshes_supervisors() {
        let mut h = harness();
        h.procs.exit(ZYGOTE);
        h.procs.spawn(501, 1, 0, "zygote64");
        h.procs.set_label(501, "u:r:zygote:s0");
        h.procs.set_ns(501, 3);

        let ready = decode(&record(2, 600, 1000, &event(TAG_AMS_READY, &[int(1)])));
        assert!(matches!(h.monitor.handle(&ready), Reaction::Rediscovered));

        h.procs.spawn(APP, 501, 10_123, "com.example.app");
        h.procs.set_ns(APP, 9);
        assert_eq!(
            finished(h.monitor.handle(&proc_start(1000, APP, 10_123, "com.example.app"))),
            Some(true)
        );
    }

    #[test]
    fn app_zygote_host_is_stopped_remediated_and_resumed() {
        let mut h = harness();
        h.procs.spawn(APP, ZYGOTE, 90_010, "com.example.app:iso_zygote");
        h.procs.set_label(APP, "u:r:app_zygote:s0");

        let init = decode(&record(0, APP, 90_010, &text("AppZygoteInit", "Beginning preload")));
        assert!(matches!(h.monitor.handle(&init), Reaction::Ignored));

        let marker = decode(&record(0, ZYGOTE, 0, &text("Zygote", "Child zygote process started")));
        assert!(matches!(h.monitor.handle(&marker), Reaction::AwaitingAppZygote));
        assert_eq!(finished(h.monitor.handle(&init)), Some(true));

        assert_eq!(h.remediator.calls(), vec![("revert", Pid::from_raw(APP))]);
        assert_eq!(
            h.procs.signals(),
            vec![
                (Pid::from_raw(APP), Signal::SIGSTOP),
                (Pid::from_raw(APP), Signal::SIGCONT),
            ]
        );

        // The marker is consumed by the first AppZygoteInit line.
        assert!(matches!(h.monitor.handle(&init), Reaction::Ignored));
    }

    #[test]
    fn marker_requires_root_writer() {
        let mut h = harness();
        let marker = decode(&record(0, ZYGOTE, 10_123, &text("Zygote", "Child zygote process")));
        assert!(matches!(h.monitor.handle(&marker), Reaction::Ignored));
    }
}
