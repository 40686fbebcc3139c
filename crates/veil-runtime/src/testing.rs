//! In-memory stand-ins for the host used by unit tests.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use nix::sys::signal::Signal;
use nix::unistd::Pid;
use veil_common::error::{Result, VeilError};
use veil_common::types::{AppId, DenylistEntry};
use veil_core::namespace::MountNs;
use veil_core::procfs::ProcessTable;
use veil_core::ptrace::{Options, Tracer, WaitOutcome};

use crate::denylist::{DenylistDb, PackageResolver};
use crate::remediation::Remediator;

fn gone(pid: Pid) -> VeilError {
    VeilError::Io {
        path: format!("/proc/{pid}").into(),
        source: std::io::Error::from(std::io::ErrorKind::NotFound),
    }
}

#[derive(Debug, Clone)]
pub struct FakeProc {
    pub ppid: Pid,
    pub uid: u32,
    pub cmdline: String,
    pub tgid: Pid,
    pub ns: MountNs,
    pub label: String,
}

/// Process table whose contents the test controls.
#[derive(Debug, Default)]
pub struct FakeProcesses {
    procs: Mutex<BTreeMap<Pid, FakeProc>>,
    signals: Mutex<Vec<(Pid, Signal)>>,
    unkillable: Mutex<BTreeSet<Pid>>,
}

pub const INIT_NS: MountNs = MountNs { dev: 4, ino: 1 };

impl FakeProcesses {
    pub fn spawn(&self, pid: i32, ppid: i32, uid: u32, cmdline: &str) {
        let pid = Pid::from_raw(pid);
        let _ = self.procs.lock().unwrap().insert(
            pid,
            FakeProc {
                ppid: Pid::from_raw(ppid),
                uid,
                cmdline: cmdline.to_owned(),
                tgid: pid,
                ns: INIT_NS,
                label: "u:r:untrusted_app:s0".to_owned(),
            },
        );
    }

    pub fn spawn_thread(&self, tid: i32, tgid: i32) {
        let mut procs = self.procs.lock().unwrap();
        let mut thread = procs[&Pid::from_raw(tgid)].clone();
        thread.tgid = Pid::from_raw(tgid);
        let _ = procs.insert(Pid::from_raw(tid), thread);
    }

    pub fn update(&self, pid: i32, f: impl FnOnce(&mut FakeProc)) {
        f(self.procs.lock().unwrap().get_mut(&Pid::from_raw(pid)).unwrap());
    }

    pub fn set_uid(&self, pid: i32, uid: u32) {
        self.update(pid, |p| p.uid = uid);
    }

    pub fn set_cmdline(&self, pid: i32, cmdline: &str) {
        self.update(pid, |p| cmdline.clone_into(&mut p.cmdline));
    }

    pub fn set_label(&self, pid: i32, label: &str) {
        self.update(pid, |p| label.clone_into(&mut p.label));
    }

    pub fn set_ns(&self, pid: i32, ino: u64) {
        self.update(pid, |p| p.ns = MountNs { dev: 4, ino });
    }

    pub fn exit(&self, pid: i32) {
        let _ = self.procs.lock().unwrap().remove(&Pid::from_raw(pid));
    }

    /// Makes every signal sent to `pid` fail with `EPERM`.
    pub fn protect(&self, pid: i32) {
        let _ = self.unkillable.lock().unwrap().insert(Pid::from_raw(pid));
    }

    pub fn signals(&self) -> Vec<(Pid, Signal)> {
        self.signals.lock().unwrap().clone()
    }

    fn with<T>(&self, pid: Pid, f: impl FnOnce(&FakeProc) -> T) -> Result<T> {
        self.procs.lock().unwrap().get(&pid).map(f).ok_or_else(|| gone(pid))
    }
}

impl ProcessTable for FakeProcesses {
    fn pids(&self) -> Result<Vec<Pid>> {
        Ok(self
            .procs
            .lock()
            .unwrap()
            .iter()
            .filter(|(pid, p)| p.tgid == **pid)
            .map(|(pid, _)| *pid)
            .collect())
    }

    fn uid(&self, pid: Pid) -> Result<u32> {
        self.with(pid, |p| p.uid)
    }

    fn cmdline(&self, pid: Pid) -> Result<String> {
        self.with(pid, |p| p.cmdline.clone())
    }

    fn ppid(&self, pid: Pid) -> Result<Pid> {
        self.with(pid, |p| p.ppid)
    }

    fn tgid(&self, pid: Pid) -> Result<Pid> {
        self.with(pid, |p| p.tgid)
    }

    fn mount_ns(&self, pid: Pid) -> Result<MountNs> {
        self.with(pid, |p| p.ns)
    }

    fn security_label(&self, pid: Pid) -> Result<String> {
        self.with(pid, |p| p.label.clone())
    }

    fn signal(&self, pid: Pid, signal: Signal) -> Result<()> {
        self.with(pid, |_| ())?;
        if self.unkillable.lock().unwrap().contains(&pid) {
            return Err(VeilError::Io {
                path: format!("/proc/{pid}").into(),
                source: std::io::Error::from(std::io::ErrorKind::PermissionDenied),
            });
        }
        self.signals.lock().unwrap().push((pid, signal));
        Ok(())
    }
}

/// Package registry keyed by (user, package).
#[derive(Debug, Default)]
pub struct FakePackages {
    installed: Mutex<BTreeMap<(u32, String), u32>>,
}

impl FakePackages {
    pub fn install(&self, user: u32, package: &str, uid: u32) {
        let _ = self
            .installed
            .lock()
            .unwrap()
            .insert((user, package.to_owned()), uid);
    }

    pub fn uninstall(&self, package: &str) {
        self.installed
            .lock()
            .unwrap()
            .retain(|(_, pkg), _| pkg != package);
    }
}

impl PackageResolver for FakePackages {
    fn users(&self) -> Vec<u32> {
        let users: BTreeSet<u32> = self.installed.lock().unwrap().keys().map(|(u, _)| *u).collect();
        users.into_iter().collect()
    }

    fn app_id(&self, users: &[u32], package: &str) -> Option<AppId> {
        let installed = self.installed.lock().unwrap();
        users
            .iter()
            .find_map(|user| installed.get(&(*user, package.to_owned())))
            .map(|uid| AppId::from_uid(*uid))
    }
}

/// Database that can be told to fail reads or writes.
#[derive(Debug)]
pub struct FailingDb {
    rows: Mutex<Vec<DenylistEntry>>,
    settings: Mutex<BTreeMap<String, i64>>,
    reads_fail: AtomicBool,
    writes_fail: AtomicBool,
}

impl Default for FailingDb {
    fn default() -> Self {
        Self {
            rows: Mutex::default(),
            settings: Mutex::default(),
            reads_fail: AtomicBool::new(true),
            writes_fail: AtomicBool::new(true),
        }
    }
}

impl FailingDb {
    pub fn heal(&self) {
        self.reads_fail.store(false, Ordering::SeqCst);
        self.writes_fail.store(false, Ordering::SeqCst);
    }

    pub fn break_writes(&self) {
        self.writes_fail.store(true, Ordering::SeqCst);
    }

    fn check(flag: &AtomicBool) -> Result<()> {
        if flag.load(Ordering::SeqCst) {
            return Err(VeilError::Persistence {
                message: "disk on fire".to_owned(),
            });
        }
        Ok(())
    }
}

impl DenylistDb for FailingDb {
    fn entries(&self) -> Result<Vec<DenylistEntry>> {
        Self::check(&self.reads_fail)?;
        Ok(self.rows.lock().unwrap().clone())
    }

    fn insert(&self, entry: &DenylistEntry) -> Result<()> {
        Self::check(&self.writes_fail)?;
        self.rows.lock().unwrap().push(entry.clone());
        Ok(())
    }

    fn delete(&self, package: &str, process: Option<&str>) -> Result<()> {
        Self::check(&self.writes_fail)?;
        self.rows
            .lock()
            .unwrap()
            .retain(|e| e.package != package || process.is_some_and(|p| p != e.process));
        Ok(())
    }

    fn setting(&self, key: &str) -> Result<Option<i64>> {
        Self::check(&self.reads_fail)?;
        Ok(self.settings.lock().unwrap().get(key).copied())
    }

    fn set_setting(&self, key: &str, value: i64) -> Result<()> {
        Self::check(&self.writes_fail)?;
        let _ = self.settings.lock().unwrap().insert(key.to_owned(), value);
        Ok(())
    }
}

/// Remediator that records what it was asked to do.
#[derive(Debug, Default)]
pub struct RecordingRemediator {
    calls: Mutex<Vec<(&'static str, Pid)>>,
}

impl RecordingRemediator {
    pub fn calls(&self) -> Vec<(&'static str, Pid)> {
        self.calls.lock().unwrap().clone()
    }
}

impl Remediator for RecordingRemediator {
    fn revert(&self, pid: Pid) -> Result<()> {
        self.calls.lock().unwrap().push(("revert", pid));
        Ok(())
    }

    fn mount_into(&self, pid: Pid) -> Result<()> {
        self.calls.lock().unwrap().push(("mount", pid));
        Ok(())
    }
}

/// One request observed by [`ScriptedTracer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceCall {
    Attach(Pid),
    SetOptions(Pid, Options),
    Cont(Pid, Option<Signal>),
    Syscall(Pid, Option<Signal>),
    Detach(Pid, Option<Signal>),
}

/// Tracer replaying queued wait results and recording every request.
#[derive(Debug, Default)]
pub struct ScriptedTracer {
    pub calls: Vec<TraceCall>,
    pub waits: VecDeque<WaitOutcome>,
    pub event_msgs: VecDeque<i64>,
    pub refuse_attach: BTreeSet<Pid>,
}

impl Tracer for ScriptedTracer {
    fn attach(&mut self, pid: Pid) -> Result<()> {
        if self.refuse_attach.contains(&pid) {
            return Err(VeilError::TraceFailure {
                op: "attach",
                pid: pid.as_raw(),
                errno: nix::errno::Errno::EPERM,
            });
        }
        self.calls.push(TraceCall::Attach(pid));
        Ok(())
    }

    fn set_options(&mut self, pid: Pid, options: Options) -> Result<()> {
        self.calls.push(TraceCall::SetOptions(pid, options));
        Ok(())
    }

    fn cont(&mut self, pid: Pid, signal: Option<Signal>) -> Result<()> {
        self.calls.push(TraceCall::Cont(pid, signal));
        Ok(())
    }

    fn syscall(&mut self, pid: Pid, signal: Option<Signal>) -> Result<()> {
        self.calls.push(TraceCall::Syscall(pid, signal));
        Ok(())
    }

    fn detach(&mut self, pid: Pid, signal: Option<Signal>) -> Result<()> {
        self.calls.push(TraceCall::Detach(pid, signal));
        Ok(())
    }

    fn event_msg(&mut self, pid: Pid) -> Result<i64> {
        self.event_msgs.pop_front().ok_or(VeilError::TraceFailure {
            op: "getevent",
            pid: pid.as_raw(),
            errno: nix::errno::Errno::ESRCH,
        })
    }

    fn wait_any(&mut self) -> WaitOutcome {
        self.waits.pop_front().unwrap_or(WaitOutcome::Idle)
    }
}
