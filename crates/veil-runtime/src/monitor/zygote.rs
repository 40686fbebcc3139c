//! The tracing loop: attach to zygotes, follow their forks, and gate each
//! child at its first system calls.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::sync::mpsc::Receiver;

use nix::sys::ptrace::Event;
use nix::sys::signal::Signal;
use nix::sys::wait::WaitStatus;
use nix::unistd::Pid;
use veil_core::namespace::MountNs;
use veil_core::ptrace::{Tracer, WaitOutcome, child_options, supervisor_options};

use super::decision::{Verdict, decide};
use super::pid_table::{GateState, PidTable, TraceState};
use super::{MonitorContext, MonitorMessage, MonitorShared};
use crate::discovery::{self, DiscoveryEvent};
use crate::remediation;

const INIT: Pid = Pid::from_raw(1);

/// Whether the loop keeps running after a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Flow {
    Continue,
    Stop,
}

/// State owned by the monitor thread.
pub(crate) struct ZygoteMonitor<T: Tracer> {
    tracer: T,
    ctx: MonitorContext,
    shared: Arc<MonitorShared>,
    table: PidTable,
    zygotes: HashMap<Pid, MountNs>,
    expected_zygotes: usize,
}

impl<T: Tracer> ZygoteMonitor<T> {
    pub(crate) fn new(tracer: T, ctx: MonitorContext, shared: Arc<MonitorShared>) -> Self {
        let expected_zygotes = ctx.paths.expected_zygotes();
        let table = PidTable::with_capacity(ctx.pid_capacity);
        Self {
            tracer,
            ctx,
            shared,
            table,
            zygotes: HashMap::new(),
            expected_zygotes,
        }
    }

    /// Runs until told to stop or until every sender is gone.
    pub(crate) fn run(&mut self, rx: &Receiver<MonitorMessage>) {
        tracing::info!("zygote monitor started");
        self.rescan();
        loop {
            while let Ok(message) = rx.try_recv() {
                self.taken();
                if self.handle_message(message) == Flow::Stop {
                    self.teardown();
                    return;
                }
            }
            match self.tracer.wait_any() {
                WaitOutcome::Status(status) => self.handle_status(status),
                WaitOutcome::Interrupted => {}
                WaitOutcome::Idle => {
                    // Nothing traced: park on the channel instead.
                    let flow = rx.recv().map_or(Flow::Stop, |message| {
                        self.taken();
                        self.handle_message(message)
                    });
                    if flow == Flow::Stop {
                        self.teardown();
                        return;
                    }
                }
            }
        }
    }

    fn taken(&self) {
        let _ = self
            .shared
            .pending
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    pub(crate) fn handle_message(&mut self, message: MonitorMessage) -> Flow {
        tracing::trace!(?message, "monitor message");
        match message {
            MonitorMessage::Terminate => return Flow::Stop,
            MonitorMessage::Tick
            | MonitorMessage::Watch(DiscoveryEvent::CheckSupervisors) => self.check_zygotes(),
            MonitorMessage::Watch(DiscoveryEvent::UserAdded(_)) => {}
            MonitorMessage::Watch(DiscoveryEvent::PackagesChanged) | MonitorMessage::Rescan => {
                self.rescan();
            }
        }
        Flow::Continue
    }

    fn rescan(&mut self) {
        if let Err(e) = self.ctx.store.rescan() {
            tracing::warn!(error = %e, "denylist rescan failed");
        }
        self.check_zygotes();
    }

    /// Attaches to every zygote not traced yet, once the system server is up.
    fn check_zygotes(&mut self) {
        let found = match discovery::scan(&*self.ctx.procs) {
            Ok(found) => found,
            Err(e) => {
                tracing::warn!(error = %e, "cannot scan processes");
                return;
            }
        };
        if found.system_server {
            for pid in found.zygotes {
                self.attach_zygote(pid);
            }
        }
        let complete = self.zygotes.len() >= self.expected_zygotes;
        self.shared.timer_active.store(!complete, Ordering::Release);
    }

    fn attach_zygote(&mut self, pid: Pid) {
        let procs = &*self.ctx.procs;
        let Ok(ns) = procs.mount_ns(pid) else {
            return;
        };
        if procs.mount_ns(INIT).is_ok_and(|init| init == ns) {
            // Not yet in its own namespace.
            return;
        }
        if let Some(known) = self.zygotes.get_mut(&pid) {
            *known = ns;
            return;
        }
        if let Err(e) = self.tracer.attach(pid) {
            tracing::debug!(pid = pid.as_raw(), error = %e, "cannot attach to zygote");
            return;
        }
        if !self.table.insert(pid, TraceState::Attached) {
            let _ = self.tracer.detach(pid, None);
            return;
        }
        tracing::info!(pid = pid.as_raw(), "zygote attached");
        let _ = self.zygotes.insert(pid, ns);

        if self.ctx.allowlist_mode {
            if let Err(e) = self.ctx.remediator.revert(pid) {
                tracing::warn!(pid = pid.as_raw(), error = %e, "cannot revert zygote");
            }
        }
    }

    pub(crate) fn handle_status(&mut self, status: WaitStatus) {
        match status {
            WaitStatus::PtraceEvent(pid, _, event) if self.zygotes.contains_key(&pid) => {
                self.on_zygote_event(pid, event);
            }
            WaitStatus::PtraceEvent(pid, _, _) => self.resume(pid, None),
            WaitStatus::PtraceSyscall(pid) => self.on_syscall(pid),
            WaitStatus::Stopped(pid, Signal::SIGSTOP) => self.on_sigstop(pid),
            WaitStatus::Stopped(pid, signal) => self.resume(pid, Some(signal)),
            WaitStatus::Exited(pid, _) | WaitStatus::Signaled(pid, _, _) => {
                if self.zygotes.remove(&pid).is_some() {
                    tracing::info!(pid = pid.as_raw(), "zygote exited");
                    self.shared.timer_active.store(true, Ordering::Release);
                }
                let _ = self.table.remove(pid);
            }
            _ => {
                if let Some(pid) = status.pid() {
                    self.release(pid, None);
                }
            }
        }
    }

    fn on_zygote_event(&mut self, pid: Pid, event: i32) {
        if event == Event::PTRACE_EVENT_FORK as i32 || event == Event::PTRACE_EVENT_VFORK as i32 {
            match self.tracer.event_msg(pid) {
                Ok(child) => {
                    let child = Pid::from_raw(i32::try_from(child).unwrap_or_default());
                    // Its stop may have been reported first.
                    if child.as_raw() > 0 && self.table.get(child).is_none() {
                        let _ = self.table.insert(child, TraceState::ForkPending);
                    }
                }
                Err(e) => tracing::debug!(pid = pid.as_raw(), error = %e, "cannot read fork event"),
            }
            self.resume(pid, None);
        } else {
            tracing::info!(pid = pid.as_raw(), event, "zygote leaving, detach");
            let _ = self.zygotes.remove(&pid);
            self.shared.timer_active.store(true, Ordering::Release);
            self.release(pid, None);
        }
    }

    fn on_sigstop(&mut self, pid: Pid) {
        match self.table.get(pid) {
            Some(TraceState::Attached) => {
                let traced = self
                    .tracer
                    .set_options(pid, supervisor_options())
                    .and_then(|()| self.tracer.cont(pid, None));
                match traced {
                    Ok(()) => {
                        let _ = self.table.insert(pid, TraceState::Tracing);
                    }
                    Err(e) => {
                        tracing::debug!(pid = pid.as_raw(), error = %e, "cannot trace zygote");
                        let _ = self.zygotes.remove(&pid);
                        self.release(pid, None);
                    }
                }
            }
            Some(TraceState::Tracing) => self.resume(pid, Some(Signal::SIGSTOP)),
            Some(TraceState::ForkPending | TraceState::Gate(_)) => self.enter_gate(pid),
            None => {
                let is_process = self.ctx.procs.tgid(pid).is_ok_and(|tgid| tgid == pid);
                if is_process {
                    self.enter_gate(pid);
                } else {
                    tracing::trace!(pid = pid.as_raw(), "new thread, detach");
                    self.release(pid, None);
                }
            }
        }
    }

    fn enter_gate(&mut self, pid: Pid) {
        let gated = self
            .tracer
            .set_options(pid, child_options())
            .and_then(|()| self.tracer.syscall(pid, None));
        if let Err(e) = gated {
            tracing::debug!(pid = pid.as_raw(), error = %e, "cannot gate child");
            let _ = self.table.remove(pid);
            return;
        }
        let gate = match self.table.get(pid) {
            Some(TraceState::Gate(gate)) => gate,
            _ => GateState::default(),
        };
        if !self.table.insert(pid, TraceState::Gate(gate)) {
            self.release(pid, None);
        }
    }

    fn on_syscall(&mut self, pid: Pid) {
        let Some(TraceState::Gate(mut gate)) = self.table.get(pid) else {
            self.release(pid, None);
            return;
        };
        let verdict = decide(
            &*self.ctx.procs,
            &self.ctx.store,
            self.ctx.allowlist_mode,
            pid,
            &mut gate,
        );
        match verdict {
            Verdict::Pending => {
                let _ = self.table.insert(pid, TraceState::Gate(gate));
                if let Err(e) = self.tracer.syscall(pid, None) {
                    tracing::debug!(pid = pid.as_raw(), error = %e, "cannot resume child");
                    let _ = self.table.remove(pid);
                }
            }
            Verdict::Detach => self.release(pid, None),
            Verdict::Act => self.act(pid),
        }
    }

    /// Remediates a decided target. The target is detached in a stopped
    /// state and only continued once remediation is over.
    fn act(&mut self, pid: Pid) {
        tracing::info!(pid = pid.as_raw(), "denylist target, remediating");
        self.release(pid, Some(Signal::SIGSTOP));
        let procs = &*self.ctx.procs;
        if let Err(e) = remediation::remediate(&*self.ctx.remediator, pid, self.ctx.allowlist_mode)
        {
            tracing::warn!(pid = pid.as_raw(), error = %e, "remediation failed");
        }
        if let Err(e) = procs.signal(pid, Signal::SIGCONT) {
            tracing::debug!(pid = pid.as_raw(), error = %e, "cannot resume target");
        }
    }

    /// Resumes a stopped tracee in the mode its state calls for.
    fn resume(&mut self, pid: Pid, signal: Option<Signal>) {
        let result = match self.table.get(pid) {
            Some(TraceState::Gate(_)) => self.tracer.syscall(pid, signal),
            _ => self.tracer.cont(pid, signal),
        };
        if let Err(e) = result {
            tracing::debug!(pid = pid.as_raw(), error = %e, "cannot resume");
        }
    }

    /// Detaches `pid` and forgets it.
    fn release(&mut self, pid: Pid, signal: Option<Signal>) {
        let _ = self.table.remove(pid);
        if let Err(e) = self.tracer.detach(pid, signal) {
            tracing::debug!(pid = pid.as_raw(), error = %e, "detach failed");
        }
    }

    /// Detaches everything and clears all state.
    fn teardown(&mut self) {
        for pid in self.table.pids() {
            if let Err(e) = self.tracer.detach(pid, None) {
                // Running tracees are released when this thread exits.
                tracing::trace!(pid = pid.as_raw(), error = %e, "detach on teardown");
            }
        }
        self.table.clear();
        self.zygotes.clear();
        self.shared.timer_active.store(false, Ordering::Release);
        self.shared.running.store(false, Ordering::Release);
        tracing::info!("zygote monitor stopped");
    }

    #[cfg(test)]
    pub(crate) fn state(&self, pid: i32) -> Option<TraceState> {
        self.table.get(Pid::from_raw(pid))
    }

    #[cfg(test)]
    pub(crate) fn tracer(&mut self) -> &mut T {
        &mut self.tracer
    }
}
