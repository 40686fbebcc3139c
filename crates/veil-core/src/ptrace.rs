//! Trace primitives used by the zygote monitor.
//!
//! Every ptrace request must come from the tracing thread, so a [`Tracer`]
//! is owned by exactly one thread and is deliberately not `Sync`.

use nix::errno::Errno;
use nix::sys::ptrace;
use nix::sys::signal::Signal;
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;
use veil_common::error::{Result, VeilError};

pub use nix::sys::ptrace::{Event, Options};

/// Result of waiting for any traced child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// A tracee changed state.
    Status(WaitStatus),
    /// There is nothing to wait for.
    Idle,
    /// The wait was interrupted by a signal.
    Interrupted,
}

/// The ptrace surface the zygote monitor relies on.
pub trait Tracer {
    /// Attaches to a running process.
    ///
    /// # Errors
    ///
    /// Returns [`VeilError::TraceFailure`] if the kernel refuses.
    fn attach(&mut self, pid: Pid) -> Result<()>;

    /// Sets trace options on a stopped tracee.
    ///
    /// # Errors
    ///
    /// Returns [`VeilError::TraceFailure`] if the tracee is gone.
    fn set_options(&mut self, pid: Pid, options: Options) -> Result<()>;

    /// Resumes a tracee, optionally delivering a signal.
    ///
    /// # Errors
    ///
    /// Returns [`VeilError::TraceFailure`] if the tracee is gone.
    fn cont(&mut self, pid: Pid, signal: Option<Signal>) -> Result<()>;

    /// Resumes a tracee until its next syscall boundary.
    ///
    /// # Errors
    ///
    /// Returns [`VeilError::TraceFailure`] if the tracee is gone.
    fn syscall(&mut self, pid: Pid, signal: Option<Signal>) -> Result<()>;

    /// Releases a tracee, optionally delivering a signal.
    ///
    /// # Errors
    ///
    /// Returns [`VeilError::TraceFailure`] if the tracee is gone.
    fn detach(&mut self, pid: Pid, signal: Option<Signal>) -> Result<()>;

    /// Returns the message attached to the last ptrace event.
    ///
    /// # Errors
    ///
    /// Returns [`VeilError::TraceFailure`] if the tracee is gone.
    fn event_msg(&mut self, pid: Pid) -> Result<i64>;

    /// Blocks until any tracee changes state.
    fn wait_any(&mut self) -> WaitOutcome;
}

/// [`Tracer`] issuing real ptrace requests.
#[derive(Debug, Default)]
pub struct PtraceTracer {
    _not_sync: std::marker::PhantomData<std::cell::Cell<()>>,
}

impl PtraceTracer {
    /// Creates a tracer bound to the calling thread.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

fn failure(op: &'static str, pid: Pid) -> impl FnOnce(Errno) -> VeilError {
    move |errno| VeilError::TraceFailure {
        op,
        pid: pid.as_raw(),
        errno,
    }
}

impl Tracer for PtraceTracer {
    fn attach(&mut self, pid: Pid) -> Result<()> {
        ptrace::attach(pid).map_err(failure("attach", pid))
    }

    fn set_options(&mut self, pid: Pid, options: Options) -> Result<()> {
        ptrace::setoptions(pid, options).map_err(failure("setoptions", pid))
    }

    fn cont(&mut self, pid: Pid, signal: Option<Signal>) -> Result<()> {
        ptrace::cont(pid, signal).map_err(failure("cont", pid))
    }

    fn syscall(&mut self, pid: Pid, signal: Option<Signal>) -> Result<()> {
        ptrace::syscall(pid, signal).map_err(failure("syscall", pid))
    }

    fn detach(&mut self, pid: Pid, signal: Option<Signal>) -> Result<()> {
        ptrace::detach(pid, signal).map_err(failure("detach", pid))
    }

    fn event_msg(&mut self, pid: Pid) -> Result<i64> {
        ptrace::getevent(pid)
            .map(i64::from)
            .map_err(failure("getevent", pid))
    }

    fn wait_any(&mut self) -> WaitOutcome {
        match waitpid(Option::<Pid>::None, Some(WaitPidFlag::__WALL | WaitPidFlag::__WNOTHREAD)) {
            Ok(status) => WaitOutcome::Status(status),
            Err(Errno::EINTR) => WaitOutcome::Interrupted,
            Err(Errno::ECHILD) => WaitOutcome::Idle,
            Err(errno) => {
                tracing::warn!(%errno, "waitpid failed");
                WaitOutcome::Interrupted
            }
        }
    }
}

/// Options set on a freshly attached supervisor.
#[must_use]
pub fn supervisor_options() -> Options {
    Options::PTRACE_O_TRACEFORK | Options::PTRACE_O_TRACEVFORK | Options::PTRACE_O_TRACEEXIT
}

/// Options set on a supervisor child awaiting its decision.
#[must_use]
pub fn child_options() -> Options {
    Options::PTRACE_O_TRACESYSGOOD
}
