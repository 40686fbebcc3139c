//! Waking a thread blocked in a system call.
//!
//! The monitor threads block in `waitpid(2)` or `read(2)`. To hand them a
//! message, the sender queues it and then delivers [`WAKE_SIGNAL`] to the
//! thread. The installed handler does nothing; its only effect is that the
//! blocking call returns `EINTR` because the handler is installed without
//! `SA_RESTART`.

use nix::sys::pthread::{Pthread, pthread_kill, pthread_self};
use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal, sigaction};
use veil_common::error::{Result, VeilError};

/// Signal used to interrupt blocked monitor threads.
///
/// Its default disposition is to be ignored, so a stray delivery before the
/// handler is installed is harmless.
pub const WAKE_SIGNAL: Signal = Signal::SIGURG;

extern "C" fn on_wake(_: libc::c_int) {}

/// Installs the no-op wake handler for the whole process.
///
/// # Errors
///
/// Returns an error if `sigaction(2)` fails.
pub fn install_wake_handler() -> Result<()> {
    let action = SigAction::new(SigHandler::Handler(on_wake), SaFlags::empty(), SigSet::empty());
    // SAFETY: the handler is async-signal-safe (it does nothing) and does not
    // replace any handler installed by other code in this process.
    #[allow(unsafe_code)]
    let _previous = unsafe { sigaction(WAKE_SIGNAL, &action) }.map_err(|e| VeilError::Config {
        message: format!("cannot install wake handler: {e}"),
    })?;
    Ok(())
}

/// Handle used to interrupt one specific thread.
#[derive(Debug, Clone, Copy)]
pub struct ThreadWaker {
    thread: Pthread,
}

impl ThreadWaker {
    /// Returns a waker for the calling thread.
    #[must_use]
    pub fn current() -> Self {
        Self {
            thread: pthread_self(),
        }
    }

    /// Interrupts the thread's current blocking call, if any.
    pub fn wake(&self) {
        if let Err(e) = pthread_kill(self.thread, WAKE_SIGNAL) {
            tracing::debug!(error = %e, "wake signal not delivered");
        }
    }
}
