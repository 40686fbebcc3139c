//! Passive log monitor.
//!
//! Watches the binary `events` and `main` log buffers for process starts
//! and remediates targets once they leave their zygote's namespace. Used
//! when syscall tracing is unavailable or disabled.

pub mod codec;
pub mod monitor;
pub mod source;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use veil_common::error::{Result, VeilError};

pub use monitor::{LogContext, LogMonitor, Reaction, SeparationPolicy};
pub use source::{LogSource, LogcatProcess, ReaderSource, SourceCloser};

/// Opens a fresh log stream. Called again whenever the current one ends.
pub type LogSourceFactory = Arc<dyn Fn() -> Result<Box<dyn LogSource>> + Send + Sync>;

/// Pause before reopening a stream that ended or failed to open.
const REOPEN_DELAY: Duration = Duration::from_millis(250);

#[derive(Debug)]
struct Control {
    running: AtomicBool,
    closer: Mutex<Option<SourceCloser>>,
}

impl Control {
    fn set_closer(&self, closer: Option<SourceCloser>) {
        *self.closer.lock().unwrap_or_else(PoisonError::into_inner) = closer;
    }

    /// Terminates the current producer. The lock is held so the producer
    /// cannot be reaped in between.
    fn close(&self) {
        let guard = self.closer.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(closer) = guard.as_ref() {
            closer.close();
        }
    }

    fn active(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

/// Handle to a running log monitor thread.
#[derive(Debug)]
pub struct LogMonitorHandle {
    control: Arc<Control>,
    thread: JoinHandle<()>,
}

impl LogMonitorHandle {
    /// Opens the first stream from `factory`, then consumes it on a
    /// dedicated thread that reopens the stream each time it ends.
    ///
    /// # Errors
    ///
    /// Returns an error if the first stream cannot be opened or the thread
    /// cannot be spawned.
    pub fn spawn(ctx: LogContext, factory: LogSourceFactory) -> Result<Self> {
        let first = factory()?;
        let control = Arc::new(Control {
            running: AtomicBool::new(true),
            closer: Mutex::new(first.closer()),
        });
        let shared = Arc::clone(&control);
        let thread = std::thread::Builder::new()
            .name("veil-logcat".to_owned())
            .spawn(move || {
                tracing::info!("log monitor started");
                let mut monitor = LogMonitor::new(ctx);
                let mut source = Some(first);
                while shared.active() {
                    let Some(mut current) = source.take().or_else(|| reopen(&factory, &shared)) else {
                        continue;
                    };
                    consume(&mut monitor, &mut *current, &shared);
                    shared.set_closer(None);
                    drop(current);
                    if shared.active() {
                        std::thread::sleep(REOPEN_DELAY);
                    }
                }
                tracing::info!("log monitor stopped");
            })
            .map_err(|e| VeilError::Config {
                message: format!("cannot spawn veil-logcat thread: {e}"),
            })?;
        Ok(Self { control, thread })
    }

    /// Returns whether the monitor thread is still alive.
    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.thread.is_finished()
    }

    /// Stops consuming and waits for the thread.
    ///
    /// A source without a closer is only noticed at its next record.
    pub fn stop(self) {
        self.control.running.store(false, Ordering::Release);
        self.control.close();
        if self.thread.join().is_err() {
            tracing::error!("log monitor panicked");
        }
    }
}

/// Opens a new stream, publishing its closer before reading starts.
fn reopen(factory: &LogSourceFactory, control: &Control) -> Option<Box<dyn LogSource>> {
    match factory() {
        Ok(source) => {
            tracing::info!("log stream reopened");
            control.set_closer(source.closer());
            // A stop that raced the reopen did not see this closer.
            control.active().then_some(source)
        }
        Err(e) => {
            tracing::warn!(error = %e, "cannot reopen log stream");
            std::thread::sleep(REOPEN_DELAY);
            None
        }
    }
}

fn consume(monitor: &mut LogMonitor, source: &mut dyn LogSource, control: &Control) {
    while control.active() {
        match source.next_record() {
            Ok(Some(record)) => {
                // Workers finish on their own.
                let _ = monitor.handle(&record);
            }
            Ok(None) => {
                tracing::warn!("log stream ended");
                return;
            }
            Err(e) => {
                tracing::warn!(error = %e, "log stream broken");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use nix::unistd::Pid;

    use super::*;
    use crate::denylist::{DenylistStore, SqliteDb};
    use crate::testing::{FakePackages, FakeProcesses, RecordingRemediator};
    use crate::logcat::codec::tests::{event, int, record, string};

    #[test]
    fn thread_consumes_a_stream_until_it_ends() {
        let procs = Arc::new(FakeProcesses::default());
        procs.spawn(1, 0, 0, "/init");
        procs.spawn(500, 1, 0, "zygote64");
        procs.set_label(500, "u:r:zygote:s0");
        procs.set_ns(500, 2);
        procs.spawn(4242, 500, 10_123, "com.example.app");
        procs.set_ns(4242, 9);

        let packages = Arc::new(FakePackages::default());
        packages.install(0, "com.example.app", 10_123);
        let store = Arc::new(DenylistStore::new(
            Arc::new(SqliteDb::open_in_memory().expect("db")),
            packages,
            procs.clone(),
        ));
        store.add("com.example.app", "").expect("add");
        let remediator = Arc::new(RecordingRemediator::default());

        let stream = Mutex::new(Some(record(
            2,
            600,
            1000,
            &event(
                monitor::TAG_PROC_START,
                &[int(0), int(4242), int(10_123), string("com.example.app")],
            ),
        )));
        let handle = LogMonitorHandle::spawn(
            LogContext {
                store,
                procs,
                remediator: remediator.clone(),
                allowlist_mode: false,
                separation: SeparationPolicy {
                    interval: Duration::from_millis(1),
                    attempts: 10,
                },
                zygote_monitor: None,
            },
            Arc::new(move || -> Result<Box<dyn LogSource>> {
                let bytes = stream.lock().unwrap().take().unwrap_or_default();
                Ok(Box::new(ReaderSource::new(std::io::Cursor::new(bytes))))
            }),
        )
        .expect("spawn");

        for _ in 0..200 {
            if !remediator.calls().is_empty() {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(remediator.calls(), vec![("revert", Pid::from_raw(4242))]);
        handle.stop();
    }
}
