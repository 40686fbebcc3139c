//! Where log records come from.

use std::io::{BufReader, Read};
use std::process::{Child, ChildStdout, Command, Stdio};

use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use veil_common::error::{Result, VeilError};

use super::codec::{LogRecord, read_record};

/// A stream of binary log records.
pub trait LogSource: Send {
    /// Blocks for the next record. `Ok(None)` means the stream ended.
    ///
    /// # Errors
    ///
    /// Returns an error if the stream is broken or malformed.
    fn next_record(&mut self) -> Result<Option<LogRecord>>;

    /// Returns a way to end a blocked [`LogSource::next_record`] from
    /// another thread, if the source supports it.
    fn closer(&self) -> Option<SourceCloser> {
        None
    }
}

/// Ends a log source by terminating the process producing it.
#[derive(Debug, Clone, Copy)]
pub struct SourceCloser {
    producer: Pid,
}

impl SourceCloser {
    /// Terminates the producer; its reader then sees end of stream.
    pub fn close(&self) {
        if let Err(e) = kill(self.producer, Signal::SIGTERM) {
            tracing::debug!(pid = self.producer.as_raw(), error = %e, "log producer already gone");
        }
    }
}

/// Arguments selecting binary output of the main and events buffers,
/// starting from the newest entry.
pub const LOGCAT_ARGS: &[&str] = &["-B", "-b", "main", "-b", "events", "-T", "1"];

/// [`LogSource`] reading a `logcat` child process.
#[derive(Debug)]
pub struct LogcatProcess {
    child: Child,
    reader: BufReader<ChildStdout>,
}

impl LogcatProcess {
    /// Spawns `logcat` with [`LOGCAT_ARGS`].
    ///
    /// # Errors
    ///
    /// Returns an error if the process cannot be started.
    pub fn spawn() -> Result<Self> {
        Self::spawn_command("logcat", LOGCAT_ARGS)
    }

    /// Spawns an arbitrary producer of binary log records.
    ///
    /// # Errors
    ///
    /// Returns an error if the process cannot be started.
    pub fn spawn_command(program: &str, args: &[&str]) -> Result<Self> {
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| VeilError::Io {
                path: program.into(),
                source: e,
            })?;
        let stdout = child.stdout.take().ok_or_else(|| VeilError::Io {
            path: program.into(),
            source: std::io::Error::other("no stdout pipe"),
        })?;
        tracing::debug!(pid = child.id(), program, "log producer started");
        Ok(Self {
            child,
            reader: BufReader::new(stdout),
        })
    }
}

impl LogSource for LogcatProcess {
    fn next_record(&mut self) -> Result<Option<LogRecord>> {
        read_record(&mut self.reader)
    }

    fn closer(&self) -> Option<SourceCloser> {
        let producer = Pid::from_raw(i32::try_from(self.child.id()).ok()?);
        Some(SourceCloser { producer })
    }
}

impl Drop for LogcatProcess {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// [`LogSource`] over any reader, such as a captured log file.
#[derive(Debug)]
pub struct ReaderSource<R> {
    reader: R,
}

impl<R: Read + Send> ReaderSource<R> {
    /// Wraps `reader`.
    pub const fn new(reader: R) -> Self {
        Self { reader }
    }
}

impl<R: Read + Send> LogSource for ReaderSource<R> {
    fn next_record(&mut self) -> Result<Option<LogRecord>> {
        read_record(&mut self.reader)
    }
}
