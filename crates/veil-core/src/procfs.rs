//! Process table access through procfs.
//!
//! The daemon only ever needs a handful of facts about a live process: its
//! owner, the first word of its command line, its parent, its thread group,
//! its mount namespace, and its security label. [`ProcessTable`] exposes
//! exactly those plus signal delivery, so the monitors and the denylist can
//! be exercised against an in-memory table in tests.

use std::path::{Path, PathBuf};

use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use veil_common::error::{Result, VeilError};

use crate::namespace::MountNs;

/// Read and signal access to live processes.
pub trait ProcessTable: Send + Sync {
    /// Lists the pids of every live process.
    ///
    /// # Errors
    ///
    /// Returns an error if the process list cannot be read.
    fn pids(&self) -> Result<Vec<Pid>>;

    /// Returns the effective uid owning `pid`.
    ///
    /// # Errors
    ///
    /// Returns an error if the process no longer exists.
    fn uid(&self, pid: Pid) -> Result<u32>;

    /// Returns the first NUL-terminated word of the command line.
    ///
    /// # Errors
    ///
    /// Returns an error if the process no longer exists.
    fn cmdline(&self, pid: Pid) -> Result<String>;

    /// Returns the parent pid.
    ///
    /// # Errors
    ///
    /// Returns an error if the process no longer exists.
    fn ppid(&self, pid: Pid) -> Result<Pid>;

    /// Returns the thread-group id (the pid of the owning process).
    ///
    /// # Errors
    ///
    /// Returns an error if the task no longer exists.
    fn tgid(&self, pid: Pid) -> Result<Pid>;

    /// Returns the identity of the mount namespace of `pid`.
    ///
    /// # Errors
    ///
    /// Returns an error if the process no longer exists.
    fn mount_ns(&self, pid: Pid) -> Result<MountNs>;

    /// Returns the security label (`attr/current`) of `pid`.
    ///
    /// # Errors
    ///
    /// Returns an error if the process no longer exists.
    fn security_label(&self, pid: Pid) -> Result<String>;

    /// Delivers `signal` to `pid`.
    ///
    /// # Errors
    ///
    /// Returns an error if the signal cannot be delivered.
    fn signal(&self, pid: Pid, signal: Signal) -> Result<()>;

    /// Returns whether `pid` is a whole process (not a thread) owned by `uid`.
    fn is_process(&self, pid: Pid, uid: u32) -> bool {
        self.uid(pid).is_ok_and(|owner| owner == uid)
            && self.tgid(pid).is_ok_and(|tgid| tgid == pid)
    }
}

/// [`ProcessTable`] backed by a procfs mount.
#[derive(Debug, Clone)]
pub struct ProcFs {
    root: PathBuf,
}

impl ProcFs {
    /// Creates a table reading from the given procfs root.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Returns the procfs root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path(&self, pid: Pid, file: &str) -> PathBuf {
        self.root.join(pid.to_string()).join(file)
    }

    fn read(&self, pid: Pid, file: &str) -> Result<Vec<u8>> {
        let path = self.path(pid, file);
        std::fs::read(&path).map_err(|e| VeilError::Io { path, source: e })
    }

    fn status_field(&self, pid: Pid, key: &str) -> Result<String> {
        let data = self.read(pid, "status")?;
        let text = String::from_utf8_lossy(&data);
        text.lines()
            .find_map(|line| line.strip_prefix(key))
            .map(|rest| rest.trim().to_owned())
            .ok_or_else(|| VeilError::Io {
                path: self.path(pid, "status"),
                source: std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("missing {key} field"),
                ),
            })
    }
}

impl Default for ProcFs {
    fn default() -> Self {
        Self::new(veil_common::constants::PROC_ROOT)
    }
}

impl ProcessTable for ProcFs {
    fn pids(&self) -> Result<Vec<Pid>> {
        let entries = std::fs::read_dir(&self.root).map_err(|e| VeilError::Io {
            path: self.root.clone(),
            source: e,
        })?;
        Ok(entries
            .filter_map(std::result::Result::ok)
            .filter_map(|entry| entry.file_name().to_str()?.parse::<i32>().ok())
            .filter(|pid| *pid > 0)
            .map(Pid::from_raw)
            .collect())
    }

    fn uid(&self, pid: Pid) -> Result<u32> {
        // Uid: real effective saved fs
        let field = self.status_field(pid, "Uid:")?;
        parse_status_number(&field, 1).ok_or_else(|| malformed(self.path(pid, "status"), "Uid"))
    }

    fn cmdline(&self, pid: Pid) -> Result<String> {
        let data = self.read(pid, "cmdline")?;
        Ok(first_word(&data))
    }

    fn ppid(&self, pid: Pid) -> Result<Pid> {
        let data = self.read(pid, "stat")?;
        parse_stat_ppid(&String::from_utf8_lossy(&data))
            .map(Pid::from_raw)
            .ok_or_else(|| malformed(self.path(pid, "stat"), "ppid"))
    }

    fn tgid(&self, pid: Pid) -> Result<Pid> {
        let field = self.status_field(pid, "Tgid:")?;
        parse_status_number(&field, 0)
            .and_then(|tgid| i32::try_from(tgid).ok())
            .map(Pid::from_raw)
            .ok_or_else(|| malformed(self.path(pid, "status"), "Tgid"))
    }

    fn mount_ns(&self, pid: Pid) -> Result<MountNs> {
        MountNs::read(&self.path(pid, "ns/mnt"))
    }

    fn security_label(&self, pid: Pid) -> Result<String> {
        let data = self.read(pid, "attr/current")?;
        Ok(first_word(&data).trim_end().to_owned())
    }

    fn signal(&self, pid: Pid, signal: Signal) -> Result<()> {
        kill(pid, signal).map_err(|e| VeilError::Io {
            path: self.root.join(pid.to_string()),
            source: std::io::Error::from(e),
        })
    }
}

/// Returns the bytes before the first NUL as a string.
fn first_word(data: &[u8]) -> String {
    let end = data.iter().position(|b| *b == 0).unwrap_or(data.len());
    String::from_utf8_lossy(&data[..end]).into_owned()
}

/// Extracts the parent pid from a `stat` line: `pid (comm) state ppid ...`.
///
/// The command name may itself contain spaces and parentheses, so parsing
/// starts after the last `)`.
fn parse_stat_ppid(stat: &str) -> Option<i32> {
    let rest = &stat[stat.rfind(')')? + 1..];
    let mut fields = rest.split_whitespace();
    let _state = fields.next()?;
    fields.next()?.parse().ok()
}

fn parse_status_number(field: &str, index: usize) -> Option<u32> {
    field.split_whitespace().nth(index)?.parse().ok()
}

fn malformed(path: PathBuf, what: &str) -> VeilError {
    VeilError::Io {
        path,
        source: std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("malformed {what}"),
        ),
    }
}

/// Calls `f` for each live pid until it returns `false`.
///
/// # Errors
///
/// Returns an error if the process list cannot be read.
pub fn crawl(table: &dyn ProcessTable, mut f: impl FnMut(Pid) -> bool) -> Result<()> {
    for pid in table.pids()? {
        if !f(pid) {
            break;
        }
    }
    Ok(())
}
