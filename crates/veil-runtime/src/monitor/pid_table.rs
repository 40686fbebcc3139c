//! Per-pid trace state.

use std::collections::HashMap;
use std::path::Path;

use nix::unistd::Pid;
use veil_common::constants::DEFAULT_PID_MAX;

/// Progress of a child through the syscall gate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GateState {
    /// The app-id pre-filter has run.
    pub checked: bool,
    /// The child reached a stage where its name is worth inspecting.
    pub allowed: bool,
}

/// Where a traced pid is in the attach and decision protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceState {
    /// A zygote we attached to, waiting for its attach stop.
    Attached,
    /// A zygote with fork tracing enabled.
    Tracing,
    /// A child announced by a fork event that has not stopped yet.
    ForkPending,
    /// A child stopping at every syscall until it is decided.
    Gate(GateState),
}

/// Capacity-bounded map of traced pids.
#[derive(Debug)]
pub struct PidTable {
    states: HashMap<Pid, TraceState>,
    capacity: usize,
}

impl PidTable {
    /// Creates an empty table holding at most `capacity` pids.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            states: HashMap::new(),
            capacity,
        }
    }

    /// Records `state` for `pid`. Returns `false` if the table is full and
    /// `pid` is not already tracked.
    pub fn insert(&mut self, pid: Pid, state: TraceState) -> bool {
        if self.states.len() >= self.capacity && !self.states.contains_key(&pid) {
            tracing::warn!(pid = pid.as_raw(), capacity = self.capacity, "pid table full");
            return false;
        }
        tracing::trace!(pid = pid.as_raw(), ?state, "trace state");
        let _ = self.states.insert(pid, state);
        true
    }

    /// Returns the state of `pid`.
    #[must_use]
    pub fn get(&self, pid: Pid) -> Option<TraceState> {
        self.states.get(&pid).copied()
    }

    /// Forgets `pid`.
    pub fn remove(&mut self, pid: Pid) -> Option<TraceState> {
        self.states.remove(&pid)
    }

    /// Returns the tracked pids.
    #[must_use]
    pub fn pids(&self) -> Vec<Pid> {
        self.states.keys().copied().collect()
    }

    /// Forgets everything.
    pub fn clear(&mut self) {
        self.states = HashMap::new();
    }

    /// Returns the number of tracked pids.
    #[must_use]
    pub fn len(&self) -> usize {
        self.states.len()
    }

    /// Returns whether nothing is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

/// Reads the kernel pid ceiling, falling back to the historical default.
#[must_use]
pub fn pid_capacity(proc_root: &Path) -> usize {
    std::fs::read_to_string(proc_root.join("sys/kernel/pid_max"))
        .ok()
        .and_then(|text| text.trim().parse().ok())
        .unwrap_or(DEFAULT_PID_MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_table_rejects_new_pids_only() {
        let mut table = PidTable::with_capacity(2);
        assert!(table.insert(Pid::from_raw(1), TraceState::Attached));
        assert!(table.insert(Pid::from_raw(2), TraceState::ForkPending));
        assert!(!table.insert(Pid::from_raw(3), TraceState::ForkPending));
        assert!(table.insert(Pid::from_raw(2), TraceState::Gate(GateState::default())));
        assert_eq!(table.len(), 2);
        assert_eq!(
            table.get(Pid::from_raw(2)),
            Some(TraceState::Gate(GateState::default()))
        );
    }

    #[test]
    fn clear_forgets_everything() {
        let mut table = PidTable::with_capacity(8);
        let _ = table.insert(Pid::from_raw(1), TraceState::Tracing);
        table.clear();
        assert!(table.is_empty());
        assert_eq!(table.remove(Pid::from_raw(1)), None);
    }

    #[test]
    fn capacity_comes_from_pid_max() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert_eq!(pid_capacity(dir.path()), DEFAULT_PID_MAX);
        std::fs::create_dir_all(dir.path().join("sys/kernel")).expect("mkdir");
        std::fs::write(dir.path().join("sys/kernel/pid_max"), "4194304\n").expect("write");
        assert_eq!(pid_capacity(dir.path()), 4_194_304);
    }
}
