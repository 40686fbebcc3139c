//! Deciding what to do with a zygote child stopped at a syscall.

use nix::unistd::Pid;
use veil_common::constants::{
    AID_ROOT, APP_ZYGOTE_CONTEXT, PRE_INITIALIZED, SUPERVISOR_STAGE_NAMES,
};
use veil_common::types::AppId;
use veil_core::procfs::ProcessTable;

use super::pid_table::GateState;
use crate::denylist::DenylistStore;

/// Outcome of one decision step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Not decidable yet; stop again at the next syscall.
    Pending,
    /// Not a target; release the child.
    Detach,
    /// A target in its own namespace; remediate it.
    Act,
}

/// Decides the fate of `pid`, updating its gate progress.
///
/// In allow-list mode isolated services are never acted upon.
pub fn decide(
    procs: &dyn ProcessTable,
    store: &DenylistStore,
    allowlist_mode: bool,
    pid: Pid,
    gate: &mut GateState,
) -> Verdict {
    let Ok(uid) = procs.uid(pid) else {
        return Verdict::Detach;
    };
    // Still specializing.
    if uid == AID_ROOT {
        return Verdict::Pending;
    }

    if !gate.checked {
        let app_id = AppId::from_uid(uid);
        if app_id.is_isolated() {
            if allowlist_mode {
                return Verdict::Detach;
            }
        } else if !store.has_app_id(uid) {
            return Verdict::Detach;
        }
        gate.checked = true;
    }

    let Ok(cmdline) = procs.cmdline(pid) else {
        return Verdict::Detach;
    };

    if !gate.allowed {
        let app_zygote = procs
            .security_label(pid)
            .is_ok_and(|label| label.contains(APP_ZYGOTE_CONTEXT));
        if !app_zygote && cmdline != PRE_INITIALIZED {
            return Verdict::Pending;
        }
        gate.allowed = true;
    }

    if SUPERVISOR_STAGE_NAMES.contains(&cmdline.as_str()) {
        return Verdict::Pending;
    }

    if !store.is_target(uid, &cmdline) {
        return Verdict::Detach;
    }

    let separated = procs.ppid(pid).and_then(|ppid| {
        let own = procs.mount_ns(pid)?;
        let parent = procs.mount_ns(ppid)?;
        Ok(own != parent)
    });
    match separated {
        Ok(true) => Verdict::Act,
        Ok(false) => {
            tracing::warn!(pid = pid.as_raw(), proc = %cmdline, "target shares its parent's mount namespace");
            Verdict::Detach
        }
        Err(_) => Verdict::Detach,
    }
}
