//! `veil add` — Add a target to the denylist.

use std::process::ExitCode;

use veil_common::config::VeilConfig;
use veil_runtime::protocol::Request;

use super::TargetArgs;
use crate::output;

/// Executes the `add` command.
///
/// # Errors
///
/// Returns an error if the daemon cannot be reached.
pub fn execute(config: &VeilConfig, args: &TargetArgs) -> anyhow::Result<ExitCode> {
    tracing::debug!(pkg = %args.package, proc = args.process(), "adding target");
    let response = super::connect(config)?
        .edit(Request::Add, &args.package, args.process())
        .map_err(|e| anyhow::anyhow!("{e}"))?;
    Ok(output::report(response))
}
