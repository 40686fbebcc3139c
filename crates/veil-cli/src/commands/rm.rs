//! `veil rm` — Remove a target from the denylist.

use std::process::ExitCode;

use veil_common::config::VeilConfig;
use veil_runtime::protocol::Request;

use super::TargetArgs;
use crate::output;

/// Executes the `rm` command.
///
/// # Errors
///
/// Returns an error if the daemon cannot be reached.
pub fn execute(config: &VeilConfig, args: &TargetArgs) -> anyhow::Result<ExitCode> {
    let response = super::connect(config)?
        .edit(Request::Remove, &args.package, args.process())
        .map_err(|e| anyhow::anyhow!("{e}"))?;
    Ok(output::report(response))
}
