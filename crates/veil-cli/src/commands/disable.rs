//! `veil disable` — Turn enforcement off.

use std::process::ExitCode;

use veil_common::config::VeilConfig;
use veil_runtime::protocol::Request;

use crate::output;

/// Executes the `disable` command.
///
/// # Errors
///
/// Returns an error if the daemon cannot be reached.
pub fn execute(config: &VeilConfig) -> anyhow::Result<ExitCode> {
    let response = super::connect(config)?
        .simple(Request::Disable)
        .map_err(|e| anyhow::anyhow!("{e}"))?;
    Ok(output::report(response))
}
