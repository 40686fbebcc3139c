//! `veil enable` — Turn enforcement on.

use std::process::ExitCode;

use veil_common::config::VeilConfig;
use veil_runtime::protocol::Request;

use crate::output;

/// Executes the `enable` command.
///
/// # Errors
///
/// Returns an error if the daemon cannot be reached.
pub fn execute(config: &VeilConfig) -> anyhow::Result<ExitCode> {
    let response = super::connect(config)?
        .simple(Request::Enforce)
        .map_err(|e| anyhow::anyhow!("{e}"))?;
    Ok(output::report(response))
}
