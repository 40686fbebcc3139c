//! `veil status` — Query enforcement.

use std::process::ExitCode;

use veil_common::config::VeilConfig;
use veil_runtime::protocol::{Request, Response};

use crate::output;

/// Executes the `status` command: exit 0 when enforced, 1 otherwise.
///
/// # Errors
///
/// Returns an error if the daemon cannot be reached.
pub fn execute(config: &VeilConfig) -> anyhow::Result<ExitCode> {
    let response = super::connect(config)?
        .simple(Request::Status)
        .map_err(|e| anyhow::anyhow!("{e}"))?;
    if matches!(response, Response::Enforced | Response::NotEnforced) {
        println!("{}", output::describe(response));
        return Ok(ExitCode::from(output::exit_status(response)));
    }
    Ok(output::report(response))
}
