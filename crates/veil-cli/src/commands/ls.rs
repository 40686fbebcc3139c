//! `veil ls` — List the denylist.

use std::process::ExitCode;

use veil_common::config::VeilConfig;

use crate::output;

/// Executes the `ls` command, printing one `package|process` per line.
///
/// # Errors
///
/// Returns an error if the daemon cannot be reached.
pub fn execute(config: &VeilConfig) -> anyhow::Result<ExitCode> {
    match super::connect(config)?
        .list()
        .map_err(|e| anyhow::anyhow!("{e}"))?
    {
        Ok(entries) => {
            for entry in &entries {
                println!("{entry}");
            }
            Ok(ExitCode::SUCCESS)
        }
        Err(response) => Ok(output::report(response)),
    }
}
