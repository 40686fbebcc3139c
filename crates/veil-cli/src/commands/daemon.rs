//! `veil daemon` — Run the denylist daemon until interrupted.

use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use clap::Args;
use veil_common::config::VeilConfig;
use veil_runtime::daemon::Daemon;
use veil_runtime::server::Server;

/// Arguments for the `daemon` command.
#[derive(Args, Debug)]
pub struct DaemonArgs {
    /// Start with enforcement off, ignoring the persisted setting.
    #[arg(long)]
    pub no_restore: bool,
}

/// Executes the `daemon` command.
///
/// # Errors
///
/// Returns an error if the database or the control socket cannot be opened.
pub fn execute(config: VeilConfig, args: &DaemonArgs) -> anyhow::Result<ExitCode> {
    let socket = config.socket_path.clone();
    let daemon = Arc::new(Daemon::open(config).map_err(|e| anyhow::anyhow!("{e}"))?);
    if !args.no_restore {
        daemon.restore();
    }

    let server = Server::bind(&socket, Arc::clone(&daemon)).map_err(|e| anyhow::anyhow!("{e}"))?;

    let running = Arc::new(AtomicBool::new(true));
    let r = Arc::clone(&running);
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })
    .map_err(|e| anyhow::anyhow!("failed to set shutdown handler: {e}"))?;

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "veil daemon started");
    let served = server.run(&running);
    drop(server);
    daemon.shutdown();
    tracing::info!("veil daemon stopped");

    served.map_err(|e| anyhow::anyhow!("{e}"))?;
    Ok(ExitCode::SUCCESS)
}
