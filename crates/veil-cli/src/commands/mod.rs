//! CLI command definitions and dispatch.

pub mod add;
pub mod daemon;
pub mod disable;
pub mod enable;
pub mod ls;
pub mod rm;
pub mod status;

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use veil_common::config::VeilConfig;
use veil_runtime::client::Client;

/// Veil — per-app mount namespace denylist.
#[derive(Parser, Debug)]
#[command(name = "veil", version, about, long_about = None)]
pub struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Command,

    /// Path to the JSON configuration file.
    #[arg(long, global = true, default_value = veil_common::constants::DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,

    /// Control socket path, overriding the configuration.
    #[arg(long, global = true, env = "VEIL_SOCKET")]
    pub socket: Option<PathBuf>,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    pub log_json: bool,
}

/// Available CLI subcommands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the daemon in the foreground.
    Daemon(daemon::DaemonArgs),
    /// Turn enforcement on.
    Enable,
    /// Turn enforcement off.
    Disable,
    /// Add a package (and optionally one of its processes) to the denylist.
    Add(TargetArgs),
    /// Remove a process, or a whole package, from the denylist.
    Rm(TargetArgs),
    /// List every denylist entry.
    Ls,
    /// Exit 0 if enforcement is on.
    Status,
}

/// A `(package, process)` pair on the command line.
#[derive(Args, Debug)]
pub struct TargetArgs {
    /// Package name, or `isolated` for isolated-service prefixes.
    pub package: String,

    /// Process name; defaults to the package name for `add` and to every
    /// process of the package for `rm`.
    pub process: Option<String>,
}

impl TargetArgs {
    fn process(&self) -> &str {
        self.process.as_deref().unwrap_or_default()
    }
}

/// Dispatches the parsed CLI command to its handler.
///
/// # Errors
///
/// Returns an error if the configuration cannot be loaded or the daemon
/// cannot be reached.
pub fn execute(cli: Cli) -> anyhow::Result<ExitCode> {
    let config = load_config(&cli.config, cli.socket)?;
    match cli.command {
        Command::Daemon(args) => daemon::execute(config, &args),
        Command::Enable => enable::execute(&config),
        Command::Disable => disable::execute(&config),
        Command::Add(args) => add::execute(&config, &args),
        Command::Rm(args) => rm::execute(&config, &args),
        Command::Ls => ls::execute(&config),
        Command::Status => status::execute(&config),
    }
}

fn load_config(path: &Path, socket: Option<PathBuf>) -> anyhow::Result<VeilConfig> {
    let mut config = VeilConfig::load(path).map_err(|e| anyhow::anyhow!("{e}"))?;
    if let Some(socket) = socket {
        config.socket_path = socket;
    }
    Ok(config)
}

/// Opens a connection to the daemon named by `config`.
fn connect(config: &VeilConfig) -> anyhow::Result<Client> {
    Client::connect(&config.socket_path).map_err(|e| {
        anyhow::anyhow!(
            "cannot reach the daemon at {}: {e}",
            config.socket_path.display()
        )
    })
}
