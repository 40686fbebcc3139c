//! System-wide constants and default paths.

/// Reserved package identity meaning "any isolated service".
///
/// Process names registered under it are matched as prefixes.
pub const ISOLATED_MAGIC: &str = "isolated";

/// Size of the uid block reserved for each user profile.
pub const AID_USER_OFFSET: u32 = 100_000;

/// First app id assigned to regular applications.
pub const AID_APP_START: u32 = 10_000;

/// Last app id assigned to regular applications.
pub const AID_APP_END: u32 = 19_999;

/// First app id of the isolated-service range.
pub const AID_ISOLATED_START: u32 = 90_000;

/// Last app id of the isolated-service range.
pub const AID_ISOLATED_END: u32 = 99_999;

/// Uid of the privileged owner (root).
pub const AID_ROOT: u32 = 0;

/// Uid of the privileged management process (system server).
pub const AID_SYSTEM: u32 = 1000;

/// Default control socket path.
pub const DEFAULT_SOCKET_PATH: &str = "/dev/veil/control.sock";

/// Default denylist database path.
pub const DEFAULT_DB_PATH: &str = "/data/adb/veil.db";

/// Default configuration file path.
pub const DEFAULT_CONFIG_PATH: &str = "/data/adb/veil.json";

/// Per-user application data root; each child directory is a user id.
pub const APP_DATA_DIR: &str = "/data/user_de";

/// Directory holding the package registry.
pub const SYSTEM_DATA_DIR: &str = "/data/system";

/// File name of the package registry inside [`SYSTEM_DATA_DIR`].
pub const PACKAGES_XML: &str = "packages.xml";

/// Base path of the supervisor executable.
pub const APP_PROCESS: &str = "/system/bin/app_process";

/// Default procfs mount point.
pub const PROC_ROOT: &str = "/proc";

/// Fallback process id ceiling when `pid_max` cannot be read.
pub const DEFAULT_PID_MAX: usize = 32_768;

/// Process names a supervisor child carries before specialization finishes.
pub const SUPERVISOR_STAGE_NAMES: &[&str] = &[
    "zygote",
    "zygote32",
    "zygote64",
    "usap32",
    "usap64",
    "<pre-initialized>",
];

/// Process names of the spawning supervisors.
pub const SUPERVISOR_NAMES: &[&str] = &["zygote", "zygote32", "zygote64"];

/// Process names of the pre-forked supervisor pools.
pub const USAP_POOL_NAMES: &[&str] = &["usap32", "usap64"];

/// Placeholder cmdline of a supervisor child that has not specialized yet.
pub const PRE_INITIALIZED: &str = "<pre-initialized>";

/// Security label of the spawning supervisors.
pub const ZYGOTE_CONTEXT: &str = "u:r:zygote:s0";

/// Security label of per-application supervisors hosting isolated services.
pub const APP_ZYGOTE_CONTEXT: &str = "u:r:app_zygote:s0";

/// Application name used in log output and the CLI.
pub const APP_NAME: &str = "veil";

/// Binary name for the CLI.
pub const BIN_NAME: &str = "veil";
