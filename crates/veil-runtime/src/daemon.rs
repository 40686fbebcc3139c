//! The daemon context: the denylist, the enforcement switch, the monitors,
//! and dispatch of control requests.

use std::io::{Read, Write};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use nix::sys::signal::Signal;
use veil_common::config::{LogMonitorMode, VeilConfig};
use veil_common::constants::{APP_ZYGOTE_CONTEXT, USAP_POOL_NAMES};
use veil_common::error::{Result, VeilError};
use veil_core::namespace::mount_ns_supported;
use veil_core::procfs::{ProcFs, ProcessTable, crawl};

use crate::denylist::db::DENYLIST_SETTING;
use crate::denylist::{DataDirResolver, DenylistDb, DenylistStore, PackageResolver, SqliteDb};
use crate::discovery::DiscoveryPaths;
use crate::logcat::{
    LogContext, LogMonitorHandle, LogSource, LogSourceFactory, LogcatProcess, SeparationPolicy,
};
use crate::monitor::pid_table::pid_capacity;
use crate::monitor::{MonitorContext, ZygoteMonitorHandle};
use crate::protocol::{Request, Response, read_int, read_string, write_int, write_string};
use crate::remediation::{HelperRemediator, Remediator};

fn spawn_logcat() -> Result<Box<dyn LogSource>> {
    Ok(Box::new(LogcatProcess::spawn()?))
}

#[derive(Debug, Default)]
struct Monitors {
    zygote: Option<ZygoteMonitorHandle>,
    log: Option<LogMonitorHandle>,
}

impl Monitors {
    fn stop(&mut self) {
        if let Some(zygote) = self.zygote.take() {
            zygote.stop();
        }
        if let Some(log) = self.log.take() {
            log.stop();
        }
    }
}

/// Shared state of a running daemon.
pub struct Daemon {
    config: VeilConfig,
    store: Arc<DenylistStore>,
    db: Arc<dyn DenylistDb>,
    procs: Arc<dyn ProcessTable>,
    remediator: Arc<dyn Remediator>,
    log_source: LogSourceFactory,
    monitors: Mutex<Monitors>,
}

impl std::fmt::Debug for Daemon {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Daemon")
            .field("config", &self.config)
            .field("store", &self.store)
            .finish_non_exhaustive()
    }
}

impl Daemon {
    /// Assembles a daemon from its collaborators.
    pub fn new(
        config: VeilConfig,
        db: Arc<dyn DenylistDb>,
        packages: Arc<dyn PackageResolver>,
        procs: Arc<dyn ProcessTable>,
        remediator: Arc<dyn Remediator>,
    ) -> Self {
        let store = Arc::new(DenylistStore::new(
            Arc::clone(&db),
            packages,
            Arc::clone(&procs),
        ));
        Self {
            config,
            store,
            db,
            procs,
            remediator,
            log_source: Arc::new(spawn_logcat),
            monitors: Mutex::default(),
        }
    }

    /// Assembles a daemon backed by the host described in `config`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened.
    pub fn open(config: VeilConfig) -> Result<Self> {
        let db = Arc::new(SqliteDb::open(&config.db_path)?);
        let packages = Arc::new(DataDirResolver::new(&config.app_data_dir));
        let procs = Arc::new(ProcFs::new(&config.proc_root));
        let remediator = Arc::new(HelperRemediator::new(&config.remediation_helper));
        Ok(Self::new(config, db, packages, procs, remediator))
    }

    /// Replaces the log stream used by the passive monitor.
    #[must_use]
    pub fn with_log_source(mut self, factory: LogSourceFactory) -> Self {
        self.log_source = factory;
        self
    }

    /// Returns the denylist.
    pub const fn store(&self) -> &Arc<DenylistStore> {
        &self.store
    }

    /// Returns the configuration.
    pub const fn config(&self) -> &VeilConfig {
        &self.config
    }

    fn monitors(&self) -> MutexGuard<'_, Monitors> {
        self.monitors.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Re-enables enforcement if it was on when the daemon last ran.
    pub fn restore(&self) {
        match self.db.setting(DENYLIST_SETTING) {
            Ok(Some(value)) if value != 0 => {
                tracing::info!("restoring denylist enforcement");
                if let Err(e) = self.enforce() {
                    tracing::warn!(error = %e, "cannot restore enforcement");
                }
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "cannot read enforcement setting"),
        }
    }

    /// Turns enforcement on and starts the monitors. Does nothing if it is
    /// already on.
    ///
    /// # Errors
    ///
    /// - [`VeilError::NamespaceUnsupported`] if the kernel lacks mount
    ///   namespaces.
    /// - [`VeilError::Persistence`] if the denylist cannot be loaded.
    /// - Any error starting the only available monitor.
    pub fn enforce(&self) -> Result<()> {
        let mut monitors = self.monitors();
        if self.store.is_enforced() {
            return Ok(());
        }
        if !mount_ns_supported(&self.config.proc_root) {
            return Err(VeilError::NamespaceUnsupported);
        }
        self.store.ensure_loaded()?;

        tracing::info!("denylist: enforcement enabled");
        let _ = self.store.set_enforced(true);
        if let Err(e) = self.start_monitors(&mut monitors) {
            monitors.stop();
            let _ = self.store.set_enforced(false);
            return Err(e);
        }
        if self.config.kill_usap_pools {
            self.kill_supervisor_pools();
        }
        if let Err(e) = self.db.set_setting(DENYLIST_SETTING, 1) {
            tracing::warn!(error = %e, "cannot persist enforcement setting");
        }
        Ok(())
    }

    /// Turns enforcement off and stops the monitors.
    pub fn disable(&self) {
        let mut monitors = self.monitors();
        if self.store.set_enforced(false) {
            tracing::info!("denylist: enforcement disabled");
        }
        monitors.stop();
        if let Err(e) = self.db.set_setting(DENYLIST_SETTING, 0) {
            tracing::warn!(error = %e, "cannot persist enforcement setting");
        }
    }

    /// Stops the monitors without touching the persisted setting.
    pub fn shutdown(&self) {
        self.monitors().stop();
    }

    /// Reports whether enforcement is on.
    pub fn status(&self) -> Response {
        if !self.store.is_enforced() {
            return Response::NotEnforced;
        }
        if !self.monitors_alive() {
            tracing::warn!("denylist enforced but a monitor thread has exited");
        }
        Response::Enforced
    }

    /// Returns whether every monitor started by [`Daemon::enforce`] is still
    /// running.
    pub fn monitors_alive(&self) -> bool {
        let monitors = self.monitors();
        monitors
            .zygote
            .as_ref()
            .is_none_or(|zygote| !zygote.is_finished())
            && monitors.log.as_ref().is_none_or(LogMonitorHandle::is_running)
    }

    fn start_monitors(&self, monitors: &mut Monitors) -> Result<()> {
        if self.config.zygote_monitor {
            let ctx = MonitorContext {
                store: Arc::clone(&self.store),
                procs: Arc::clone(&self.procs),
                remediator: Arc::clone(&self.remediator),
                allowlist_mode: self.config.allowlist_mode,
                paths: DiscoveryPaths::from_config(&self.config),
                pid_capacity: pid_capacity(&self.config.proc_root),
            };
            match ZygoteMonitorHandle::spawn(ctx, self.config.discovery_interval()) {
                Ok(handle) => monitors.zygote = Some(handle),
                Err(e) => tracing::warn!(error = %e, "zygote monitor unavailable"),
            }
        }

        let wanted = match self.config.log_monitor {
            LogMonitorMode::Always => true,
            LogMonitorMode::Fallback => monitors.zygote.is_none(),
            LogMonitorMode::Never => false,
        };
        if !wanted {
            return Ok(());
        }
        let ctx = LogContext {
            store: Arc::clone(&self.store),
            procs: Arc::clone(&self.procs),
            remediator: Arc::clone(&self.remediator),
            allowlist_mode: self.config.allowlist_mode,
            separation: SeparationPolicy {
                interval: self.config.separation_poll(),
                attempts: self.config.separation_max_attempts,
            },
            zygote_monitor: monitors.zygote.as_ref().map(ZygoteMonitorHandle::poster),
        };
        match LogMonitorHandle::spawn(ctx, Arc::clone(&self.log_source)) {
            Ok(handle) => {
                monitors.log = Some(handle);
                Ok(())
            }
            Err(e) if monitors.zygote.is_some() => {
                tracing::warn!(error = %e, "log monitor unavailable");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Kills pre-forked supervisors so they respawn under monitoring.
    fn kill_supervisor_pools(&self) {
        let procs = &*self.procs;
        let result = crawl(procs, |pid| {
            let pooled = procs
                .cmdline(pid)
                .is_ok_and(|cmd| USAP_POOL_NAMES.contains(&cmd.as_str()));
            let app_zygote = procs
                .security_label(pid)
                .is_ok_and(|label| label.contains(APP_ZYGOTE_CONTEXT));
            if pooled || app_zygote {
                tracing::debug!(pid = pid.as_raw(), "killing pooled supervisor");
                if let Err(e) = procs.signal(pid, Signal::SIGKILL) {
                    tracing::debug!(pid = pid.as_raw(), error = %e, "cannot kill pooled supervisor");
                }
            }
            true
        });
        if let Err(e) = result {
            tracing::warn!(error = %e, "cannot crawl processes");
        }
    }

    /// Serves one control request on `stream`.
    ///
    /// # Errors
    ///
    /// Returns an error if the request is malformed or the peer went away.
    pub fn serve(&self, stream: &mut (impl Read + Write)) -> Result<()> {
        let code = read_int(stream)?;
        let request = match Request::try_from(code) {
            Ok(request) => request,
            Err(e) => {
                write_int(stream, Response::Error.code())?;
                return Err(e);
            }
        };
        tracing::debug!(?request, "control request");

        let response = match request {
            Request::Enforce => self.respond(&self.enforce()),
            Request::Disable => {
                self.disable();
                Response::Ok
            }
            Request::Add => {
                let package = read_string(stream)?;
                let process = read_string(stream)?;
                self.respond(&self.store.add(&package, &process))
            }
            Request::Remove => {
                let package = read_string(stream)?;
                let process = read_string(stream)?;
                self.respond(&self.store.remove(&package, &process))
            }
            Request::List => {
                return match self.store.list() {
                    Ok(snapshot) => {
                        write_int(stream, Response::Ok.code())?;
                        for entry in &snapshot {
                            write_string(stream, &entry.to_string())?;
                        }
                        write_string(stream, "")
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "cannot list denylist");
                        write_int(stream, Response::Error.code())
                    }
                };
            }
            Request::Status => self.status(),
        };
        write_int(stream, response.code())
    }

    fn respond(&self, result: &Result<()>) -> Response {
        if let Err(e) = result {
            tracing::debug!(error = %e, enforced = self.store.is_enforced(), "request failed");
        }
        Response::from(result)
    }
}

impl Drop for Daemon {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::net::UnixStream;

    use nix::unistd::Pid;

    use super::*;
    use crate::client::Client;
    use crate::logcat::ReaderSource;
    use crate::testing::{FakePackages, FakeProcesses, RecordingRemediator};

    struct Harness {
        dir: tempfile::TempDir,
        db: Arc<SqliteDb>,
        procs: Arc<FakeProcesses>,
        daemon: Daemon,
    }

    fn config(dir: &std::path::Path) -> VeilConfig {
        VeilConfig {
            proc_root: dir.join("proc"),
            app_data_dir: dir.join("user_de"),
            system_data_dir: dir.join("system"),
            app_process: dir.join("app_process"),
            zygote_monitor: false,
            log_monitor: LogMonitorMode::Never,
            ..VeilConfig::default()
        }
    }

    fn harness_with(db: Arc<SqliteDb>, dir: tempfile::TempDir, config: VeilConfig) -> Harness {
        std::fs::create_dir_all(dir.path().join("proc/self/ns")).expect("mkdir");
        std::fs::write(dir.path().join("proc/self/ns/mnt"), "").expect("ns");
        let packages = Arc::new(FakePackages::default());
        packages.install(0, "com.example.app", 10_123);
        let procs = Arc::new(FakeProcesses::default());
        let daemon = Daemon::new(
            config,
            db.clone(),
            packages,
            procs.clone(),
            Arc::new(RecordingRemediator::default()),
        );
        Harness {
            dir,
            db,
            procs,
            daemon,
        }
    }

    fn harness() -> Harness {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = config(dir.path());
        harness_with(Arc::new(SqliteDb::open_in_memory().expect("db")), dir, config)
    }

    /// Runs one request through `serve` over a socket pair.
    fn exchange(daemon: &Daemon, send: impl FnOnce(UnixStream) + Send + 'static) {
        let (mut server, client) = UnixStream::pair().expect("pair");
        let peer = std::thread::spawn(move || send(client));
        let _ = daemon.serve(&mut server);
        peer.join().expect("peer");
    }

    #[test]
    fn enforce_persists_and_is_idempotent() {
        let h = harness();
        h.daemon.enforce().expect("enforce");
        h.daemon.enforce().expect("enforce again");
        assert_eq!(h.daemon.status(), Response::Enforced);
        assert_eq!(h.db.setting(DENYLIST_SETTING).expect("setting"), Some(1));

        h.daemon.disable();
        assert_eq!(h.daemon.status(), Response::NotEnforced);
        assert_eq!(h.db.setting(DENYLIST_SETTING).expect("setting"), Some(0));
    }

    #[test]
    fn enforce_without_namespaces_is_refused() {
        let h = harness();
        std::fs::remove_file(h.dir.path().join("proc/self/ns/mnt")).expect("rm");
        assert!(matches!(
            h.daemon.enforce().unwrap_err(),
            VeilError::NamespaceUnsupported
        ));
        assert_eq!(h.daemon.status(), Response::NotEnforced);
    }

    #[test]
    fn enforce_kills_pooled_supervisors() {
        let h = harness();
        h.procs.spawn(800, 500, 0, "usap64");
        h.procs.spawn(801, 500, 90_001, "com.example.app:iso_zygote");
        h.procs.set_label(801, "u:r:app_zygote:s0");
        h.procs.spawn(802, 500, 10_123, "com.example.app");

        h.daemon.enforce().expect("enforce");
        assert_eq!(
            h.procs.signals(),
            vec![
                (Pid::from_raw(800), Signal::SIGKILL),
                (Pid::from_raw(801), Signal::SIGKILL),
            ]
        );
    }

    #[test]
    fn unkillable_pooled_supervisor_does_not_block_enforcement() {
        let h = harness();
        h.procs.spawn(800, 500, 0, "usap64");
        h.procs.protect(800);
        h.procs.spawn(801, 500, 0, "usap32");

        h.daemon.enforce().expect("enforce");
        assert_eq!(h.procs.signals(), vec![(Pid::from_raw(801), Signal::SIGKILL)]);
        assert_eq!(h.daemon.status(), Response::Enforced);
    }

    #[test]
    fn restore_follows_persisted_setting() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = Arc::new(SqliteDb::open_in_memory().expect("db"));
        db.set_setting(DENYLIST_SETTING, 1).expect("seed");
        let config = config(dir.path());
        let h = harness_with(db, dir, config);

        h.daemon.restore();
        assert_eq!(h.daemon.status(), Response::Enforced);
    }

    #[test]
    fn log_monitor_runs_when_it_is_the_fallback() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = VeilConfig {
            log_monitor: LogMonitorMode::Fallback,
            ..config(dir.path())
        };
        let h = harness_with(Arc::new(SqliteDb::open_in_memory().expect("db")), dir, config);
        let daemon = h
            .daemon
            .with_log_source(Arc::new(|| -> Result<Box<dyn LogSource>> {
                Ok(Box::new(ReaderSource::new(std::io::empty())))
            }));

        daemon.enforce().expect("enforce");
        assert!(daemon.monitors().log.is_some());
        daemon.disable();
        assert!(daemon.monitors().log.is_none());
    }

    #[test]
    fn log_monitor_reopens_a_stream_that_ends() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let dir = tempfile::tempdir().expect("tempdir");
        let config = VeilConfig {
            log_monitor: LogMonitorMode::Fallback,
            ..config(dir.path())
        };
        let h = harness_with(Arc::new(SqliteDb::open_in_memory().expect("db")), dir, config);
        let opened = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&opened);
        let daemon = h
            .daemon
            .with_log_source(Arc::new(move || -> Result<Box<dyn LogSource>> {
                let _ = counter.fetch_add(1, Ordering::SeqCst);
                Ok(Box::new(ReaderSource::new(std::io::empty())))
            }));

        daemon.enforce().expect("enforce");
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while opened.load(Ordering::SeqCst) < 2 && std::time::Instant::now() < deadline {
            std::thread::sleep(std::time::Duration::from_millis(20));
        }

        assert!(opened.load(Ordering::SeqCst) >= 2);
        assert_eq!(daemon.status(), Response::Enforced);
        assert!(daemon.monitors_alive());
        daemon.disable();
        assert!(daemon.monitors().log.is_none());
    }

    #[test]
    fn failing_only_monitor_rolls_back_enforcement() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = VeilConfig {
            log_monitor: LogMonitorMode::Always,
            ..config(dir.path())
        };
        let h = harness_with(Arc::new(SqliteDb::open_in_memory().expect("db")), dir, config);
        let daemon = h.daemon.with_log_source(Arc::new(|| -> Result<Box<dyn LogSource>> {
            Err(VeilError::Config {
                message: "no logcat".to_owned(),
            })
        }));

        assert!(daemon.enforce().is_err());
        assert_eq!(daemon.status(), Response::NotEnforced);
    }

    #[test]
    fn add_list_remove_over_the_wire() {
        let h = harness();

        exchange(&h.daemon, |mut s| {
            write_int(&mut s, Request::Add as i32).unwrap();
            write_string(&mut s, "com.example.app").unwrap();
            write_string(&mut s, "").unwrap();
            assert_eq!(read_int(&mut s).unwrap(), Response::Ok.code());
        });
        exchange(&h.daemon, |mut s| {
            write_int(&mut s, Request::Add as i32).unwrap();
            write_string(&mut s, "com.example.app").unwrap();
            write_string(&mut s, "com.example.app").unwrap();
            assert_eq!(read_int(&mut s).unwrap(), Response::ItemExist.code());
        });
        exchange(&h.daemon, |mut s| {
            write_int(&mut s, Request::Add as i32).unwrap();
            write_string(&mut s, "nodot").unwrap();
            write_string(&mut s, "").unwrap();
            assert_eq!(read_int(&mut s).unwrap(), Response::InvalidPkg.code());
        });
        exchange(&h.daemon, |mut s| {
            write_int(&mut s, Request::List as i32).unwrap();
            assert_eq!(read_int(&mut s).unwrap(), Response::Ok.code());
            assert_eq!(read_string(&mut s).unwrap(), "com.example.app|com.example.app");
            assert_eq!(read_string(&mut s).unwrap(), "");
        });
        exchange(&h.daemon, |mut s| {
            write_int(&mut s, Request::Remove as i32).unwrap();
            write_string(&mut s, "com.example.app").unwrap();
            write_string(&mut s, "").unwrap();
            assert_eq!(read_int(&mut s).unwrap(), Response::Ok.code());
        });
        exchange(&h.daemon, |mut s| {
            write_int(&mut s, Request::Remove as i32).unwrap();
            write_string(&mut s, "com.example.app").unwrap();
            write_string(&mut s, "").unwrap();
            assert_eq!(read_int(&mut s).unwrap(), Response::ItemNotExist.code());
        });
    }

    #[test]
    fn status_enforce_and_unknown_codes_over_the_wire() {
        let h = harness();
        exchange(&h.daemon, |mut s| {
            write_int(&mut s, Request::Status as i32).unwrap();
            assert_eq!(read_int(&mut s).unwrap(), Response::NotEnforced.code());
        });
        exchange(&h.daemon, |mut s| {
            write_int(&mut s, Request::Enforce as i32).unwrap();
            assert_eq!(read_int(&mut s).unwrap(), Response::Ok.code());
        });
        exchange(&h.daemon, |mut s| {
            write_int(&mut s, 42).unwrap();
            assert_eq!(read_int(&mut s).unwrap(), Response::Error.code());
        });
        exchange(&h.daemon, |mut s| {
            write_int(&mut s, Request::Disable as i32).unwrap();
            assert_eq!(read_int(&mut s).unwrap(), Response::Ok.code());
        });
        assert_eq!(h.daemon.status(), Response::NotEnforced);
    }

    #[test]
    fn client_speaks_the_protocol() {
        let h = harness();
        let daemon = Arc::new(h.daemon);
        let path = h.dir.path().join("control.sock");
        let listener = std::os::unix::net::UnixListener::bind(&path).expect("bind");
        let server = {
            let daemon = Arc::clone(&daemon);
            std::thread::spawn(move || {
                for stream in listener.incoming().take(3) {
                    let mut stream = stream.expect("accept");
                    let _ = daemon.serve(&mut stream);
                }
            })
        };

        let add = Client::connect(&path)
            .expect("connect")
            .edit(Request::Add, "com.example.app", "")
            .expect("add");
        assert_eq!(add, Response::Ok);
        let listed = Client::connect(&path).expect("connect").list().expect("list");
        assert_eq!(listed, Ok(vec!["com.example.app|com.example.app".to_owned()]));
        let status = Client::connect(&path)
            .expect("connect")
            .simple(Request::Status)
            .expect("status");
        assert_eq!(status, Response::NotEnforced);

        server.join().expect("server");
    }
}
