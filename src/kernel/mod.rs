//! The kernel: the process table, the spawn/kill/boot/shutdown algorithms,
//! and the signal-driven lifecycle they sit inside.
//!
//! Each managed child is a forked `tokio::process::Child` with dedicated
//! tasks draining its stdout/stderr and a third task awaiting its exit, all
//! coordinated through a shared, mutex-guarded table rather than message
//! passing. `SIGPIPE` is ignored via `libc::signal` because
//! `tokio::signal::unix` has no stream for it.

pub mod port;
pub mod process;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{watch, Mutex};
use tracing::{error, info, warn};

pub use process::{ManagedProcess, Ownership, ProcessStatus, SpawnOptions};

/// Literal line a supervised HTTP server writes to stdout once it has bound
/// its listener — the kernel's analogue of a readiness probe that doesn't
/// require an extra port.
pub const SERVER_READY_LINE: &str = "SERVER_READY";

#[derive(Debug, Error)]
pub enum KernelError {
    #[error("process id '{0}' is already registered")]
    DuplicateId(String),
    #[error("no such managed process: {0}")]
    NotFound(String),
    #[error("failed to spawn '{name}': {source}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot signal an externally-monitored process: {0}")]
    ExternallyMonitored(String),
}

/// Boot-time configuration.
#[derive(Debug, Clone)]
pub struct KernelConfig {
    pub server_script_path: String,
    pub server_argv: Vec<String>,
    pub heartbeat_script_path: String,
    pub heartbeat_argv: Vec<String>,
    pub server_port: u16,
    pub server_hostname: String,
    pub graceful_shutdown_timeout: Duration,
    pub external_monitor_poll_interval: Duration,
}

impl KernelConfig {
    pub fn from_env() -> Self {
        Self {
            server_script_path: std::env::var("SERVER_SCRIPT_PATH")
                .unwrap_or_else(|_| "./bin/server".to_string()),
            server_argv: Vec::new(),
            heartbeat_script_path: std::env::var("HEARTBEAT_SCRIPT_PATH")
                .unwrap_or_else(|_| "./bin/heartbeat".to_string()),
            heartbeat_argv: Vec::new(),
            server_port: std::env::var("PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(8080),
            server_hostname: std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            graceful_shutdown_timeout: Duration::from_secs(5),
            external_monitor_poll_interval: Duration::from_secs(5),
        }
    }
}

/// Renders the startup banner. A separate trait rather than a hardcoded
/// `println!` so embedding applications can swap their own art/version line
/// in without touching the boot sequence itself.
pub trait StartupBanner: Send + Sync {
    fn render(&self, config: &KernelConfig);
}

pub struct DefaultBanner;

impl StartupBanner for DefaultBanner {
    fn render(&self, config: &KernelConfig) {
        println!(
            "genesis-kernel booting — http://{}:{}",
            config.server_hostname, config.server_port
        );
    }
}

type ProcessTable = Arc<Mutex<HashMap<String, ManagedProcess>>>;

/// Owns every supervised process and the boot/shutdown sequence around them.
pub struct Kernel {
    config: KernelConfig,
    table: ProcessTable,
    shutdown_in_progress: Arc<AtomicBool>,
    banner: Arc<dyn StartupBanner>,
}

impl Kernel {
    pub fn new(config: KernelConfig) -> Self {
        Self::with_banner(config, Arc::new(DefaultBanner))
    }

    pub fn with_banner(config: KernelConfig, banner: Arc<dyn StartupBanner>) -> Self {
        // SIGPIPE's default disposition terminates the process; a supervisor
        // writing to a child whose stdin pipe has already closed must not die.
        unsafe {
            libc::signal(libc::SIGPIPE, libc::SIG_IGN);
        }
        Self {
            config,
            table: Arc::new(Mutex::new(HashMap::new())),
            shutdown_in_progress: Arc::new(AtomicBool::new(false)),
            banner,
        }
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    /// Spawns `id` as a managed child process, or — if `opts.port` is
    /// already occupied by another process — registers it in
    /// external-monitor mode instead.
    pub async fn spawn(
        &self,
        id: impl Into<String>,
        name: impl Into<String>,
        script_path: impl Into<String>,
        argv: Vec<String>,
        opts: SpawnOptions,
    ) -> Result<(), KernelError> {
        let id = id.into();
        let name = name.into();
        let script_path = script_path.into();

        {
            let table = self.table.lock().await;
            if table.contains_key(&id) {
                return Err(KernelError::DuplicateId(id));
            }
        }

        if let Some(port) = opts.port {
            if let Some(occupying_pid) = port::probe_listener(port).await {
                warn!(port, pid = occupying_pid, "port already bound, registering as external monitor");
                return self
                    .register_external(id, name, script_path, argv, opts, occupying_pid)
                    .await;
            }
        }

        self.spawn_owned(id, name, script_path, argv, opts).await
    }

    async fn spawn_owned(
        &self,
        id: String,
        name: String,
        script_path: String,
        argv: Vec<String>,
        opts: SpawnOptions,
    ) -> Result<(), KernelError> {
        let mut command = Command::new(&script_path);
        command
            .args(&argv)
            .envs(&opts.env)
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &opts.cwd {
            command.current_dir(cwd);
        }

        let mut child = command.spawn().map_err(|source| KernelError::Spawn { name: name.clone(), source })?;
        let pid = child.id();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let (ready_tx, _ready_rx) = watch::channel(false);
        let process = ManagedProcess {
            id: id.clone(),
            name: name.clone(),
            script_path,
            argv,
            env: opts.env,
            cwd: opts.cwd,
            pid,
            start_time: chrono::Utc::now(),
            restart_count: 0,
            auto_restart: opts.auto_restart,
            status: ProcessStatus::Starting,
            port: opts.port,
            ownership: Ownership::Owned(child),
            ready: ready_tx,
        };

        {
            let mut table = self.table.lock().await;
            table.insert(id.clone(), process);
            table.get_mut(&id).unwrap().status = ProcessStatus::Running;
        }

        if let Some(stdout) = stdout {
            spawn_stdout_reader(self.table.clone(), id.clone(), stdout);
        }
        if let Some(stderr) = stderr {
            spawn_stderr_reader(
                self.table.clone(),
                self.shutdown_in_progress.clone(),
                self.config.external_monitor_poll_interval,
                id.clone(),
                stderr,
            );
        }
        spawn_exit_watcher(
            self.table.clone(),
            self.shutdown_in_progress.clone(),
            self.config.external_monitor_poll_interval,
            id,
        );

        Ok(())
    }

    async fn register_external(
        &self,
        id: String,
        name: String,
        script_path: String,
        argv: Vec<String>,
        opts: SpawnOptions,
        occupying_pid: u32,
    ) -> Result<(), KernelError> {
        let (ready_tx, _) = watch::channel(true);
        let process = ManagedProcess {
            id: id.clone(),
            name,
            script_path,
            argv,
            env: opts.env,
            cwd: opts.cwd,
            pid: Some(occupying_pid),
            start_time: chrono::Utc::now(),
            restart_count: 0,
            // external-monitor records never auto-restart: we don't own the
            // exit code, and restarting would just re-collide on the port.
            auto_restart: false,
            status: ProcessStatus::Running,
            port: opts.port,
            ownership: Ownership::External,
            ready: ready_tx,
        };
        self.table.lock().await.insert(id.clone(), process);
        spawn_external_monitor(
            self.table.clone(),
            self.shutdown_in_progress.clone(),
            self.config.external_monitor_poll_interval,
            id,
        );
        Ok(())
    }

    /// Sends `signal` (default `SIGTERM`) to `id`'s owned child, waits for
    /// it to exit, and marks it stopped. No-op with a warning for
    /// external-monitor records, since the kernel doesn't own that process.
    pub async fn kill(&self, id: &str, sig: libc::c_int) -> Result<(), KernelError> {
        let mut table = self.table.lock().await;
        let process = table.get_mut(id).ok_or_else(|| KernelError::NotFound(id.to_string()))?;
        process.auto_restart = false;

        match (&process.ownership, process.pid) {
            (Ownership::Owned(_), Some(pid)) => {
                unsafe {
                    libc::kill(pid as libc::pid_t, sig);
                }
                Ok(())
            }
            _ => {
                warn!(process = id, "kill requested on an externally-monitored process; ignoring");
                Err(KernelError::ExternallyMonitored(id.to_string()))
            }
        }
    }

    /// Installs signal handlers, boots the heartbeat and HTTP server
    /// children, waits for the server's readiness, and blocks until a
    /// shutdown signal arrives.
    pub async fn boot(&self) -> Result<(), KernelError> {
        self.banner.render(&self.config);

        self.spawn(
            "heartbeat",
            "heartbeat",
            self.config.heartbeat_script_path.clone(),
            self.config.heartbeat_argv.clone(),
            SpawnOptions { auto_restart: true, ..Default::default() },
        )
        .await?;

        self.spawn(
            "server",
            "http-server",
            self.config.server_script_path.clone(),
            self.config.server_argv.clone(),
            SpawnOptions {
                auto_restart: true,
                port: Some(self.config.server_port),
                ..Default::default()
            },
        )
        .await?;

        self.await_ready("server").await;
        info!(port = self.config.server_port, "ready");

        if is_tty() {
            info!("interactive terminal detected; REPL launch is out of scope for this build");
        } else {
            // Headless launch: SIGUSR1 is how an operator (or a process
            // manager) asks "are you up" without an extra health port.
            info!("headless launch; send SIGUSR1 to re-announce readiness");
        }

        self.run_signal_loop().await;
        Ok(())
    }

    async fn await_ready(&self, id: &str) {
        let mut rx = {
            let table = self.table.lock().await;
            match table.get(id) {
                Some(process) => process.ready_receiver(),
                None => return,
            }
        };
        let _ = rx.wait_for(|ready| *ready).await;
    }

    async fn run_signal_loop(&self) {
        let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        let mut sigusr1 = signal(SignalKind::user_defined1()).expect("failed to install SIGUSR1 handler");

        loop {
            tokio::select! {
                _ = sigint.recv() => {
                    info!("received SIGINT");
                    self.shutdown().await;
                    return;
                }
                _ = sigterm.recv() => {
                    info!("received SIGTERM");
                    self.shutdown().await;
                    return;
                }
                _ = sigusr1.recv() => {
                    info!(port = self.config.server_port, "ready (SIGUSR1 re-announce)");
                }
            }
        }
    }

    /// Flips `shutdown_in_progress`, `SIGTERM`s every owned running process
    /// concurrently, gives them `graceful_shutdown_timeout` to exit, then
    /// `SIGKILL`s stragglers.
    pub async fn shutdown(&self) {
        self.shutdown_in_progress.store(true, Ordering::SeqCst);

        let ids: Vec<String> = {
            let table = self.table.lock().await;
            table
                .iter()
                .filter(|(_, p)| p.is_owned() && p.status == ProcessStatus::Running)
                .map(|(id, _)| id.clone())
                .collect()
        };

        for id in &ids {
            let _ = self.kill(id, libc::SIGTERM).await;
        }

        let deadline = tokio::time::Instant::now() + self.config.graceful_shutdown_timeout;
        loop {
            let all_exited = {
                let table = self.table.lock().await;
                ids.iter().all(|id| {
                    table
                        .get(id)
                        .map(|p| p.status != ProcessStatus::Running)
                        .unwrap_or(true)
                })
            };
            if all_exited || tokio::time::Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        let mut table = self.table.lock().await;
        for id in &ids {
            if let Some(process) = table.get_mut(id) {
                if process.status == ProcessStatus::Running {
                    if let Ownership::Owned(child) = &mut process.ownership {
                        warn!(process = %id, "graceful shutdown timed out, sending SIGKILL");
                        let _ = child.start_kill();
                    }
                    process.status = ProcessStatus::Stopped;
                }
            }
        }

        info!("shutdown complete");
    }
}

/// Forwards child stdout line-by-line to the tracing log, resolving the
/// process's ready signal on the first literal [`SERVER_READY_LINE`] and
/// filtering out routine heartbeat pings so they don't spam the log.
///
/// A free function (rather than a `&self` method) because it is spawned as a
/// detached, `'static` task from three call sites: the initial owned spawn
/// and both restart paths below, none of which hold a `Kernel` reference.
fn spawn_stdout_reader(table: ProcessTable, id: String, stdout: tokio::process::ChildStdout) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stdout).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if line.trim() == SERVER_READY_LINE {
                let table = table.lock().await;
                if let Some(process) = table.get(&id) {
                    process.mark_ready();
                }
                continue;
            }
            if is_heartbeat_noise(&line) {
                continue;
            }
            info!(process = %id, "{line}");
        }
    });
}

/// Scans stderr for the OS's "address in use" phrasing, which on a
/// supervised server usually means a stale sibling still holds the
/// port; triggers recovery rather than letting the process limp along.
fn spawn_stderr_reader(
    table: ProcessTable,
    shutdown: Arc<AtomicBool>,
    poll_interval: Duration,
    id: String,
    stderr: tokio::process::ChildStderr,
) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if is_address_in_use(&line) {
                warn!(process = %id, "address already in use, demoting to external monitor");
                recover_from_address_in_use(&table, &shutdown, poll_interval, &id).await;
            } else if !shutdown.load(Ordering::SeqCst) {
                warn!(process = %id, "{line}");
            }
        }
    });
}

/// Awaits the child's exit and applies the restart policy.
fn spawn_exit_watcher(table: ProcessTable, shutdown: Arc<AtomicBool>, poll_interval: Duration, id: String) {
    let kernel_table = table.clone();
    let watcher_shutdown = shutdown.clone();
    tokio::spawn(async move {
        let exit_status = {
            let mut table = table.lock().await;
            let Some(process) = table.get_mut(&id) else { return };
            let Ownership::Owned(child) = &mut process.ownership else { return };
            child.wait().await
        };

        if shutdown.load(Ordering::SeqCst) {
            let mut table = table.lock().await;
            if let Some(process) = table.get_mut(&id) {
                process.status = ProcessStatus::Stopped;
            }
            return;
        }

        let succeeded = matches!(&exit_status, Ok(status) if status.success());
        if succeeded {
            let mut table = table.lock().await;
            if let Some(process) = table.get_mut(&id) {
                process.status = ProcessStatus::Stopped;
            }
            info!(process = %id, "exited cleanly");
            return;
        }

        error!(process = %id, status = ?exit_status, "process exited with failure");
        let should_restart = {
            let mut table = table.lock().await;
            match table.get_mut(&id) {
                Some(process) => {
                    process.status = ProcessStatus::Failed;
                    process.auto_restart
                }
                None => false,
            }
        };

        if should_restart {
            tokio::time::sleep(Duration::from_secs(2)).await;
            restart_in_place(&kernel_table, &watcher_shutdown, poll_interval, &id).await;
        }
    });
}

/// Polls an externally-monitored PID's liveness every
/// `external_monitor_poll_interval`; re-spawns into owned-child mode on
/// exit if the record's `auto_restart` is set.
fn spawn_external_monitor(table: ProcessTable, shutdown: Arc<AtomicBool>, poll_interval: Duration, id: String) {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(poll_interval).await;
            if shutdown.load(Ordering::SeqCst) {
                return;
            }
            let (pid, auto_restart, script_path, argv, env, cwd, port) = {
                let table = table.lock().await;
                match table.get(&id) {
                    Some(p) if matches!(p.ownership, Ownership::External) => (
                        p.pid,
                        p.auto_restart,
                        p.script_path.clone(),
                        p.argv.clone(),
                        p.env.clone(),
                        p.cwd.clone(),
                        p.port,
                    ),
                    _ => return,
                }
            };
            let Some(pid) = pid else { return };
            if port::is_alive(pid) {
                continue;
            }

            info!(process = %id, "externally-monitored process exited");
            let mut table_guard = table.lock().await;
            if let Some(process) = table_guard.get_mut(&id) {
                process.status = ProcessStatus::Stopped;
            }
            drop(table_guard);

            if auto_restart {
                let opts = SpawnOptions { env, cwd, auto_restart, port };
                let _ = respawn_owned(&table, &shutdown, poll_interval, id.clone(), script_path, argv, opts).await;
            }
            return;
        }
    });
}

/// Demotes `id` to an external-monitor record tracking whichever process
/// actually holds the port, instead of just marking it failed and giving up
/// on it. Uses the same port probe the spawn algorithm uses to detect the
/// collision in the first place.
async fn recover_from_address_in_use(
    table: &ProcessTable,
    shutdown: &Arc<AtomicBool>,
    poll_interval: Duration,
    id: &str,
) {
    let port = {
        let table = table.lock().await;
        table.get(id).and_then(|p| p.port)
    };

    let occupying_pid = match port {
        Some(port) => port::probe_listener(port).await,
        None => None,
    };

    match occupying_pid {
        Some(occupying_pid) => {
            {
                let mut table = table.lock().await;
                if let Some(process) = table.get_mut(id) {
                    // Dropping the old `Owned` value kills our own child
                    // (it never managed to bind anyway); tracking shifts to
                    // whatever process actually holds the port.
                    process.ownership = Ownership::External;
                    process.pid = Some(occupying_pid);
                    process.status = ProcessStatus::Running;
                    process.auto_restart = false;
                }
            }
            spawn_external_monitor(table.clone(), shutdown.clone(), poll_interval, id.to_string());
        }
        None => {
            let mut table = table.lock().await;
            if let Some(process) = table.get_mut(id) {
                process.auto_restart = false;
                process.status = ProcessStatus::Failed;
            }
        }
    }
}

async fn restart_in_place(table: &ProcessTable, shutdown: &Arc<AtomicBool>, poll_interval: Duration, id: &str) {
    let (script_path, argv, env, cwd, auto_restart, port, restart_count) = {
        let table = table.lock().await;
        match table.get(id) {
            Some(p) => (
                p.script_path.clone(),
                p.argv.clone(),
                p.env.clone(),
                p.cwd.clone(),
                p.auto_restart,
                p.port,
                p.restart_count,
            ),
            None => return,
        }
    };
    let opts = SpawnOptions { env, cwd, auto_restart, port };
    if let Ok((new_process, stdout, stderr)) = spawn_replacement(script_path, argv, opts).await {
        let mut table_guard = table.lock().await;
        if let Some(process) = table_guard.get_mut(id) {
            let ManagedProcess { pid, start_time, ownership, ready, status, .. } = new_process;
            process.pid = pid;
            process.start_time = start_time;
            process.ownership = ownership;
            process.ready = ready;
            process.status = status;
            process.restart_count = restart_count + 1;
        }
        drop(table_guard);

        if let Some(stdout) = stdout {
            spawn_stdout_reader(table.clone(), id.to_string(), stdout);
        }
        if let Some(stderr) = stderr {
            spawn_stderr_reader(table.clone(), shutdown.clone(), poll_interval, id.to_string(), stderr);
        }
        spawn_exit_watcher(table.clone(), shutdown.clone(), poll_interval, id.to_string());
    }
}

async fn respawn_owned(
    table: &ProcessTable,
    shutdown: &Arc<AtomicBool>,
    poll_interval: Duration,
    id: String,
    script_path: String,
    argv: Vec<String>,
    opts: SpawnOptions,
) -> Result<(), KernelError> {
    let (new_process, stdout, stderr) = spawn_replacement(script_path, argv, opts).await?;
    {
        let mut table_guard = table.lock().await;
        table_guard.insert(id.clone(), new_process);
    }

    if let Some(stdout) = stdout {
        spawn_stdout_reader(table.clone(), id.clone(), stdout);
    }
    if let Some(stderr) = stderr {
        spawn_stderr_reader(table.clone(), shutdown.clone(), poll_interval, id.clone(), stderr);
    }
    spawn_exit_watcher(table.clone(), shutdown.clone(), poll_interval, id);
    Ok(())
}

type ReplacementChild = (ManagedProcess, Option<tokio::process::ChildStdout>, Option<tokio::process::ChildStderr>);

async fn spawn_replacement(
    script_path: String,
    argv: Vec<String>,
    opts: SpawnOptions,
) -> Result<ReplacementChild, KernelError> {
    let mut command = Command::new(&script_path);
    command
        .args(&argv)
        .envs(&opts.env)
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .kill_on_drop(true);
    if let Some(cwd) = &opts.cwd {
        command.current_dir(cwd);
    }
    let mut child = command
        .spawn()
        .map_err(|source| KernelError::Spawn { name: script_path.clone(), source })?;
    let pid = child.id();
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let (ready_tx, _) = watch::channel(false);
    Ok((
        ManagedProcess {
            id: String::new(),
            name: String::new(),
            script_path,
            argv,
            env: opts.env,
            cwd: opts.cwd,
            pid,
            start_time: chrono::Utc::now(),
            restart_count: 0,
            auto_restart: opts.auto_restart,
            status: ProcessStatus::Running,
            port: opts.port,
            ownership: Ownership::Owned(child),
            ready: ready_tx,
        },
        stdout,
        stderr,
    ))
}

fn is_heartbeat_noise(line: &str) -> bool {
    line.contains("heartbeat") && (line.contains("ping") || line.contains("tick"))
}

fn is_address_in_use(line: &str) -> bool {
    let lower = line.to_ascii_lowercase();
    lower.contains("address already in use") || lower.contains("addrinuse") || lower.contains("eaddrinuse")
}

fn is_tty() -> bool {
    unsafe { libc::isatty(libc::STDIN_FILENO) == 1 }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heartbeat_ping_lines_are_filtered() {
        assert!(is_heartbeat_noise("heartbeat: ping"));
        assert!(!is_heartbeat_noise("server listening on :8080"));
    }

    #[test]
    fn address_in_use_detection_is_case_insensitive() {
        assert!(is_address_in_use("Error: Address already in use"));
        assert!(is_address_in_use("bind EADDRINUSE 0.0.0.0:8080"));
        assert!(!is_address_in_use("connection reset by peer"));
    }

    #[tokio::test]
    async fn spawn_rejects_duplicate_id() {
        let kernel = Kernel::new(KernelConfig::from_env());
        kernel
            .spawn("dup", "dup", "/bin/sh", vec!["-c".into(), "sleep 5".into()], SpawnOptions::default())
            .await
            .unwrap();
        let second = kernel
            .spawn("dup", "dup", "/bin/sh", vec!["-c".into(), "sleep 5".into()], SpawnOptions::default())
            .await;
        assert!(matches!(second, Err(KernelError::DuplicateId(_))));
        let _ = kernel.kill("dup", libc::SIGKILL).await;
    }

    #[tokio::test]
    async fn kill_marks_auto_restart_false_and_signals_child() {
        let kernel = Kernel::new(KernelConfig::from_env());
        kernel
            .spawn(
                "svc",
                "svc",
                "/bin/sh",
                vec!["-c".into(), "sleep 30".into()],
                SpawnOptions { auto_restart: true, ..Default::default() },
            )
            .await
            .unwrap();
        kernel.kill("svc", libc::SIGTERM).await.unwrap();
        let table = kernel.table.lock().await;
        assert!(!table.get("svc").unwrap().auto_restart);
    }
}
