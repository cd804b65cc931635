//! Kernel process launch
//!
//! Writes a fresh connection file, substitutes it into the spec's launch
//! line, merges the environment, spawns the child, and waits for
//! wire-level readiness inside the caller's timeout budget. The returned
//! [`KernelProcess`] solely owns the child: dropping it kills the process
//! if still alive.

use crate::config::HostConfig;
use metrics::counter;
use nbkernel_core::{
    ConnectionFile, HostError, InterpreterService, InterruptMode, KernelConnection, Result,
    WireTransport, CONNECTION_FILE_PLACEHOLDER,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};
use uuid::Uuid;

/// How often readiness is probed while the child starts
const READINESS_POLL: Duration = Duration::from_millis(100);

/// Budget for one heartbeat ping during the readiness probe
const HEARTBEAT_TIMEOUT: Duration = Duration::from_millis(500);

/// Kept tail of the child's standard error, for death diagnostics
const STDERR_TAIL_LIMIT: usize = 4096;

/// Why and how a kernel process exited
#[derive(Debug, Clone)]
pub struct ExitInfo {
    /// OS exit code, when one was reported
    pub exit_code: Option<i32>,
    /// Human-readable cause, when known
    pub reason: Option<String>,
}

#[derive(Debug)]
enum ProcessCommand {
    Kill,
}

/// A launched kernel child process
#[derive(Debug)]
pub struct KernelProcess {
    kernel_id: String,
    connection_file: ConnectionFile,
    connection_file_path: PathBuf,
    pid: Option<u32>,
    can_interrupt: bool,
    commands: mpsc::UnboundedSender<ProcessCommand>,
    exit_rx: watch::Receiver<Option<ExitInfo>>,
    stderr_tail: Arc<Mutex<String>>,
    disposed: AtomicBool,
}

impl KernelProcess {
    /// Id assigned to this launch
    pub fn kernel_id(&self) -> &str {
        &self.kernel_id
    }

    /// Transport addressing handed to the kernel
    pub const fn connection_file(&self) -> &ConnectionFile {
        &self.connection_file
    }

    /// OS process id, while known
    pub const fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// True when a SIGINT-equivalent can be delivered on this platform
    pub const fn can_interrupt(&self) -> bool {
        self.can_interrupt
    }

    /// Watch for the process-exit event; holds `None` until exit
    pub fn exit_watch(&self) -> watch::Receiver<Option<ExitInfo>> {
        self.exit_rx.clone()
    }

    /// True once the child has exited
    pub fn has_exited(&self) -> bool {
        self.exit_rx.borrow().is_some()
    }

    /// Tail of the child's standard error captured so far
    pub fn stderr_tail(&self) -> String {
        self.stderr_tail.lock().clone()
    }

    /// Deliver a platform-native interrupt to the child
    ///
    /// # Errors
    ///
    /// Returns `InterruptNotSupported` on platforms without a
    /// SIGINT-equivalent and `KernelDied` when the child is already gone.
    pub fn interrupt(&self) -> Result<()> {
        if !self.can_interrupt {
            return Err(HostError::InterruptNotSupported);
        }
        if self.has_exited() {
            return Err(HostError::KernelDied {
                exit_code: self.exit_rx.borrow().as_ref().and_then(|info| info.exit_code),
                reason: None,
            });
        }
        #[cfg(unix)]
        {
            let Some(pid) = self.pid else {
                return Err(HostError::InterruptNotSupported);
            };
            #[allow(clippy::cast_possible_wrap)]
            nix::sys::signal::kill(
                nix::unistd::Pid::from_raw(pid as i32),
                nix::sys::signal::Signal::SIGINT,
            )
            .map_err(|error| HostError::transport(format!("failed to signal kernel: {error}")))?;
            trace!("Delivered SIGINT to kernel pid {pid}");
            Ok(())
        }
        #[cfg(not(unix))]
        {
            Err(HostError::InterruptNotSupported)
        }
    }

    /// Kill the child if still alive; idempotent
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.commands.send(ProcessCommand::Kill);
        debug!("Disposed kernel process {}", self.kernel_id);
    }
}

impl Drop for KernelProcess {
    fn drop(&mut self) {
        // Exclusive ownership: dropping the value kills the child.
        self.dispose();
    }
}

/// Launches kernel child processes
pub struct KernelLauncher {
    config: Arc<HostConfig>,
    interpreters: Arc<dyn InterpreterService>,
    transport: Arc<dyn WireTransport>,
}

impl KernelLauncher {
    /// Create a launcher over the host services
    pub fn new(
        config: Arc<HostConfig>,
        interpreters: Arc<dyn InterpreterService>,
        transport: Arc<dyn WireTransport>,
    ) -> Self {
        Self {
            config,
            interpreters,
            transport,
        }
    }

    /// The wire transport kernels are probed and connected through
    pub fn transport(&self) -> &Arc<dyn WireTransport> {
        &self.transport
    }

    /// Launch `connection` and wait for wire-level readiness
    ///
    /// # Errors
    ///
    /// - `InvalidKernel` when the connection cannot be launched (remote
    ///   variant, missing spec file, missing executable)
    /// - `LaunchTimeout` when `timeout` elapses before readiness
    /// - `KernelDied` / `InterpreterNotInstalled` when the child exits
    ///   before readiness
    /// - `Cancelled` when `cancel` fires; the child is killed
    #[instrument(level = "info", skip_all, fields(kernel = connection.display_name(), resource = ?resource))]
    pub async fn launch(
        &self,
        connection: &KernelConnection,
        timeout: Duration,
        resource: Option<&Path>,
        working_dir: Option<&Path>,
        cancel: &CancellationToken,
    ) -> Result<KernelProcess> {
        let result = self
            .launch_inner(connection, timeout, working_dir, cancel)
            .await;
        match &result {
            Ok(process) => {
                counter!("kernel_launch", "result" => "ok").increment(1);
                info!(
                    "Kernel {} ready (pid {:?})",
                    process.kernel_id, process.pid
                );
            }
            Err(error) => {
                counter!("kernel_launch", "result" => error.code()).increment(1);
                warn!("Kernel launch failed: {error}");
            }
        }
        result
    }

    async fn launch_inner(
        &self,
        connection: &KernelConnection,
        timeout: Duration,
        working_dir: Option<&Path>,
        cancel: &CancellationToken,
    ) -> Result<KernelProcess> {
        let spec = connection.spec().ok_or_else(|| HostError::InvalidKernel {
            reason: "remote kernels are not launched locally".to_string(),
        })?;
        if let Some(spec_file) = &spec.spec_file {
            if !tokio::fs::try_exists(spec_file).await.unwrap_or(false) {
                return Err(HostError::InvalidKernel {
                    reason: format!("spec file {} no longer exists", spec_file.display()),
                });
            }
        }

        let kernel_id = Uuid::new_v4().to_string();
        let connection_file = ConnectionFile::new_local(Some(spec.name.clone()))?;
        let connection_file_path = ConnectionFile::temp_path(&kernel_id);
        connection_file.write_to(&connection_file_path).await?;

        let argv: Vec<String> = spec
            .argv
            .iter()
            .map(|arg| {
                arg.replace(
                    CONNECTION_FILE_PLACEHOLDER,
                    &connection_file_path.to_string_lossy(),
                )
            })
            .collect();

        let env = self.merged_env(connection).await;
        let cwd = resolve_working_dir(working_dir);

        debug!("Launching kernel: {argv:?} (cwd {})", cwd.display());
        let mut command = tokio::process::Command::new(&argv[0]);
        command
            .args(&argv[1..])
            .env_clear()
            .envs(&env)
            .current_dir(&cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|error| {
            let _ = std::fs::remove_file(&connection_file_path);
            if error.kind() == std::io::ErrorKind::NotFound {
                HostError::InvalidKernel {
                    reason: format!("kernel executable {} not found", argv[0]),
                }
            } else {
                HostError::Io(error)
            }
        })?;

        let pid = child.id();
        let stderr_tail = Arc::new(Mutex::new(String::new()));
        self.drain_output(&mut child, &stderr_tail);

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = watch::channel(None);
        tokio::spawn(monitor_child(
            child,
            command_rx,
            exit_tx,
            connection_file_path.clone(),
        ));

        // Specs asking for message-mode interrupts must not be signalled,
        // so the capability flag reflects both platform and spec.
        let can_interrupt = cfg!(unix) && spec.interrupt_mode != InterruptMode::Message;

        let process = KernelProcess {
            kernel_id,
            connection_file,
            connection_file_path,
            pid,
            can_interrupt,
            commands: command_tx,
            exit_rx,
            stderr_tail,
            disposed: AtomicBool::new(false),
        };

        self.wait_for_readiness(&process, timeout, cancel).await?;
        Ok(process)
    }

    /// Spec env over the host environment over the interpreter's
    /// activation variables
    async fn merged_env(&self, connection: &KernelConnection) -> HashMap<String, String> {
        let mut env: HashMap<String, String> = std::env::vars().collect();
        if let Some(interpreter) = connection.interpreter() {
            env.extend(self.interpreters.activation_env(interpreter).await);
        }
        if let Some(spec) = connection.spec() {
            env.extend(spec.env.clone());
        }
        env
    }

    fn drain_output(&self, child: &mut tokio::process::Child, stderr_tail: &Arc<Mutex<String>>) {
        let verbose = self.config.log_kernel_output;

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if verbose {
                        info!(target: "nbkernel::kernel_output", "{line}");
                    } else {
                        trace!(target: "nbkernel::kernel_output", "{line}");
                    }
                }
            });
        }

        if let Some(stderr) = child.stderr.take() {
            let tail = Arc::clone(stderr_tail);
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if verbose {
                        info!(target: "nbkernel::kernel_output", "{line}");
                    } else {
                        trace!(target: "nbkernel::kernel_output", "{line}");
                    }
                    let mut tail = tail.lock();
                    tail.push_str(&line);
                    tail.push('\n');
                    if tail.len() > STDERR_TAIL_LIMIT {
                        let cut = tail.len() - STDERR_TAIL_LIMIT;
                        tail.drain(..cut);
                    }
                }
            });
        }
    }

    /// Poll the heartbeat until the kernel answers, the child dies, the
    /// budget elapses, or the caller cancels
    async fn wait_for_readiness(
        &self,
        process: &KernelProcess,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);
        let mut exit_rx = process.exit_watch();

        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    process.dispose();
                    return Err(HostError::Cancelled);
                }
                () = &mut deadline => {
                    process.dispose();
                    return Err(HostError::LaunchTimeout { timeout });
                }
                _ = exit_rx.changed() => {
                    let info = exit_rx.borrow().clone();
                    if let Some(info) = info {
                        return Err(death_error(&info, process.stderr_tail()));
                    }
                }
                () = tokio::time::sleep(READINESS_POLL) => {
                    if let Ok(wire) = self.transport.connect(process.connection_file()).await {
                        let answered = wire.heartbeat(HEARTBEAT_TIMEOUT).await.unwrap_or(false);
                        let _ = wire.shutdown().await;
                        if answered {
                            return Ok(());
                        }
                    }
                }
            }
        }
    }
}

/// Owns the child for its lifetime: reaps it, serves kill requests, and
/// cleans up the connection file after exit
async fn monitor_child(
    mut child: tokio::process::Child,
    mut commands: mpsc::UnboundedReceiver<ProcessCommand>,
    exit_tx: watch::Sender<Option<ExitInfo>>,
    connection_file_path: PathBuf,
) {
    let mut commands_closed = false;
    let info = loop {
        tokio::select! {
            status = child.wait() => {
                let exit_code = status.ok().and_then(|status| status.code());
                break ExitInfo {
                    exit_code,
                    reason: None,
                };
            }
            command = commands.recv(), if !commands_closed => {
                match command {
                    Some(ProcessCommand::Kill) | None => {
                        if command.is_none() {
                            commands_closed = true;
                        }
                        let _ = child.start_kill();
                    }
                }
            }
        }
    };

    debug!("Kernel process exited with code {:?}", info.exit_code);
    let _ = exit_tx.send(Some(info));
    let _ = tokio::fs::remove_file(&connection_file_path).await;
}

fn resolve_working_dir(working_dir: Option<&Path>) -> PathBuf {
    if let Some(dir) = working_dir {
        if dir.is_dir() {
            return dir.to_path_buf();
        }
    }
    std::env::current_dir().unwrap_or_else(|_| std::env::temp_dir())
}

/// Classify an early death: a missing launcher module is an
/// `InterpreterNotInstalled`, anything else a `KernelDied` with the
/// captured stderr tail
fn death_error(info: &ExitInfo, stderr_tail: String) -> HostError {
    if let Some(package) = missing_module(&stderr_tail) {
        return HostError::InterpreterNotInstalled {
            required_package: package,
        };
    }
    HostError::KernelDied {
        exit_code: info.exit_code,
        reason: (!stderr_tail.is_empty()).then_some(stderr_tail),
    }
}

fn missing_module(stderr: &str) -> Option<String> {
    static PATTERN: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();
    let pattern = PATTERN.get_or_init(|| {
        regex::Regex::new(r"No module named '?([A-Za-z0-9_.]+)'?").expect("valid regex")
    });
    pattern
        .captures(stderr)
        .map(|captures| captures[1].to_string())
}
