//! Launching the server process and waiting for it to become ready.

use crate::config::{NetworkConfig, ProcessConfig};
use crate::error::{Result, VisionError};
use crate::net;
use crate::platform;
use std::collections::HashMap;
use std::fs::File;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tempfile::NamedTempFile;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, error, info, warn};

#[cfg(unix)]
use std::os::unix::process::CommandExt;

#[cfg(windows)]
use std::os::windows::process::CommandExt;

/// Configuration for launching a server process.
#[derive(Debug, Clone)]
pub struct LaunchConfig {
    /// Path to the server executable.
    pub executable: PathBuf,
    /// Working directory for the child (defaults to the executable's directory).
    pub working_dir: Option<PathBuf>,
    /// Host the server binds to.
    pub host: String,
    /// Port the server listens on.
    pub port: u16,
    /// Arguments passed to the executable.
    pub args: Vec<String>,
    /// Environment variables to set.
    pub env_vars: HashMap<String, String>,
    /// File receiving stdout/stderr. A temporary file is used when unset.
    pub log_file: Option<PathBuf>,
    /// Maximum time to wait for readiness.
    pub ready_timeout: Duration,
    /// Interval between readiness checks.
    pub poll_interval: Duration,
    /// Path of the readiness probe endpoint.
    pub probe_path: String,
    /// Also wait for the server to report that its models are initialized.
    pub wait_for_init_model: bool,
}

impl LaunchConfig {
    /// Create a launch config with default timeouts.
    pub fn new(executable: impl AsRef<Path>, host: impl Into<String>, port: u16) -> Self {
        Self {
            executable: executable.as_ref().to_path_buf(),
            working_dir: None,
            host: host.into(),
            port,
            args: Vec::new(),
            env_vars: HashMap::new(),
            log_file: None,
            ready_timeout: ProcessConfig::STARTUP_TIMEOUT,
            poll_interval: ProcessConfig::READY_POLL_INTERVAL,
            probe_path: "/ping".to_string(),
            wait_for_init_model: false,
        }
    }

    /// Set the arguments.
    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    /// Add an argument.
    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Set the working directory.
    pub fn with_working_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.working_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    /// Add an environment variable.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env_vars.insert(key.into(), value.into());
        self
    }

    /// Set the log file path.
    pub fn with_log_file(mut self, path: impl AsRef<Path>) -> Self {
        self.log_file = Some(path.as_ref().to_path_buf());
        self
    }

    /// Set the ready timeout.
    pub fn with_ready_timeout(mut self, timeout: Duration) -> Self {
        self.ready_timeout = timeout;
        self
    }

    /// Set the readiness poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Require the model-initialized marker before reporting ready.
    pub fn with_wait_for_init_model(mut self, wait: bool) -> Self {
        self.wait_for_init_model = wait;
        self
    }

    fn probe_url(&self) -> String {
        format!(
            "http://{}:{}{}",
            net::connect_host(&self.host),
            self.port,
            self.probe_path
        )
    }
}

/// Where the child's output goes. A temporary log is deleted with the handle.
#[derive(Debug)]
enum ProcessLog {
    File(PathBuf),
    Temp(NamedTempFile),
}

impl ProcessLog {
    fn path(&self) -> &Path {
        match self {
            ProcessLog::File(path) => path,
            ProcessLog::Temp(file) => file.path(),
        }
    }
}

/// A server process owned by exactly one instance.
///
/// Dropping the handle without [`ServerProcess::terminate`] kills the process
/// group immediately; that is the fallback, not the normal shutdown path.
#[derive(Debug)]
pub struct ServerProcess {
    child: Child,
    pid: u32,
    host: String,
    port: u16,
    log: ProcessLog,
    reaped: Option<ExitStatus>,
}

impl ServerProcess {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// File capturing the server's stdout and stderr.
    pub fn log_path(&self) -> &Path {
        self.log.path()
    }

    /// Exit status, if the process has exited.
    pub fn try_exit_status(&mut self) -> Option<ExitStatus> {
        if self.reaped.is_none() {
            match self.child.try_wait() {
                Ok(Some(status)) => {
                    debug!("Server process {} exited with {}", self.pid, status);
                    self.reaped = Some(status);
                }
                Ok(None) => {}
                Err(e) => warn!("Failed to poll server process {}: {}", self.pid, e),
            }
        }
        self.reaped
    }

    pub fn is_running(&mut self) -> bool {
        self.try_exit_status().is_none()
    }

    /// Stop the process: `SIGTERM`, wait up to `grace`, then `SIGKILL`.
    ///
    /// Succeeds immediately if the process has already exited.
    pub async fn terminate(&mut self, grace: Duration) -> Result<()> {
        if !self.is_running() {
            return Ok(());
        }

        info!("Stopping server process {} (grace {:?})", self.pid, grace);
        if let Err(e) = platform::request_termination(self.pid) {
            warn!("Graceful termination of {} failed: {}", self.pid, e);
        }
        if self.wait_for_exit(grace).await {
            debug!("Process {} terminated gracefully", self.pid);
            return Ok(());
        }

        warn!("Process {} still running after {:?}, killing", self.pid, grace);
        self.force_kill();
        if self.wait_for_exit(ProcessConfig::KILL_WAIT).await {
            return Ok(());
        }

        error!("Process {} survived SIGKILL", self.pid);
        Err(VisionError::ShutdownFailed {
            pid: self.pid,
            message: format!("still alive {:?} after kill", ProcessConfig::KILL_WAIT),
        })
    }

    /// Wait until the process exits or `timeout` elapses.
    pub async fn wait_for_exit(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if !self.is_running() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(ProcessConfig::EXIT_POLL_INTERVAL).await;
        }
    }

    fn force_kill(&mut self) {
        if let Err(e) = platform::force_kill_group(self.pid) {
            warn!("Killing process group {} failed: {}", self.pid, e);
        }
        // Covers platforms without process groups.
        let _ = self.child.kill();
    }

    /// Kill the process group and wait for the process to be reaped.
    pub async fn kill(&mut self) {
        if !self.is_running() {
            return;
        }
        self.force_kill();
        if !self.wait_for_exit(ProcessConfig::KILL_WAIT).await {
            error!("Server process {} could not be reaped", self.pid);
        }
    }

    /// Blocking variant of [`ServerProcess::kill`] for `Drop` paths.
    pub fn kill_now(&mut self) {
        if !self.is_running() {
            return;
        }
        self.force_kill();
        let deadline = Instant::now() + ProcessConfig::KILL_WAIT;
        while self.is_running() && Instant::now() < deadline {
            std::thread::sleep(ProcessConfig::EXIT_POLL_INTERVAL);
        }
        if self.reaped.is_none() {
            error!("Server process {} could not be reaped", self.pid);
        }
    }

    async fn log_tail(&self) -> String {
        read_tail(self.log.path(), ProcessConfig::LOG_TAIL_BYTES).await
    }
}

impl Drop for ServerProcess {
    fn drop(&mut self) {
        if self.is_running() {
            warn!("Server process {} dropped while running, killing it", self.pid);
            self.kill_now();
        }
    }
}

/// Markers seen in the child's output so far.
#[derive(Debug, Default)]
struct LogScan {
    offset: u64,
    carry: Vec<u8>,
    server_running: bool,
    init_model_done: bool,
    address_in_use: bool,
}

impl LogScan {
    async fn poll(&mut self, path: &Path) {
        let chunk = match read_from(path, self.offset).await {
            Ok(chunk) => chunk,
            Err(e) => {
                debug!("Could not read server log {}: {}", path.display(), e);
                return;
            }
        };
        if chunk.is_empty() {
            return;
        }
        self.offset += chunk.len() as u64;

        let mut text = std::mem::take(&mut self.carry);
        text.extend_from_slice(&chunk);

        self.server_running |= contains(&text, ProcessConfig::SERVER_RUNNING_MARKER);
        self.init_model_done |= contains(&text, ProcessConfig::INIT_MODEL_DONE_MARKER);
        self.address_in_use |= contains(&text, ProcessConfig::ADDRESS_IN_USE_MARKER);

        // Keep enough bytes to match a marker split across two reads.
        let keep = 64.min(text.len());
        self.carry = text[text.len() - keep..].to_vec();
    }
}

fn contains(haystack: &[u8], needle: &str) -> bool {
    haystack
        .windows(needle.len())
        .any(|window| window == needle.as_bytes())
}

async fn read_from(path: &Path, offset: u64) -> std::io::Result<Vec<u8>> {
    let mut file = tokio::fs::File::open(path).await?;
    file.seek(SeekFrom::Start(offset)).await?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf).await?;
    Ok(buf)
}

async fn read_tail(path: &Path, max: usize) -> String {
    let len = tokio::fs::metadata(path).await.map(|m| m.len()).unwrap_or(0);
    let start = len.saturating_sub(max as u64);
    match read_from(path, start).await {
        Ok(bytes) => String::from_utf8_lossy(&bytes).trim().to_string(),
        Err(_) => String::new(),
    }
}

/// Process supervisor for the analysis server.
pub struct ProcessLauncher;

impl ProcessLauncher {
    /// Spawn the server and wait until it is ready.
    ///
    /// Ready means the child is alive, has printed its running marker and
    /// its port answers HTTP. The port answering on its own is not enough,
    /// since another server may hold it.
    ///
    /// Every failure path kills the spawned process before returning.
    pub async fn start(config: &LaunchConfig, client: &reqwest::Client) -> Result<ServerProcess> {
        let mut process = Self::spawn(config)?;
        match Self::wait_for_ready(&mut process, config, client).await {
            Ok(()) => Ok(process),
            Err(e) => {
                process.kill().await;
                Err(e)
            }
        }
    }

    fn spawn(config: &LaunchConfig) -> Result<ServerProcess> {
        let start_failed = |message: String, source: Option<std::io::Error>| VisionError::StartFailed {
            executable: config.executable.clone(),
            message,
            source,
        };

        if !config.executable.is_file() {
            return Err(start_failed("executable not found".to_string(), None));
        }

        let log = match &config.log_file {
            Some(path) => {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent).ok();
                }
                ProcessLog::File(path.clone())
            }
            None => ProcessLog::Temp(
                NamedTempFile::new()
                    .map_err(|e| start_failed("create temporary log file".to_string(), Some(e)))?,
            ),
        };
        let file = File::create(log.path())
            .map_err(|e| start_failed(format!("create log file {}", log.path().display()), Some(e)))?;
        let stderr_file = file
            .try_clone()
            .map_err(|e| start_failed("clone log file handle".to_string(), Some(e)))?;

        let mut cmd = Command::new(&config.executable);
        cmd.args(&config.args);
        match &config.working_dir {
            Some(dir) => {
                cmd.current_dir(dir);
            }
            None => {
                if let Some(parent) = config.executable.parent() {
                    cmd.current_dir(parent);
                }
            }
        }
        for (key, value) in &config.env_vars {
            cmd.env(key, value);
        }
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::from(file));
        cmd.stderr(Stdio::from(stderr_file));

        // Own process group so stop signals reach the server's workers too.
        #[cfg(unix)]
        {
            cmd.process_group(0);
        }

        #[cfg(windows)]
        {
            const CREATE_NEW_PROCESS_GROUP: u32 = 0x00000200;
            cmd.creation_flags(CREATE_NEW_PROCESS_GROUP);
        }

        info!(
            "Launching {} on {}:{}",
            config.executable.display(),
            config.host,
            config.port
        );

        let child = cmd.spawn().map_err(|e| {
            error!("Failed to spawn process: {}", e);
            start_failed(format!("spawn failed: {}", e), Some(e))
        })?;
        let pid = child.id();
        info!("Launched server process with PID {}", pid);

        Ok(ServerProcess {
            child,
            pid,
            host: config.host.clone(),
            port: config.port,
            log,
            reaped: None,
        })
    }

    async fn wait_for_ready(
        process: &mut ServerProcess,
        config: &LaunchConfig,
        client: &reqwest::Client,
    ) -> Result<()> {
        let url = config.probe_url();
        let start = Instant::now();
        let mut scan = LogScan::default();
        let mut announced = false;

        info!("Waiting for server at {} to become ready...", url);

        loop {
            scan.poll(process.log_path()).await;

            if scan.address_in_use {
                return Err(VisionError::PortInUse { port: config.port });
            }

            if let Some(status) = process.try_exit_status() {
                // The child may have logged its last words after the previous scan.
                scan.poll(process.log_path()).await;
                if scan.address_in_use {
                    return Err(VisionError::PortInUse { port: config.port });
                }
                return Err(VisionError::StartFailed {
                    executable: config.executable.clone(),
                    message: format!(
                        "exited with {} before becoming ready; log tail: {}",
                        status,
                        process.log_tail().await
                    ),
                    source: None,
                });
            }

            let initialized = scan.init_model_done || !config.wait_for_init_model;
            if scan.server_running && initialized {
                if !announced {
                    debug!("Server process {} reported running", process.pid());
                    announced = true;
                }
                if Self::check_health(client, &url).await {
                    info!("Server is ready after {:?}", start.elapsed());
                    return Ok(());
                }
            }

            if start.elapsed() >= config.ready_timeout {
                warn!("Server did not become ready within {:?}", config.ready_timeout);
                return Err(VisionError::StartTimeout {
                    host: config.host.clone(),
                    port: config.port,
                    timeout: config.ready_timeout,
                });
            }

            tokio::time::sleep(config.poll_interval).await;
        }
    }

    /// Any HTTP response counts once the child has reported running.
    async fn check_health(client: &reqwest::Client, url: &str) -> bool {
        match client
            .get(url)
            .timeout(NetworkConfig::PROBE_TIMEOUT)
            .send()
            .await
        {
            Ok(response) => {
                debug!("Readiness probe {} answered {}", url, response.status());
                true
            }
            Err(_) => false,
        }
    }
}
