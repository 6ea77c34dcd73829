//! The client-side handle to one analysis server.
//!
//! An [`Instance`] either starts and owns a local server for a project, or
//! attaches to a server that is already running. Both kinds expose the same
//! `analyze` surface.
//!
//! ```text
//! Uninitialized -> Starting -> Ready -> Stopped
//!        \__________________/^
//!          (attach skips Starting)
//! ```

use crate::config::{NetworkConfig, ProcessConfig, RandomImageConfig};
use crate::error::{Result, VisionError};
use crate::input::{ImageInput, LoadedImage, RawImage};
use crate::net;
use crate::process::{
    check_project, find_installation, server_executable, LaunchConfig, ProcessLauncher,
    ServerArgs, ServerProcess,
};
use crate::result::AnalysisResult;
use crate::shm::SharedMemoryChannel;
use crate::transport::{AnalyzeOptions, AnalyzeRequest, Payload, RetryConfig, TransportClient};
use crate::version::{Capabilities, Capability, ServerVersion};
use rand::distr::Alphanumeric;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

/// How to reach (and possibly start) the server.
#[derive(Debug, Clone)]
pub struct InstanceConfig {
    /// Project directory served by a locally started server.
    pub project_path: Option<PathBuf>,
    /// Server installation directory. Searched for when unset.
    pub dist_path: Option<PathBuf>,
    pub host: String,
    /// Server port. A free port is picked for a local server when unset.
    pub port: Option<u16>,
    /// Attach to a running server instead of starting one.
    pub already_running: bool,
    /// Check that an attached server answers before returning.
    pub ping: bool,
    pub gpu: u32,
    pub disable_code: bool,
    pub tutorial_only: bool,
    /// Ask the server to return the context in the body rather than a header.
    pub context_in_body: bool,
    /// Wait until the server reports its models are initialized.
    pub wait_for_init_model: bool,
    pub startup_timeout: Duration,
    pub request_timeout: Duration,
    pub stop_grace_period: Duration,
    pub retry: RetryConfig,
    /// Where the server's output is written. A temporary file is used when unset.
    pub log_file: Option<PathBuf>,
    /// Use shared memory for raw images when the server supports it.
    pub shared_memory: bool,
    /// Also use shared memory with an attached server on a local address.
    pub shared_memory_for_attached: bool,
    /// Seed for the per-instance random generator.
    pub seed: Option<u64>,
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self {
            project_path: None,
            dist_path: None,
            host: NetworkConfig::DEFAULT_HOST.to_string(),
            port: None,
            already_running: false,
            ping: false,
            gpu: 0,
            disable_code: false,
            tutorial_only: false,
            context_in_body: false,
            wait_for_init_model: false,
            startup_timeout: ProcessConfig::STARTUP_TIMEOUT,
            request_timeout: NetworkConfig::REQUEST_TIMEOUT,
            stop_grace_period: ProcessConfig::STOP_GRACE_PERIOD,
            retry: RetryConfig::default(),
            log_file: None,
            shared_memory: true,
            shared_memory_for_attached: false,
            seed: None,
        }
    }
}

impl InstanceConfig {
    /// Start a local server for `project`.
    pub fn local(project: impl AsRef<Path>) -> Self {
        Self {
            project_path: Some(project.as_ref().to_path_buf()),
            ..Self::default()
        }
    }

    /// Attach to a server already listening on `host:port`.
    pub fn attach(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port: Some(port),
            already_running: true,
            ..Self::default()
        }
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn with_dist_path(mut self, path: impl AsRef<Path>) -> Self {
        self.dist_path = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn with_ping(mut self, ping: bool) -> Self {
        self.ping = ping;
        self
    }

    pub fn with_gpu(mut self, gpu: u32) -> Self {
        self.gpu = gpu;
        self
    }

    pub fn with_disable_code(mut self, disable: bool) -> Self {
        self.disable_code = disable;
        self
    }

    pub fn with_tutorial_only(mut self, tutorial_only: bool) -> Self {
        self.tutorial_only = tutorial_only;
        self
    }

    pub fn with_context_in_body(mut self, in_body: bool) -> Self {
        self.context_in_body = in_body;
        self
    }

    pub fn with_wait_for_init_model(mut self, wait: bool) -> Self {
        self.wait_for_init_model = wait;
        self
    }

    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_stop_grace_period(mut self, grace: Duration) -> Self {
        self.stop_grace_period = grace;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_log_file(mut self, path: impl AsRef<Path>) -> Self {
        self.log_file = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn with_shared_memory(mut self, enabled: bool) -> Self {
        self.shared_memory = enabled;
        self
    }

    pub fn with_shared_memory_for_attached(mut self, enabled: bool) -> Self {
        self.shared_memory_for_attached = enabled;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }
}

/// Lifecycle state of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    Uninitialized,
    Starting,
    Ready,
    Stopped,
}

/// Handle to one analysis server, local or remote.
///
/// `analyze` takes `&mut self`: one instance serves one caller at a time.
/// Use one instance per worker for parallel analysis.
pub struct Instance {
    host: String,
    port: u16,
    project_path: Option<PathBuf>,
    state: InstanceState,
    local_owner: bool,
    process: Option<ServerProcess>,
    stop_key: Option<String>,
    base_url: String,
    /// Released by `stop`, which closes the pooled connections.
    transport: Option<TransportClient>,
    shm: Option<SharedMemoryChannel>,
    server_version: Option<ServerVersion>,
    rng: StdRng,
    context_in_body: bool,
    stop_grace_period: Duration,
}

impl Instance {
    /// Start or attach to a server and return once it is ready.
    pub async fn new(config: InstanceConfig) -> Result<Self> {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };

        let (transport, process, stop_key) = if config.already_running {
            let port = config.port.ok_or_else(|| VisionError::Config {
                message: "attaching to a running server requires a port".to_string(),
            })?;
            let transport = Self::build_transport(&config, port)?;
            if config.ping {
                transport.ping().await?;
            }
            info!("Attached to server at {}", transport.base_url());
            (transport, None, None)
        } else {
            let (transport, process, stop_key) = Self::start_local(&config).await?;
            (transport, Some(process), Some(stop_key))
        };

        let local_owner = process.is_some();
        let shm_allowed = config.shared_memory
            && SharedMemoryChannel::is_supported()
            && (local_owner
                || (config.shared_memory_for_attached && net::is_local_host(&config.host)));
        let shm = shm_allowed.then(SharedMemoryChannel::unique);

        let port = process
            .as_ref()
            .map(ServerProcess::port)
            .or(config.port)
            .unwrap_or_default();

        debug!(
            "Instance {}:{} ready (local owner: {}, shared memory: {})",
            config.host,
            port,
            local_owner,
            shm.as_ref().map(|s| s.name()).unwrap_or("off")
        );

        Ok(Self {
            host: config.host.clone(),
            port,
            project_path: config.project_path.clone(),
            state: InstanceState::Ready,
            local_owner,
            process,
            stop_key,
            base_url: transport.base_url().to_string(),
            transport: Some(transport),
            shm,
            server_version: None,
            rng,
            context_in_body: config.context_in_body,
            stop_grace_period: config.stop_grace_period,
        })
    }

    fn build_transport(config: &InstanceConfig, port: u16) -> Result<TransportClient> {
        TransportClient::with_config(&config.host, port, config.request_timeout, config.retry.clone())
    }

    async fn start_local(config: &InstanceConfig) -> Result<(TransportClient, ServerProcess, String)> {
        let project = config.project_path.as_deref().ok_or_else(|| VisionError::Config {
            message: "starting a local server requires a project path".to_string(),
        })?;
        check_project(project)?;
        let install_dir = find_installation(config.dist_path.as_deref())?;
        let executable = server_executable(&install_dir);
        let stop_key = random_stop_key();

        let mut port_retries = 0;
        loop {
            let port = match config.port {
                Some(port) => port,
                None => net::find_free_port()?,
            };
            debug!("Instance state {:?} on port {}", InstanceState::Starting, port);

            let args = ServerArgs {
                project: project.to_path_buf(),
                host: config.host.clone(),
                port,
                stop_key: stop_key.clone(),
                gpu: config.gpu,
                disable_code: config.disable_code,
                tutorial_only: config.tutorial_only,
            };
            let mut launch = LaunchConfig::new(&executable, &config.host, port)
                .with_args(args.to_args())
                .with_ready_timeout(config.startup_timeout)
                .with_wait_for_init_model(config.wait_for_init_model);
            if let Some(log_file) = &config.log_file {
                launch = launch.with_log_file(log_file);
            }

            let transport = Self::build_transport(config, port)?;
            match ProcessLauncher::start(&launch, transport.client()).await {
                Ok(process) => return Ok((transport, process, stop_key)),
                Err(VisionError::PortInUse { port })
                    if config.port.is_none() && port_retries < ProcessConfig::MAX_PORT_RETRIES =>
                {
                    port_retries += 1;
                    warn!(
                        "Port {} was taken during startup, retrying on a new port ({}/{})",
                        port,
                        port_retries,
                        ProcessConfig::MAX_PORT_RETRIES
                    );
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn state(&self) -> InstanceState {
        self.state
    }

    /// Whether this instance started the server and will stop it.
    pub fn is_local_owner(&self) -> bool {
        self.local_owner
    }

    pub fn project_path(&self) -> Option<&Path> {
        self.project_path.as_deref()
    }

    /// PID of the owned server process.
    pub fn pid(&self) -> Option<u32> {
        self.process.as_ref().map(ServerProcess::pid)
    }

    /// File receiving the owned server's output.
    pub fn log_path(&self) -> Option<&Path> {
        self.process.as_ref().map(ServerProcess::log_path)
    }

    /// Name of the shared memory segment, when the fast path is enabled.
    pub fn shm_name(&self) -> Option<&str> {
        self.shm.as_ref().map(SharedMemoryChannel::name)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn not_running(&self) -> VisionError {
        VisionError::InstanceNotRunning {
            host: self.host.clone(),
            port: self.port,
        }
    }

    fn ensure_ready(&self) -> Result<()> {
        if self.state == InstanceState::Ready {
            Ok(())
        } else {
            Err(self.not_running())
        }
    }

    /// The transport of a ready instance.
    fn transport(&self) -> Result<&TransportClient> {
        self.ensure_ready()?;
        self.transport.as_ref().ok_or_else(|| self.not_running())
    }

    /// Check that the server answers.
    pub async fn ping(&self) -> Result<()> {
        self.transport()?.ping().await
    }

    /// Version reported by the server, fetched once.
    ///
    /// Network failures yield `Unknown` without caching, so a later call asks again.
    pub async fn server_version(&mut self) -> ServerVersion {
        if let Some(version) = self.server_version {
            return version;
        }
        let Ok(transport) = self.transport() else {
            return ServerVersion::Unknown;
        };
        match transport.server_version().await {
            Ok(version) => {
                self.server_version = Some(version);
                version
            }
            Err(e) => {
                debug!("Could not read server version: {}", e);
                ServerVersion::Unknown
            }
        }
    }

    /// Optional protocol features the server implements.
    pub async fn capabilities(&mut self) -> Capabilities {
        self.server_version().await.capabilities()
    }

    /// Analyze one image.
    ///
    /// Raw pixel input travels through shared memory when this instance may
    /// use it and the server supports it, otherwise in the request body.
    pub async fn analyze(
        &mut self,
        image: impl Into<ImageInput>,
        options: impl Into<AnalyzeOptions>,
    ) -> Result<AnalysisResult> {
        self.ensure_ready()?;
        let options = options.into();

        let payload = match image.into().load().await? {
            LoadedImage::Encoded(bytes) => Payload::Encoded(bytes),
            LoadedImage::Raw(raw) => self.raw_payload(&raw).await,
        };

        let request = AnalyzeRequest {
            payload,
            options,
            context_in_body: self.context_in_body,
        };
        let response = self.transport()?.analyze(&request).await?;
        Ok(response.into())
    }

    async fn raw_payload(&mut self, raw: &RawImage) -> Payload {
        if self.shm.is_some() && self.capabilities().await.contains(Capability::SharedMemory) {
            if let Some(shm) = self.shm.as_mut() {
                match shm.write(raw.pixels()) {
                    Ok(reference) => {
                        debug!(
                            "Sending {}x{} image through shared memory {} (generation {})",
                            raw.width(),
                            raw.height(),
                            reference.name,
                            reference.generation
                        );
                        return Payload::SharedMemory {
                            width: raw.width(),
                            height: raw.height(),
                            reference,
                        };
                    }
                    Err(e) => warn!("Shared memory write failed, sending in body: {}", e),
                }
            }
        }

        Payload::Raw {
            width: raw.width(),
            height: raw.height(),
            pixels: raw.pixel_bytes(),
        }
    }

    /// Analyze a random 512x512 RGB image from the instance's generator.
    pub async fn send_random(&mut self, options: impl Into<AnalyzeOptions>) -> Result<AnalysisResult> {
        self.send_random_with_shape(
            RandomImageConfig::WIDTH,
            RandomImageConfig::HEIGHT,
            RandomImageConfig::CHANNELS,
            options,
        )
        .await
    }

    /// Analyze a random image of the given shape.
    pub async fn send_random_with_shape(
        &mut self,
        width: u32,
        height: u32,
        channels: u8,
        options: impl Into<AnalyzeOptions>,
    ) -> Result<AnalysisResult> {
        self.ensure_ready()?;
        let image = RawImage::random(&mut self.rng, width, height, channels)?;
        self.analyze(image, options).await
    }

    /// Stop the instance.
    ///
    /// An owned server is asked to stop over HTTP, then terminated by signal
    /// if it does not exit within the grace period. The shared memory segment
    /// and the connection pool are released either way. Calling `stop` again
    /// is a no-op.
    pub async fn stop(&mut self) -> Result<()> {
        if self.state == InstanceState::Stopped {
            return Ok(());
        }
        self.state = InstanceState::Stopped;
        info!("Stopping instance {}:{}", self.host, self.port);

        let mut outcome = Ok(());
        let transport = self.transport.take();
        if let Some(mut process) = self.process.take() {
            if let (Some(key), Some(transport)) = (&self.stop_key, &transport) {
                match transport.request_stop(key).await {
                    Ok(()) => {
                        process.wait_for_exit(self.stop_grace_period).await;
                    }
                    Err(e) => debug!("Stop request failed, signalling instead: {}", e),
                }
            }
            outcome = process.terminate(self.stop_grace_period).await;
        }

        if let Some(shm) = self.shm.as_mut() {
            shm.close();
        }
        drop(transport);
        debug!("Released connection pool for {}", self.base_url);
        outcome
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        if self.state == InstanceState::Stopped {
            return;
        }
        if let Some(mut process) = self.process.take() {
            warn!(
                "Instance {}:{} dropped without stop(), killing server {}",
                self.host,
                self.port,
                process.pid()
            );
            process.kill_now();
        }
        if let Some(shm) = self.shm.as_mut() {
            shm.close();
        }
    }
}

impl std::fmt::Debug for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instance")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("state", &self.state)
            .field("local_owner", &self.local_owner)
            .field("pid", &self.pid())
            .field("shm", &self.shm_name())
            .field("server_version", &self.server_version)
            .finish()
    }
}

/// Key the server requires on its `/stop` endpoint.
fn random_stop_key() -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(ProcessConfig::STOP_KEY_LEN)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_builders() {
        let local = InstanceConfig::local("/data/project").with_port(8100).with_gpu(1);
        assert!(!local.already_running);
        assert_eq!(local.project_path.as_deref(), Some(Path::new("/data/project")));
        assert_eq!(local.port, Some(8100));
        assert_eq!(local.host, NetworkConfig::DEFAULT_HOST);

        let attached = InstanceConfig::attach("10.0.0.5", 8000).with_seed(7);
        assert!(attached.already_running);
        assert!(!attached.ping);
        assert_eq!(attached.port, Some(8000));
        assert_eq!(attached.seed, Some(7));
    }

    #[test]
    fn test_stop_key() {
        let key = random_stop_key();
        assert_eq!(key.len(), ProcessConfig::STOP_KEY_LEN);
        assert!(key.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(key, random_stop_key());
    }

    #[tokio::test]
    async fn test_local_without_project_is_config_error() {
        let config = InstanceConfig::default();
        assert!(matches!(
            Instance::new(config).await,
            Err(VisionError::Config { .. })
        ));
    }

    #[tokio::test]
    async fn test_local_with_missing_project() {
        let temp = tempfile::TempDir::new().unwrap();
        let config = InstanceConfig::local(temp.path().join("missing"));
        assert!(matches!(
            Instance::new(config).await,
            Err(VisionError::ProjectNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_attach_without_ping_and_stop_twice() {
        let port = net::find_free_port().unwrap();
        let mut instance = Instance::new(InstanceConfig::attach("127.0.0.1", port))
            .await
            .unwrap();
        assert_eq!(instance.state(), InstanceState::Ready);
        assert!(!instance.is_local_owner());
        assert_eq!(instance.pid(), None);
        assert_eq!(instance.shm_name(), None);

        instance.stop().await.unwrap();
        instance.stop().await.unwrap();
        assert_eq!(instance.state(), InstanceState::Stopped);
        assert!(instance.transport.is_none());
        assert_eq!(instance.base_url(), format!("http://127.0.0.1:{}", port));
        assert!(matches!(
            instance.ping().await,
            Err(VisionError::InstanceNotRunning { .. })
        ));
        assert!(instance.server_version().await.is_unknown());

        let err = instance
            .analyze(vec![1u8, 2, 3], AnalyzeOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, VisionError::InstanceNotRunning { port: p, .. } if p == port));
    }

    #[tokio::test]
    async fn test_attach_with_ping_fails_fast() {
        let port = net::find_free_port().unwrap();
        let config = InstanceConfig::attach("127.0.0.1", port).with_ping(true);
        let err = Instance::new(config).await.unwrap_err();
        assert!(err.is_retryable());
    }
}
