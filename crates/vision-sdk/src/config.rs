//! Centralized configuration for the vision SDK.
//!
//! Tunables for network operations, process supervision and the shared
//! memory transport. Every retry and wait loop below is bounded.

use std::time::Duration;

/// Network-related configuration.
pub struct NetworkConfig;

impl NetworkConfig {
    pub const DEFAULT_HOST: &'static str = "127.0.0.1";
    pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(20);
    pub const PING_TIMEOUT: Duration = Duration::from_secs(5);
    pub const VERSION_TIMEOUT: Duration = Duration::from_secs(20);
    pub const PROBE_TIMEOUT: Duration = Duration::from_secs(1);
    pub const MAX_ATTEMPTS: u32 = 3;
    pub const RETRY_BASE_DELAY: Duration = Duration::from_millis(200);
    pub const RETRY_MAX_DELAY: Duration = Duration::from_secs(2);
    pub const POOL_MAX_IDLE_PER_HOST: usize = 4;
    pub const USER_AGENT: &'static str = "vision-sdk/0.1";
}

/// Configuration for starting and stopping the server process.
pub struct ProcessConfig;

impl ProcessConfig {
    pub const STARTUP_TIMEOUT: Duration = Duration::from_secs(60);
    pub const READY_POLL_INTERVAL: Duration = Duration::from_millis(250);
    pub const STOP_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
    pub const STOP_GRACE_PERIOD: Duration = Duration::from_secs(5);
    pub const KILL_WAIT: Duration = Duration::from_secs(1);
    pub const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(100);
    /// Restarts on a fresh port when an auto-chosen port turns out to be taken.
    pub const MAX_PORT_RETRIES: u32 = 3;
    pub const STOP_KEY_LEN: usize = 10;
    pub const LOG_TAIL_BYTES: usize = 2048;

    // Markers printed by the server on its stdout.
    pub const SERVER_RUNNING_MARKER: &'static str = "__SERVER_RUNNING__";
    pub const INIT_MODEL_DONE_MARKER: &'static str = "STOP_INIT_MODEL";
    pub const ADDRESS_IN_USE_MARKER: &'static str = "Address already in use";
}

/// Server installation layout.
pub struct InstallConfig;

impl InstallConfig {
    pub const PROJECT_MARKER_FILE: &'static str = "pekat_package.json";
    pub const SERVER_DIR_NAME: &'static str = "pekat_vision";
    #[cfg(windows)]
    pub const SERVER_BINARY_NAME: &'static str = "pekat_vision.exe";
    #[cfg(not(windows))]
    pub const SERVER_BINARY_NAME: &'static str = "pekat_vision";
    pub const LINUX_INSTALL_ROOT: &'static str = "/opt/PEKAT";
    pub const LINUX_INSTALL_PREFIX: &'static str = "pekat-vision-";
    pub const WINDOWS_INSTALL_PREFIX: &'static str = "PEKAT VISION ";
}

/// Shared memory transport configuration.
pub struct SharedMemoryConfig;

impl SharedMemoryConfig {
    pub const NAME_PREFIX: &'static str = "vsdk_";
    pub const NAME_RANDOM_LEN: usize = 8;
    /// Lowest server version implementing the shared memory endpoint.
    pub const MIN_SERVER_VERSION: (u64, u64, u64) = (3, 18, 0);
}

/// Defaults for synthetic payloads.
pub struct RandomImageConfig;

impl RandomImageConfig {
    pub const WIDTH: u32 = 512;
    pub const HEIGHT: u32 = 512;
    pub const CHANNELS: u8 = 3;
}
