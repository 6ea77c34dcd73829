//! Server installation discovery and command line construction.

use crate::config::InstallConfig;
use crate::error::{Result, VisionError};
use crate::version::ServerVersion;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Locate the server installation directory.
///
/// An explicit directory must exist. Without one, the platform default
/// location is searched and the highest installed version wins.
pub fn find_installation(explicit: Option<&Path>) -> Result<PathBuf> {
    if let Some(dir) = explicit {
        if dir.exists() {
            return Ok(dir.to_path_buf());
        }
        return Err(VisionError::InstallationMissing(dir.to_path_buf()));
    }

    let (root, prefix) = default_search_location()?;
    find_installation_in(&root, prefix)
}

fn default_search_location() -> Result<(PathBuf, &'static str)> {
    #[cfg(windows)]
    {
        let program_files = std::env::var_os("PROGRAMFILES").ok_or_else(|| {
            VisionError::InstallationNotFound {
                searched: PathBuf::from("%PROGRAMFILES%"),
            }
        })?;
        Ok((
            PathBuf::from(program_files),
            InstallConfig::WINDOWS_INSTALL_PREFIX,
        ))
    }

    #[cfg(target_os = "linux")]
    {
        Ok((
            PathBuf::from(InstallConfig::LINUX_INSTALL_ROOT),
            InstallConfig::LINUX_INSTALL_PREFIX,
        ))
    }

    #[cfg(not(any(windows, target_os = "linux")))]
    {
        Err(VisionError::InstallationNotFound {
            searched: PathBuf::from("<no default location on this platform>"),
        })
    }
}

/// Pick the highest-versioned `<root>/<prefix><version>` directory.
pub fn find_installation_in(root: &Path, prefix: &str) -> Result<PathBuf> {
    let not_found = || VisionError::InstallationNotFound {
        searched: root.to_path_buf(),
    };

    let entries = fs::read_dir(root).map_err(|_| not_found())?;

    let best = entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().is_dir())
        .filter_map(|entry| {
            let name = entry.file_name().to_string_lossy().into_owned();
            let version = ServerVersion::parse(name.strip_prefix(prefix)?);
            Some((version, entry.path()))
        })
        .max_by(|a, b| a.0.cmp(&b.0));

    match best {
        Some((version, path)) => {
            info!("Using server installation {} ({})", path.display(), version);
            Ok(path)
        }
        None => Err(not_found()),
    }
}

/// Path of the server binary inside an installation directory.
pub fn server_executable(install_dir: &Path) -> PathBuf {
    install_dir
        .join(InstallConfig::SERVER_DIR_NAME)
        .join(InstallConfig::SERVER_BINARY_NAME)
}

/// Fail unless `project` looks like a server project directory.
pub fn check_project(project: &Path) -> Result<()> {
    let marker = project.join(InstallConfig::PROJECT_MARKER_FILE);
    if marker.is_file() {
        debug!("Found project marker {}", marker.display());
        Ok(())
    } else {
        Err(VisionError::ProjectNotFound(project.to_path_buf()))
    }
}

/// Command line options understood by the server binary.
#[derive(Debug, Clone)]
pub struct ServerArgs {
    pub project: PathBuf,
    pub host: String,
    pub port: u16,
    pub stop_key: String,
    pub gpu: u32,
    pub disable_code: bool,
    pub tutorial_only: bool,
}

impl ServerArgs {
    pub fn to_args(&self) -> Vec<String> {
        let mut args = vec![
            "-data".to_string(),
            self.project.to_string_lossy().into_owned(),
            "-port".to_string(),
            self.port.to_string(),
            "-host".to_string(),
            self.host.clone(),
            "-stop_key".to_string(),
            self.stop_key.clone(),
        ];
        if self.gpu != 0 {
            args.extend(["-gpu".to_string(), self.gpu.to_string()]);
        }
        if self.disable_code {
            args.extend(["-disable_code".to_string(), "true".to_string()]);
        }
        if self.tutorial_only {
            args.extend(["-tutorial_only".to_string(), "true".to_string()]);
        }
        args
    }
}
