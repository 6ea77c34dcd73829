//! Platform-specific process signalling.
//!
//! Server processes are spawned as leaders of their own process group, so
//! signals go to the whole group and take down any workers the server forked.

use crate::error::{Result, VisionError};
use tracing::{debug, warn};

/// Check if a process with the given PID is alive.
///
/// # Platform Behavior
/// - **Unix**: `kill(pid, 0)`; an unreaped zombie still counts as alive
/// - **Windows**: `tasklist` filtered by PID
pub fn is_process_alive(pid: u32) -> bool {
    #[cfg(unix)]
    {
        use nix::sys::signal::kill;
        use nix::unistd::Pid;

        let Ok(raw) = i32::try_from(pid) else {
            return false;
        };
        kill(Pid::from_raw(raw), None).is_ok()
    }

    #[cfg(windows)]
    {
        std::process::Command::new("tasklist")
            .args(["/FI", &format!("PID eq {}", pid), "/NH"])
            .output()
            .map(|o| String::from_utf8_lossy(&o.stdout).contains(&pid.to_string()))
            .unwrap_or(false)
    }

    #[cfg(not(any(unix, windows)))]
    {
        warn!("Process alive check not implemented for this platform");
        true
    }
}

/// Ask the process group led by `pid` to shut down.
///
/// # Platform Behavior
/// - **Unix**: `SIGTERM` to the process group
/// - **Windows**: no graceful signal exists for console-less children; this is a no-op
///   and the caller escalates to [`force_kill_group`] after its grace period
pub fn request_termination(pid: u32) -> Result<()> {
    #[cfg(unix)]
    {
        send_group_signal(pid, nix::sys::signal::Signal::SIGTERM)
    }

    #[cfg(not(unix))]
    {
        debug!("No graceful termination signal for process {} on this platform", pid);
        Ok(())
    }
}

/// Forcefully kill the process group led by `pid`.
///
/// # Platform Behavior
/// - **Unix**: `SIGKILL` to the process group
/// - **Windows**: `taskkill /PID {pid} /F /T`
pub fn force_kill_group(pid: u32) -> Result<()> {
    #[cfg(unix)]
    {
        send_group_signal(pid, nix::sys::signal::Signal::SIGKILL)
    }

    #[cfg(windows)]
    {
        let output = std::process::Command::new("taskkill")
            .args(["/PID", &pid.to_string(), "/F", "/T"])
            .output()
            .map_err(|e| VisionError::ShutdownFailed {
                pid,
                message: format!("failed to run taskkill: {}", e),
            })?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        // "not found" means the process is already gone
        if stderr.contains("not found") || stderr.contains("not running") {
            Ok(())
        } else {
            Err(VisionError::ShutdownFailed {
                pid,
                message: format!("taskkill failed: {}", stderr.trim()),
            })
        }
    }

    #[cfg(not(any(unix, windows)))]
    {
        Err(VisionError::ShutdownFailed {
            pid,
            message: "process termination not implemented for this platform".into(),
        })
    }
}

#[cfg(unix)]
fn send_group_signal(pid: u32, signal: nix::sys::signal::Signal) -> Result<()> {
    use nix::errno::Errno;
    use nix::sys::signal::killpg;
    use nix::unistd::Pid;

    let raw = i32::try_from(pid).map_err(|_| VisionError::ShutdownFailed {
        pid,
        message: "pid out of range".to_string(),
    })?;

    debug!("Sending {:?} to process group {}", signal, pid);
    match killpg(Pid::from_raw(raw), signal) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => {
            warn!("Failed to send {:?} to process group {}: {}", signal, pid, e);
            Err(VisionError::ShutdownFailed {
                pid,
                message: format!("{:?} failed: {}", signal, e),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_process_alive_self() {
        assert!(is_process_alive(std::process::id()));
    }

    #[test]
    fn test_is_process_alive_nonexistent() {
        assert!(!is_process_alive(4_000_000_000));
    }

    #[cfg(unix)]
    #[test]
    fn test_signalling_missing_group_is_ok() {
        // 4_000_000 is above the default pid_max, so no such group exists.
        assert!(request_termination(4_000_000).is_ok());
        assert!(force_kill_group(4_000_000).is_ok());
    }
}
