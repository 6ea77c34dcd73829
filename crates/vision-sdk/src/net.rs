//! Address helpers for locating a server on this machine.

use crate::error::{Result, VisionError};
use std::net::{IpAddr, Ipv4Addr, TcpListener, ToSocketAddrs, UdpSocket};
use tracing::debug;

/// Ask the OS for a currently unused TCP port on localhost.
///
/// The port is released again before returning, so another process may still
/// grab it; the supervisor handles that race by restarting on a new port.
pub fn find_free_port() -> Result<u16> {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).map_err(|e| VisionError::Io {
        message: format!("failed to reserve a free port: {}", e),
        path: None,
        source: Some(e),
    })?;
    let port = listener.local_addr()?.port();
    debug!("Picked free port {}", port);
    Ok(port)
}

/// Host to connect to for a server bound to `host`.
///
/// A server listening on the unspecified address is reached over loopback.
pub fn connect_host(host: &str) -> &str {
    match host {
        "0.0.0.0" => "127.0.0.1",
        "::" | "[::]" => "[::1]",
        other => other,
    }
}

/// Whether `host` names this machine: loopback, unspecified, or an address
/// assigned to one of the local interfaces.
pub fn is_local_host(host: &str) -> bool {
    if host.eq_ignore_ascii_case("localhost") {
        return true;
    }

    let trimmed = host.trim_start_matches('[').trim_end_matches(']');
    let addrs: Vec<IpAddr> = match trimmed.parse::<IpAddr>() {
        Ok(ip) => vec![ip],
        Err(_) => match (trimmed, 0u16).to_socket_addrs() {
            Ok(resolved) => resolved.map(|a| a.ip()).collect(),
            Err(_) => return false,
        },
    };

    // Binding succeeds only for addresses owned by a local interface.
    addrs.into_iter().any(|ip| {
        ip.is_loopback() || ip.is_unspecified() || UdpSocket::bind((ip, 0)).is_ok()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_free_port() {
        let port = find_free_port().unwrap();
        assert!(port > 0);
        assert!(TcpListener::bind((Ipv4Addr::LOCALHOST, port)).is_ok());
    }

    #[test]
    fn test_local_hosts() {
        assert!(is_local_host("127.0.0.1"));
        assert!(is_local_host("localhost"));
        assert!(is_local_host("0.0.0.0"));
        assert!(is_local_host("::1"));
    }

    #[test]
    fn test_remote_hosts() {
        // TEST-NET-3, reserved for documentation and never assigned locally
        assert!(!is_local_host("203.0.113.7"));
        assert!(!is_local_host("not a host name"));
    }

    #[test]
    fn test_connect_host() {
        assert_eq!(connect_host("0.0.0.0"), "127.0.0.1");
        assert_eq!(connect_host("10.0.0.5"), "10.0.0.5");
    }
}
