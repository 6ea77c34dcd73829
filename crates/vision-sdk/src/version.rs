//! Server version parsing and capability negotiation.
//!
//! Version reporting is best-effort: [`ServerVersion::parse`] never fails and
//! falls back to [`ServerVersion::Unknown`], which supports no optional
//! protocol features.

use crate::config::SharedMemoryConfig;
use std::collections::BTreeSet;
use std::fmt;

/// Parsed server version.
///
/// `Unknown` orders below every known version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ServerVersion {
    /// The server did not report a parsable version.
    Unknown,
    /// A `(major, minor, patch)` triple.
    Known { major: u64, minor: u64, patch: u64 },
}

impl ServerVersion {
    pub const fn new(major: u64, minor: u64, patch: u64) -> Self {
        ServerVersion::Known {
            major,
            minor,
            patch,
        }
    }

    /// Parse a version string, returning `Unknown` when it cannot be parsed.
    ///
    /// Accepts strict semver (`3.18.1`, `3.18.1-beta`) as well as looser forms
    /// such as `v3.18`, `3.18.1.dev2` or a quoted body from the version endpoint.
    pub fn parse(input: &str) -> Self {
        let trimmed = input.trim().trim_matches('"');
        let trimmed = trimmed.strip_prefix('v').unwrap_or(trimmed);

        if let Ok(v) = semver::Version::parse(trimmed) {
            return Self::new(v.major, v.minor, v.patch);
        }

        let mut parts = [0u64; 3];
        let mut count = 0;
        for component in trimmed.split('.') {
            if count == parts.len() {
                break;
            }
            let digits: &str = match component.find(|c: char| !c.is_ascii_digit()) {
                Some(0) => break,
                Some(end) => &component[..end],
                None => component,
            };
            match digits.parse::<u64>() {
                Ok(n) => parts[count] = n,
                Err(_) => break,
            }
            count += 1;
            if digits.len() != component.len() {
                break;
            }
        }

        if count == 0 {
            ServerVersion::Unknown
        } else {
            Self::new(parts[0], parts[1], parts[2])
        }
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self, ServerVersion::Unknown)
    }

    /// Capabilities implemented by a server of this version.
    pub fn capabilities(&self) -> Capabilities {
        Capabilities::for_version(*self)
    }
}

impl fmt::Display for ServerVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerVersion::Unknown => write!(f, "unknown"),
            ServerVersion::Known {
                major,
                minor,
                patch,
            } => write!(f, "{}.{}.{}", major, minor, patch),
        }
    }
}

/// Optional protocol features a server may implement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Capability {
    /// `/analyze_image_shared_memory` reads raw pixels from a named segment.
    SharedMemory,
    /// `/version` reports the real server version.
    VersionEndpoint,
}

impl Capability {
    /// Lowest server version implementing this capability.
    pub fn min_version(&self) -> ServerVersion {
        match self {
            Capability::SharedMemory | Capability::VersionEndpoint => {
                let (major, minor, patch) = SharedMemoryConfig::MIN_SERVER_VERSION;
                ServerVersion::new(major, minor, patch)
            }
        }
    }

    const ALL: [Capability; 2] = [Capability::SharedMemory, Capability::VersionEndpoint];
}

/// Set of capabilities derived from a server version.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Capabilities(BTreeSet<Capability>);

impl Capabilities {
    pub fn for_version(version: ServerVersion) -> Self {
        if version.is_unknown() {
            return Self::default();
        }
        Self(
            Capability::ALL
                .iter()
                .copied()
                .filter(|c| version >= c.min_version())
                .collect(),
        )
    }

    pub fn contains(&self, capability: Capability) -> bool {
        self.0.contains(&capability)
    }

    pub fn iter(&self) -> impl Iterator<Item = Capability> + '_ {
        self.0.iter().copied()
    }
}

/// Whether a server of this version accepts the shared memory transport.
pub fn supports_shared_memory(version: ServerVersion) -> bool {
    version.capabilities().contains(Capability::SharedMemory)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_semver() {
        assert_eq!(ServerVersion::parse("2.3.1"), ServerVersion::new(2, 3, 1));
        assert_eq!(
            ServerVersion::parse("3.18.0-beta.1"),
            ServerVersion::new(3, 18, 0)
        );
    }

    #[test]
    fn test_parse_loose_forms() {
        assert_eq!(ServerVersion::parse("v3.18"), ServerVersion::new(3, 18, 0));
        assert_eq!(ServerVersion::parse("3.19.2.dev4"), ServerVersion::new(3, 19, 2));
        assert_eq!(ServerVersion::parse("3.20.1rc1"), ServerVersion::new(3, 20, 1));
        assert_eq!(ServerVersion::parse("\"3.18.0\"\n"), ServerVersion::new(3, 18, 0));
    }

    #[test]
    fn test_parse_garbage_is_unknown() {
        assert_eq!(ServerVersion::parse("not-a-version"), ServerVersion::Unknown);
        assert_eq!(ServerVersion::parse(""), ServerVersion::Unknown);
        assert_eq!(ServerVersion::parse("<html>404</html>"), ServerVersion::Unknown);
    }

    #[test]
    fn test_ordering() {
        assert!(ServerVersion::parse("2.3.1") > ServerVersion::parse("2.2.0"));
        assert!(ServerVersion::parse("3.10.0") > ServerVersion::parse("3.9.9"));
        assert!(ServerVersion::Unknown < ServerVersion::new(0, 0, 0));
    }

    #[test]
    fn test_shared_memory_gate() {
        assert!(supports_shared_memory(ServerVersion::new(3, 18, 0)));
        assert!(supports_shared_memory(ServerVersion::new(4, 0, 0)));
        assert!(!supports_shared_memory(ServerVersion::new(3, 17, 9)));
        assert!(!supports_shared_memory(ServerVersion::new(0, 0, 0)));
        assert!(!supports_shared_memory(ServerVersion::Unknown));
    }

    #[test]
    fn test_capabilities_for_old_server_are_empty() {
        let caps = ServerVersion::new(3, 10, 2).capabilities();
        assert_eq!(caps.iter().count(), 0);
    }

    #[test]
    fn test_display() {
        assert_eq!(ServerVersion::new(3, 18, 1).to_string(), "3.18.1");
        assert_eq!(ServerVersion::Unknown.to_string(), "unknown");
    }
}
