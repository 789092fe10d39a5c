//! Protocol constants and client version parsing.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use crate::ProtocolError;

/// Version of the upgraded (binary) protocol this server speaks.
pub const PROTOCOL_VERSION: u32 = 1;

/// Legacy server version this server is compatible with.
pub const LEGACY_SERVER_VERSION: &str = "1.5.5.0";

/// Sender identifier appended to every packet the server emits.
pub const LEGACY_SERVER_ID: &str = "133333337";

/// Oldest client version accepted by default.
pub const MIN_CLIENT_VERSION: &str = "1.5.5.0";

/// Agent string reported by the status endpoint.
pub fn agent() -> String {
    format!("GDTMP/{LEGACY_SERVER_VERSION} Nepenthe/{PROTOCOL_VERSION}")
}

/// A dotted numeric version such as `1.5.5.0`.
///
/// Components compare numerically and missing trailing components count
/// as zero, so `1.5` equals `1.5.0.0` and `1.10` is newer than `1.9`.
#[derive(Debug, Clone)]
pub struct ClientVersion(Vec<u32>);

impl ClientVersion {
    pub fn from_components(components: Vec<u32>) -> Self {
        Self(components)
    }

    pub fn components(&self) -> &[u32] {
        &self.0
    }

    fn component(&self, i: usize) -> u32 {
        self.0.get(i).copied().unwrap_or(0)
    }
}

impl FromStr for ClientVersion {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(ProtocolError::InvalidMessage("empty version".into()));
        }
        s.split('.')
            .map(|part| part.parse::<u32>())
            .collect::<Result<Vec<_>, _>>()
            .map(ClientVersion)
            .map_err(|_| ProtocolError::InvalidMessage(format!("invalid version {s:?}")))
    }
}

impl PartialEq for ClientVersion {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for ClientVersion {}

impl PartialOrd for ClientVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ClientVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        let len = self.0.len().max(other.0.len());
        (0..len)
            .map(|i| self.component(i).cmp(&other.component(i)))
            .find(|ord| ord.is_ne())
            .unwrap_or(Ordering::Equal)
    }
}

impl fmt::Display for ClientVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, part) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ".")?;
            }
            write!(f, "{part}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(s: &str) -> ClientVersion {
        s.parse().unwrap()
    }

    #[test]
    fn test_numeric_not_lexicographic() {
        assert!(v("1.10.0") > v("1.9.9"));
        assert!(v("0.5.1") < v("1.5.5.0"));
    }

    #[test]
    fn test_missing_components_are_zero() {
        assert_eq!(v("1.5"), v("1.5.0.0"));
        assert!(v("1.5.5.1") > v("1.5.5"));
    }

    #[test]
    fn test_display_round_trip() {
        assert_eq!(v("1.5.5.0").to_string(), "1.5.5.0");
    }

    #[test]
    fn test_invalid_versions() {
        assert!("".parse::<ClientVersion>().is_err());
        assert!("1.x".parse::<ClientVersion>().is_err());
        assert!("1..2".parse::<ClientVersion>().is_err());
    }

    #[test]
    fn test_agent_string() {
        assert_eq!(agent(), "GDTMP/1.5.5.0 Nepenthe/1");
    }
}
