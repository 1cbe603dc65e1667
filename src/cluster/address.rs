//! Member addressing.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Identity of a cluster member.
///
/// Compared, ordered and hashed by `(host, port)`. The textual form
/// `host:port` round-trips through `Display`/`FromStr` and is what gets
/// embedded (escaped) in coordination-service path segments.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Address {
    pub host: String,
    pub port: u16,
}

impl Address {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self { host: host.into(), port }
    }

    /// Parse an address out of an escaped coordination-service path segment.
    pub(crate) fn from_path_segment(segment: &str) -> Result<Self, Error> {
        let raw = crate::zk::path_to_key(segment).map_err(Error::Coordination)?;
        let text = std::str::from_utf8(&raw)
            .map_err(|e| Error::Address(format!("non-utf8 member entry: {e}")))?;
        text.parse()
    }

    /// This address as an escaped path segment.
    pub(crate) fn to_path_segment(&self) -> String {
        crate::zk::key_to_path(self.to_string().as_bytes())
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for Address {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| Error::Address(format!("missing port in `{s}`")))?;
        if host.is_empty() {
            return Err(Error::Address(format!("empty host in `{s}`")));
        }
        let port = port
            .parse()
            .map_err(|e| Error::Address(format!("bad port in `{s}`: {e}")))?;
        Ok(Self { host: host.to_string(), port })
    }
}

/// Pluggable data-center lookup for an address.
///
/// The rebalance policy uses this to spread a partition's replicas across
/// data centers. The resolution is expected to be pure: the same address
/// must map to the same data center on every process.
pub type DataCenterResolver = Arc<dyn Fn(&Address) -> String + Send + Sync>;

/// Resolver that places every member in one data center, which reduces the
/// placement policy to pure load balancing.
pub fn single_data_center() -> DataCenterResolver {
    Arc::new(|_| "default".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_from_str_round_trip() {
        let addr = Address::new("10.0.0.7", 10_000);
        let parsed: Address = addr.to_string().parse().unwrap();
        assert_eq!(parsed, addr);
    }

    #[test]
    fn rejects_garbage() {
        assert!("nocolon".parse::<Address>().is_err());
        assert!(":9000".parse::<Address>().is_err());
        assert!("host:notaport".parse::<Address>().is_err());
    }

    #[test]
    fn ipv6_style_hosts_keep_last_colon_as_port_split() {
        let parsed: Address = "fe80::1:9000".parse().unwrap();
        assert_eq!(parsed.host, "fe80::1");
        assert_eq!(parsed.port, 9000);
    }

    #[test]
    fn ordering_is_by_host_then_port() {
        let a = Address::new("a", 2);
        let b = Address::new("b", 1);
        assert!(a < b);
        assert!(Address::new("a", 1) < a);
    }
}
