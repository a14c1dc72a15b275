//! Physical host identity and resource lookup.

use serde::{Deserialize, Serialize};

/// Default SSH port used when a host address does not carry one.
pub const DEFAULT_SSH_PORT: u16 = 22;

/// An opaque physical host identifier.
///
/// Testbed hosts are addressed by name, optionally with an SSH port
/// (`parapluie-22.rennes:2222`). The driver treats the identifier as opaque
/// except for two derived views: the `(address, port)` pair used to open
/// connections and the cluster prefix used to cache capacity lookups.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HostId(String);

impl HostId {
    pub fn new<S: Into<String>>(name: S) -> Self {
        HostId(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The host address and SSH port, defaulting the port when the
    /// identifier does not carry one.
    pub fn addr(&self) -> (&str, u16) {
        match self.0.rfind(':') {
            Some(idx) => {
                let port = self.0[idx + 1..].parse().unwrap_or(DEFAULT_SSH_PORT);
                (&self.0[..idx], port)
            }
            None => (&self.0, DEFAULT_SSH_PORT),
        }
    }

    /// The host's short name: the address up to the first `.`.
    pub fn shortname(&self) -> &str {
        let (addr, _) = self.addr();
        addr.split('.').next().unwrap_or(addr)
    }

    /// The cluster a host belongs to. Testbed hosts are named
    /// `<cluster>-<n>`, and all hosts of a cluster share the same hardware,
    /// so capacity lookups are cached per cluster.
    pub fn cluster(&self) -> &str {
        let short = self.shortname();
        match short.rfind('-') {
            Some(idx) if short[idx + 1..].chars().all(|c| c.is_ascii_digit()) => &short[..idx],
            _ => short,
        }
    }
}

impl std::fmt::Display for HostId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for HostId {
    fn from(s: &str) -> Self {
        HostId(s.to_string())
    }
}

impl From<String> for HostId {
    fn from(s: String) -> Self {
        HostId(s)
    }
}

/// Raw hardware attributes of one physical host, as reported by the testbed
/// resource API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawCapacity {
    /// Total RAM in MB.
    pub ram_mb: u64,
    /// Number of hardware threads.
    pub cpu_count: u32,
}

/// Lookup of physical host attributes.
///
/// Implemented outside the core (testbed API client, static inventory
/// file, ...). Queried once per distinct cluster per placement run.
pub trait HostResources {
    fn host_capacity(&self, host: &HostId) -> Result<RawCapacity, failure::Error>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn addr_splits_port() {
        assert_eq!(HostId::new("paranoia-3:2222").addr(), ("paranoia-3", 2222));
        assert_eq!(HostId::new("paranoia-3").addr(), ("paranoia-3", 22));
    }

    #[test]
    fn cluster_strips_node_index() {
        assert_eq!(HostId::new("parapluie-22.rennes.grid5000.fr").cluster(), "parapluie");
        assert_eq!(HostId::new("parapluie-22").cluster(), "parapluie");
        // A name without a numeric suffix is its own cluster.
        assert_eq!(HostId::new("frontend").cluster(), "frontend");
        assert_eq!(HostId::new("node-a1").cluster(), "node-a1");
    }
}
