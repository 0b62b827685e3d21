//! Hosts, the fleet directory, and SSH credentials.

use std::collections::HashSet;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::{ConfigError, HostId};

/// A virtual machine in the fleet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Host {
    /// Logical host identifier.
    pub id: HostId,

    /// Cloud project the instance lives in.
    #[serde(default)]
    pub project: String,

    /// Cloud zone the instance lives in.
    #[serde(default)]
    pub zone: String,

    /// Instance name as known to the cloud provider.
    #[serde(default)]
    pub instance_name: String,

    /// Pre-resolved external address used to connect. When absent the
    /// address is looked up through a resolver.
    #[serde(default)]
    pub address: Option<String>,

    /// Address advertised to other shards in execute mode.
    #[serde(default)]
    pub private_address: Option<String>,
}

impl Host {
    /// Create a host with only an id. The instance name defaults to the id.
    pub fn new(id: impl Into<HostId>) -> Self {
        let id = id.into();
        Self {
            instance_name: id.as_str().to_string(),
            id,
            project: String::new(),
            zone: String::new(),
            address: None,
            private_address: None,
        }
    }

    /// Builder method to set the cloud location.
    pub fn with_location(mut self, project: impl Into<String>, zone: impl Into<String>) -> Self {
        self.project = project.into();
        self.zone = zone.into();
        self
    }

    /// Builder method to set a pre-resolved connect address.
    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    /// Builder method to set the address advertised to peers.
    pub fn with_private_address(mut self, address: impl Into<String>) -> Self {
        self.private_address = Some(address.into());
        self
    }
}

/// Ordered list of hosts. Directory order is shard order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HostDirectory {
    hosts: Vec<Host>,
}

impl HostDirectory {
    /// Build a directory, rejecting duplicate ids.
    pub fn new(hosts: Vec<Host>) -> Result<Self, ConfigError> {
        let mut seen = HashSet::new();
        for host in &hosts {
            if !seen.insert(host.id.as_str()) {
                return Err(ConfigError::DuplicateHost(host.id.to_string()));
            }
        }
        Ok(Self { hosts })
    }

    /// All hosts in directory order.
    pub fn hosts(&self) -> &[Host] {
        &self.hosts
    }

    /// Look up a host by id.
    pub fn get(&self, id: &HostId) -> Option<&Host> {
        self.hosts.iter().find(|h| &h.id == id)
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    /// The first `count` hosts, one per shard.
    pub fn shard_hosts(&self, count: usize) -> Result<&[Host], ConfigError> {
        if count > self.hosts.len() {
            return Err(ConfigError::NotEnoughHosts {
                requested: count,
                available: self.hosts.len(),
            });
        }
        Ok(&self.hosts[..count])
    }

    /// Private addresses of the first `count` hosts, ascending shard index.
    pub fn peer_addresses(&self, count: usize) -> Result<Vec<String>, ConfigError> {
        self.shard_hosts(count)?
            .iter()
            .map(|h| {
                let address = h
                    .private_address
                    .as_deref()
                    .map(str::trim)
                    .ok_or_else(|| ConfigError::MissingPeerAddress(h.id.to_string()))?;
                if !is_bare_address(address) {
                    return Err(ConfigError::InvalidPeerAddress {
                        host: h.id.to_string(),
                        address: address.to_string(),
                    });
                }
                Ok(address.to_string())
            })
            .collect()
    }
}

/// Host name or IPv4 address with no port. Addresses end up in a remote
/// shell line with a port appended, so nothing else is accepted.
pub(crate) fn is_bare_address(address: &str) -> bool {
    !address.is_empty()
        && !address.starts_with('-')
        && address
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-'))
}

/// SSH login material supplied by the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    /// Remote login user.
    pub user: String,

    /// Private key file.
    pub identity_file: PathBuf,
}

impl Credentials {
    pub fn new(user: impl Into<String>, identity_file: impl Into<PathBuf>) -> Self {
        Self {
            user: user.into(),
            identity_file: identity_file.into(),
        }
    }

    /// Check that the credentials are usable before anything is dispatched.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.user.trim().is_empty() {
            return Err(ConfigError::InvalidCredentials("ssh user is empty".to_string()));
        }
        let metadata = std::fs::metadata(&self.identity_file).map_err(|e| {
            ConfigError::InvalidCredentials(format!(
                "identity file '{}': {}",
                self.identity_file.display(),
                e
            ))
        })?;
        if !metadata.is_file() {
            return Err(ConfigError::InvalidCredentials(format!(
                "identity file '{}' is not a regular file",
                self.identity_file.display()
            )));
        }
        Ok(())
    }
}
