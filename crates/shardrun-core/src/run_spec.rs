//! Run configuration.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::host::is_bare_address;
use crate::ConfigError;

/// What a run does on every host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// Bring each checkout to a branch.
    GitUpdate,
    /// Launch one benchmark shard per host.
    Execute,
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::GitUpdate => write!(f, "git_update"),
            Self::Execute => write!(f, "execute"),
        }
    }
}

/// Validated, immutable description of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunSpec {
    mode: RunMode,
    shard_count: usize,
    branch_name: String,
    coordinator_address: String,
}

impl RunSpec {
    /// Validate and build a run spec.
    ///
    /// The coordinator address may be empty in git-update mode.
    pub fn new(
        mode: RunMode,
        shard_count: usize,
        branch_name: impl Into<String>,
        coordinator_address: impl Into<String>,
    ) -> Result<Self, ConfigError> {
        let branch_name = branch_name.into();
        let coordinator_address = coordinator_address.into().trim().to_string();

        if shard_count == 0 {
            return Err(ConfigError::InvalidShardCount(shard_count));
        }
        if !is_valid_branch(&branch_name) {
            return Err(ConfigError::InvalidBranch(branch_name));
        }
        if mode == RunMode::Execute && coordinator_address.is_empty() {
            return Err(ConfigError::MissingCoordinator);
        }
        if !coordinator_address.is_empty() && !is_bare_address(&coordinator_address) {
            return Err(ConfigError::InvalidCoordinator(coordinator_address));
        }

        Ok(Self {
            mode,
            shard_count,
            branch_name,
            coordinator_address,
        })
    }

    pub fn mode(&self) -> RunMode {
        self.mode
    }

    pub fn shard_count(&self) -> usize {
        self.shard_count
    }

    pub fn branch_name(&self) -> &str {
        &self.branch_name
    }

    pub fn coordinator_address(&self) -> &str {
        &self.coordinator_address
    }
}

/// Branch names are interpolated into a remote shell line, so only
/// git-ref-safe characters are accepted.
fn is_valid_branch(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('-')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '/' | '-'))
}
