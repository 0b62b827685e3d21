//! Per-host command construction.
//!
//! The builder is pure: the same spec, shard index, and peer list always
//! produce the same command line.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{ConfigError, RunMode, RunSpec};

/// Default port the coordinator listens on. Shard `i` listens on
/// `base_port + i + 2`.
pub const DEFAULT_BASE_PORT: u16 = 52200;

/// Static parts of the remote commands, loaded from configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CommandTemplate {
    /// Checkout directory updated in git-update mode.
    pub repo_dir: String,

    /// Directory the shard process is launched from.
    pub workdir: String,

    /// Program and leading arguments of the shard process.
    pub program: String,

    /// Arguments appended after the generated flags.
    pub extra_args: Vec<String>,

    /// Environment assignments prefixed to the program.
    pub env: BTreeMap<String, String>,

    /// Output redirect target; `{shard}` is replaced by the shard index.
    /// Empty disables the redirect.
    pub log_file: Option<String>,

    /// Coordinator port; shard ports are derived from it.
    pub base_port: u16,
}

impl Default for CommandTemplate {
    fn default() -> Self {
        Self {
            repo_dir: "aptos-core".to_string(),
            workdir: "aptos-core".to_string(),
            program: "cargo run --profile performance -p aptos-executor-service --".to_string(),
            extra_args: Vec::new(),
            env: BTreeMap::new(),
            log_file: Some("executor-{shard}.log".to_string()),
            base_port: DEFAULT_BASE_PORT,
        }
    }
}

impl CommandTemplate {
    /// Port shard `index` listens on.
    pub fn shard_port(&self, index: usize) -> u32 {
        u32::from(self.base_port) + index as u32 + 2
    }
}

/// Builds the command string for each shard.
#[derive(Debug, Clone)]
pub struct CommandBuilder {
    template: CommandTemplate,
    peers: Vec<String>,
}

impl CommandBuilder {
    /// Create a builder from a template and the peer addresses of every
    /// shard, ascending shard index. Git-update runs need no peers.
    pub fn new(template: CommandTemplate, peers: Vec<String>) -> Self {
        Self { template, peers }
    }

    pub fn template(&self) -> &CommandTemplate {
        &self.template
    }

    /// Build the command for one shard.
    pub fn build(
        &self,
        spec: &RunSpec,
        shard_index: usize,
        total_shards: usize,
    ) -> Result<String, ConfigError> {
        if shard_index >= total_shards {
            return Err(ConfigError::ShardOutOfRange {
                index: shard_index,
                total: total_shards,
            });
        }
        match spec.mode() {
            RunMode::GitUpdate => Ok(self.git_update_command(spec.branch_name())),
            RunMode::Execute => self.execute_command(spec, shard_index, total_shards),
        }
    }

    /// Build the commands for every shard of the run, in shard order.
    pub fn build_all(&self, spec: &RunSpec) -> Result<Vec<String>, ConfigError> {
        let total = spec.shard_count();
        (0..total).map(|i| self.build(spec, i, total)).collect()
    }

    fn git_update_command(&self, branch: &str) -> String {
        format!(
            "cd {} && git pull && git checkout {} && git pull",
            shell_quote(&self.template.repo_dir),
            branch
        )
    }

    fn execute_command(
        &self,
        spec: &RunSpec,
        shard_index: usize,
        total_shards: usize,
    ) -> Result<String, ConfigError> {
        if self.peers.len() < total_shards {
            return Err(ConfigError::Invalid(format!(
                "{} peer addresses configured for {} shards",
                self.peers.len(),
                total_shards
            )));
        }
        let t = &self.template;
        if u64::from(t.base_port) + total_shards as u64 + 1 > u64::from(u16::MAX) {
            return Err(ConfigError::PortOutOfRange {
                base_port: t.base_port,
                shards: total_shards,
            });
        }

        let mut line = format!("cd {} && ", shell_quote(&t.workdir));
        for (key, value) in &t.env {
            line.push_str(&format!("{}={} ", key, shell_quote(value)));
        }
        line.push_str(&t.program);
        line.push_str(&format!(
            " --shard-id {} --num-shards {} --coordinator-address {}:{}",
            shard_index,
            total_shards,
            spec.coordinator_address(),
            t.base_port
        ));

        line.push_str(" --remote-executor-addresses");
        for (i, peer) in self.peers[..total_shards].iter().enumerate() {
            line.push_str(&format!(" {}:{}", peer, t.shard_port(i)));
        }

        for arg in &t.extra_args {
            line.push(' ');
            line.push_str(&shell_quote(arg));
        }

        if let Some(log_file) = t.log_file.as_deref().filter(|f| !f.is_empty()) {
            let target = log_file.replace("{shard}", &shard_index.to_string());
            line.push_str(&format!(" > {}", shell_quote(&target)));
        }

        Ok(line)
    }
}

/// Quote a word for a POSIX shell, leaving plain words untouched.
pub fn shell_quote(word: &str) -> String {
    let plain = !word.is_empty()
        && word.chars().all(|c| {
            c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '/' | '-' | ':' | '=' | ',' | '@' | '+')
        });
    if plain {
        word.to_string()
    } else {
        format!("'{}'", word.replace('\'', r"'\''"))
    }
}
