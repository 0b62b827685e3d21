//! Fleet configuration file.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tracing::info;

use shardrun_core::{CommandTemplate, ConfigError, Credentials, Host, HostDirectory};
use shardrun_dispatch::{
    CachedResolver, ComputeApiResolver, SshOptions, StaticResolver, TargetResolver,
    DEFAULT_COMPUTE_ENDPOINT,
};

/// Fleet configuration, loaded once at startup.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Host the benchmark coordinator runs on.
    #[serde(default)]
    pub coordinator_address: Option<String>,

    #[serde(default)]
    pub ssh: SshConfig,

    #[serde(default)]
    pub resolver: ResolverConfig,

    #[serde(default)]
    pub command: CommandTemplate,

    /// Hosts in shard order.
    #[serde(default)]
    pub hosts: Vec<Host>,
}

/// SSH client settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SshConfig {
    pub user: Option<String>,
    pub identity_file: Option<String>,
    pub program: String,
    pub port: u16,
    pub connect_timeout_secs: u64,
    pub options: Vec<String>,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            user: None,
            identity_file: None,
            program: "ssh".to_string(),
            port: 22,
            connect_timeout_secs: 10,
            options: Vec::new(),
        }
    }
}

/// Where connect addresses come from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResolverKind {
    /// Only the `address` field of each host.
    #[default]
    Static,
    /// Compute Engine REST lookup for hosts without an `address`.
    ComputeApi,
}

/// Target resolver settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ResolverConfig {
    pub kind: ResolverKind,
    pub endpoint: String,
    /// Environment variable holding the API bearer token.
    pub token_env: String,
    pub timeout_secs: u64,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            kind: ResolverKind::Static,
            endpoint: DEFAULT_COMPUTE_ENDPOINT.to_string(),
            token_env: "GOOGLE_OAUTH_ACCESS_TOKEN".to_string(),
            timeout_secs: 10,
        }
    }
}

impl Config {
    /// Read and parse a config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Unreadable {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        let config = Self::parse(&text, &path.display().to_string())?;
        info!(
            path = %path.display(),
            hosts = config.hosts.len(),
            resolver = ?config.resolver.kind,
            "Loaded fleet config"
        );
        Ok(config)
    }

    /// Parse config text; `origin` names the source in errors.
    pub fn parse(text: &str, origin: &str) -> Result<Self, ConfigError> {
        toml::from_str(text).map_err(|e| ConfigError::Parse {
            path: origin.to_string(),
            message: e.to_string(),
        })
    }

    /// Host directory; instance names default to host ids.
    pub fn directory(&self) -> Result<HostDirectory, ConfigError> {
        let hosts = self
            .hosts
            .iter()
            .cloned()
            .map(|mut host| {
                if host.instance_name.is_empty() {
                    host.instance_name = host.id.to_string();
                }
                host
            })
            .collect();
        HostDirectory::new(hosts)
    }

    /// Credentials with command-line overrides applied, validated.
    pub fn credentials(
        &self,
        user: Option<String>,
        identity_file: Option<PathBuf>,
    ) -> Result<Credentials, ConfigError> {
        let user = user.or_else(|| self.ssh.user.clone()).ok_or_else(|| {
            ConfigError::InvalidCredentials("no ssh user (set ssh.user or --user)".to_string())
        })?;
        let identity_file = identity_file
            .or_else(|| self.ssh.identity_file.as_deref().map(expand_home))
            .ok_or_else(|| {
                ConfigError::InvalidCredentials(
                    "no identity file (set ssh.identity_file or --identity-file)".to_string(),
                )
            })?;

        let credentials = Credentials::new(user, identity_file);
        credentials.validate()?;
        Ok(credentials)
    }

    pub fn ssh_options(&self) -> SshOptions {
        SshOptions {
            program: self.ssh.program.clone(),
            port: self.ssh.port,
            connect_timeout_secs: self.ssh.connect_timeout_secs,
            extra_options: self.ssh.options.clone(),
        }
    }

    /// Build the run's resolver. A fresh cache is created per call.
    pub fn build_resolver(
        &self,
        directory: &HostDirectory,
    ) -> Result<Arc<dyn TargetResolver>, ConfigError> {
        match self.resolver.kind {
            ResolverKind::Static => Ok(Arc::new(StaticResolver::from_directory(directory))),
            ResolverKind::ComputeApi => {
                let token = std::env::var(&self.resolver.token_env).map_err(|_| {
                    ConfigError::Invalid(format!(
                        "compute-api resolver needs a token in ${}",
                        self.resolver.token_env
                    ))
                })?;
                let resolver = ComputeApiResolver::new(
                    self.resolver.endpoint.clone(),
                    token,
                    Duration::from_secs(self.resolver.timeout_secs),
                )?;
                Ok(Arc::new(CachedResolver::new(resolver)))
            }
        }
    }
}

/// Expand a leading `~/` to `$HOME`.
pub fn expand_home(path: &str) -> PathBuf {
    match (path.strip_prefix("~/"), std::env::var_os("HOME")) {
        (Some(rest), Some(home)) => PathBuf::from(home).join(rest),
        _ => PathBuf::from(path),
    }
}
