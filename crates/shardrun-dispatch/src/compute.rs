//! External address lookup through the Compute Engine REST API.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, warn};

use shardrun_core::{ConfigError, Host, TaskError};

use crate::resolver::TargetResolver;

/// Default Compute Engine API root.
pub const DEFAULT_COMPUTE_ENDPOINT: &str = "https://compute.googleapis.com/compute/v1";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Instance {
    #[serde(default)]
    network_interfaces: Vec<NetworkInterface>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NetworkInterface {
    #[serde(default)]
    access_configs: Vec<AccessConfig>,
}

#[derive(Debug, Deserialize)]
struct AccessConfig {
    #[serde(rename = "natIP")]
    nat_ip: Option<String>,
}

impl Instance {
    /// NAT address of the first interface that has an access config.
    fn external_address(&self) -> Option<&str> {
        self.network_interfaces
            .iter()
            .find_map(|nic| nic.access_configs.first())
            .and_then(|ac| ac.nat_ip.as_deref())
    }
}

/// Looks up an instance's external address by project, zone, and name.
#[derive(Debug, Clone)]
pub struct ComputeApiResolver {
    client: reqwest::Client,
    endpoint: String,
    token: String,
}

impl ComputeApiResolver {
    /// Create a resolver. Every request is bounded by `timeout`.
    pub fn new(
        endpoint: impl Into<String>,
        token: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, ConfigError> {
        let token = token.into();
        if token.trim().is_empty() {
            return Err(ConfigError::Invalid("compute API token is empty".to_string()));
        }
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ConfigError::Invalid(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            token,
        })
    }

    fn instance_url(&self, host: &Host) -> String {
        format!(
            "{}/projects/{}/zones/{}/instances/{}",
            self.endpoint, host.project, host.zone, host.instance_name
        )
    }
}

#[async_trait]
impl TargetResolver for ComputeApiResolver {
    async fn resolve(&self, host: &Host) -> Result<String, TaskError> {
        if host.project.is_empty() || host.zone.is_empty() || host.instance_name.is_empty() {
            return Err(TaskError::Resolution(format!(
                "host '{}' is missing project, zone, or instance_name",
                host.id
            )));
        }

        let url = self.instance_url(host);
        debug!(host_id = %host.id, url = %url, "Looking up instance");

        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| {
                warn!(host_id = %host.id, error = %e, "Compute API request failed");
                if e.is_timeout() {
                    TaskError::Resolution(format!("compute API request for '{}' timed out", host.id))
                } else {
                    TaskError::Resolution(format!("compute API request for '{}' failed: {}", host.id, e))
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(TaskError::Resolution(format!(
                "compute API returned {} for instance '{}'",
                status, host.instance_name
            )));
        }

        let instance: Instance = response.json().await.map_err(|e| {
            TaskError::Resolution(format!("unreadable compute API response for '{}': {}", host.id, e))
        })?;

        instance
            .external_address()
            .map(str::to_string)
            .ok_or_else(|| {
                TaskError::Resolution(format!("instance '{}' has no external address", host.instance_name))
            })
    }
}
