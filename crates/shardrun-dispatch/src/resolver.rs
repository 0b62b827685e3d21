//! Target resolution: host -> connectable address.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use shardrun_core::{Host, HostDirectory, HostId, TaskError};

/// Resolves a host to the address used to open a session.
///
/// Implementations must bound any network wait they perform and report
/// failure as [`TaskError::Resolution`].
#[async_trait]
pub trait TargetResolver: Send + Sync {
    async fn resolve(&self, host: &Host) -> Result<String, TaskError>;
}

#[async_trait]
impl<R: TargetResolver + ?Sized> TargetResolver for Arc<R> {
    async fn resolve(&self, host: &Host) -> Result<String, TaskError> {
        (**self).resolve(host).await
    }
}

/// Resolve a host, using its pre-resolved address when it has one.
pub async fn resolve_target(resolver: &dyn TargetResolver, host: &Host) -> Result<String, TaskError> {
    if let Some(address) = host.address.as_deref().map(str::trim).filter(|a| !a.is_empty()) {
        return Ok(address.to_string());
    }
    resolver.resolve(host).await
}

/// Fixed host-to-address table.
#[derive(Debug, Clone, Default)]
pub struct StaticResolver {
    addresses: HashMap<HostId, String>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Table built from every directory entry that carries a non-blank
    /// address.
    pub fn from_directory(directory: &HostDirectory) -> Self {
        let addresses = directory
            .hosts()
            .iter()
            .filter_map(|h| {
                let address = h.address.as_deref()?.trim();
                (!address.is_empty()).then(|| (h.id.clone(), address.to_string()))
            })
            .collect();
        Self { addresses }
    }

    /// Builder method to add an entry.
    pub fn with_address(mut self, id: impl Into<HostId>, address: impl Into<String>) -> Self {
        self.addresses.insert(id.into(), address.into());
        self
    }
}

#[async_trait]
impl TargetResolver for StaticResolver {
    async fn resolve(&self, host: &Host) -> Result<String, TaskError> {
        self.addresses
            .get(&host.id)
            .cloned()
            .ok_or_else(|| TaskError::Resolution(format!("no address configured for host '{}'", host.id)))
    }
}

/// Caches successful lookups of an inner resolver.
///
/// Create one per run; nothing carries over between runs. Failures are not
/// cached so a retry looks the host up again.
pub struct CachedResolver<R> {
    inner: R,
    cache: RwLock<HashMap<HostId, String>>,
}

impl<R: TargetResolver> CachedResolver<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            cache: RwLock::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl<R: TargetResolver> TargetResolver for CachedResolver<R> {
    async fn resolve(&self, host: &Host) -> Result<String, TaskError> {
        if let Some(address) = self.cache.read().await.get(&host.id) {
            debug!(host_id = %host.id, address = %address, "Resolved from cache");
            return Ok(address.clone());
        }

        let address = self.inner.resolve(host).await?;
        self.cache
            .write()
            .await
            .insert(host.id.clone(), address.clone());
        Ok(address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Counts lookups and fails the first `failures` of them.
    struct CountingResolver {
        calls: AtomicUsize,
        failures: usize,
    }

    #[async_trait]
    impl TargetResolver for CountingResolver {
        async fn resolve(&self, host: &Host) -> Result<String, TaskError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                return Err(TaskError::Resolution("lookup failed".into()));
            }
            Ok(format!("addr-of-{}", host.id))
        }
    }

    #[tokio::test]
    async fn test_static_resolver() {
        let resolver = StaticResolver::new().with_address("vm-1", "34.0.0.1");
        assert_eq!(resolver.resolve(&Host::new("vm-1")).await.unwrap(), "34.0.0.1");

        let err = resolver.resolve(&Host::new("vm-2")).await.unwrap_err();
        assert!(matches!(err, TaskError::Resolution(msg) if msg.contains("vm-2")));
    }

    #[tokio::test]
    async fn test_static_resolver_from_directory() {
        let directory = HostDirectory::new(vec![
            Host::new("vm-1").with_address("34.0.0.1"),
            Host::new("vm-2"),
        ])
        .unwrap();
        let resolver = StaticResolver::from_directory(&directory);

        assert!(resolver.resolve(&Host::new("vm-1")).await.is_ok());
        assert!(resolver.resolve(&Host::new("vm-2")).await.is_err());
    }

    #[tokio::test]
    async fn test_pre_resolved_address_skips_resolver() {
        let resolver = StaticResolver::new();
        let host = Host::new("vm-1").with_address(" 34.0.0.7 ");
        assert_eq!(resolve_target(&resolver, &host).await.unwrap(), "34.0.0.7");

        let blank = Host::new("vm-1").with_address("  ");
        assert!(resolve_target(&resolver, &blank).await.is_err());
    }

    #[tokio::test]
    async fn test_blank_directory_address_is_resolution_error() {
        let directory = HostDirectory::new(vec![
            Host::new("vm-1").with_address(""),
            Host::new("vm-2").with_address("   "),
            Host::new("vm-3").with_address(" 34.0.0.3 "),
        ])
        .unwrap();
        let resolver = StaticResolver::from_directory(&directory);

        for host in &directory.hosts()[..2] {
            let err = resolve_target(&resolver, host).await.unwrap_err();
            assert!(matches!(err, TaskError::Resolution(_)), "{}", host.id);
        }
        assert_eq!(
            resolver.resolve(&directory.hosts()[2]).await.unwrap(),
            "34.0.0.3"
        );
    }

    #[tokio::test]
    async fn test_cache_hits_inner_once() {
        let cached = CachedResolver::new(CountingResolver {
            calls: AtomicUsize::new(0),
            failures: 0,
        });
        let host = Host::new("vm-1");

        for _ in 0..3 {
            assert_eq!(cached.resolve(&host).await.unwrap(), "addr-of-vm-1");
        }
        assert_eq!(cached.inner.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cache_does_not_keep_failures() {
        let cached = CachedResolver::new(CountingResolver {
            calls: AtomicUsize::new(0),
            failures: 1,
        });
        let host = Host::new("vm-1");

        assert!(cached.resolve(&host).await.is_err());
        assert_eq!(cached.resolve(&host).await.unwrap(), "addr-of-vm-1");
        assert_eq!(cached.inner.calls.load(Ordering::SeqCst), 2);
    }
}
