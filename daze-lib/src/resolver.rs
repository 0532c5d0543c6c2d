//! Host resolution behind a trait so the router never constructs a
//! resolver itself. The system implementation caches lookups with a TTL;
//! the public implementation is for environments where the system
//! resolver is unreliable (Android being the usual case).

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::TokioAsyncResolver;
use parking_lot::Mutex;
use tokio::net::lookup_host;
use tracing::{debug, warn};

use crate::error::{DazeError, Result};

const RESOLVE_CACHE_TTL: Duration = Duration::from_secs(600);

#[async_trait]
pub trait Resolve: Send + Sync {
    /// Resolve a bare host name (no port) to its addresses.
    async fn lookup(&self, host: &str) -> Result<Vec<IpAddr>>;
}

#[derive(Clone)]
struct CacheEntry {
    addresses: Vec<IpAddr>,
    expires_at: Instant,
}

impl CacheEntry {
    fn is_expired(&self) -> bool {
        Instant::now() > self.expires_at
    }
}

/// Resolver over the operating system's stub resolver, with a small
/// TTL-bounded cache so one slow lookup is not repeated per connection.
pub struct SystemResolver {
    entries: Mutex<HashMap<String, CacheEntry>>,
    ttl: Duration,
}

impl SystemResolver {
    pub fn new(ttl: Duration) -> Self {
        Self { entries: Mutex::new(HashMap::new()), ttl }
    }
}

impl Default for SystemResolver {
    fn default() -> Self {
        Self::new(RESOLVE_CACHE_TTL)
    }
}

#[async_trait]
impl Resolve for SystemResolver {
    async fn lookup(&self, host: &str) -> Result<Vec<IpAddr>> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(vec![ip]);
        }
        if let Some(entry) = self.entries.lock().get(host) {
            if !entry.is_expired() {
                debug!(host, "resolve cache hit");
                return Ok(entry.addresses.clone());
            }
        }
        let addresses: Vec<IpAddr> = lookup_host((host, 0u16))
            .await
            .map_err(|e| DazeError::Resolve(format!("failed to resolve {host}: {e}")))?
            .map(|sa| sa.ip())
            .collect();
        if addresses.is_empty() {
            return Err(DazeError::Resolve(format!("no addresses found for {host}")));
        }
        let entry = CacheEntry {
            addresses: addresses.clone(),
            expires_at: Instant::now() + self.ttl,
        };
        self.entries.lock().insert(host.to_string(), entry);
        Ok(addresses)
    }
}

/// Resolver pinned to a public recursive service, bypassing the system
/// stub entirely.
pub struct PublicResolver {
    inner: TokioAsyncResolver,
}

impl PublicResolver {
    pub fn google() -> Self {
        let inner =
            TokioAsyncResolver::tokio(ResolverConfig::google(), ResolverOpts::default());
        Self { inner }
    }
}

#[async_trait]
impl Resolve for PublicResolver {
    async fn lookup(&self, host: &str) -> Result<Vec<IpAddr>> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(vec![ip]);
        }
        let lookup = self
            .inner
            .lookup_ip(host)
            .await
            .map_err(|e| DazeError::Resolve(format!("failed to resolve {host}: {e}")))?;
        let addresses: Vec<IpAddr> = lookup.iter().collect();
        if addresses.is_empty() {
            return Err(DazeError::Resolve(format!("no addresses found for {host}")));
        }
        Ok(addresses)
    }
}

/// Pick the resolver for the current environment: `android` selects the
/// public service because the system stub is unreliable there.
pub fn for_environment(android: bool) -> Arc<dyn Resolve> {
    if android {
        warn!("android environment, defaulting to the public resolver");
        Arc::new(PublicResolver::google())
    } else {
        Arc::new(SystemResolver::default())
    }
}
