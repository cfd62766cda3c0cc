//! Cache-or-lookup resolution for the dialer.
//!
//! Handles the host resolution pipeline:
//! 1. Cache lookup
//! 2. DNS resolution on miss (IDNA normalized)
//! 3. Store on success, invalidate on failure
//!
//! The dialer decides what to do with the IPs, this module only keeps the
//! cache honest.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::cache::{Cache, ExpiredHook};
use crate::dns::{self, DialerCacheEntry};
use crate::error::{Error, Result};

/// Cache of resolved hosts.
pub type DnsCache = Cache<Arc<DialerCacheEntry>>;

/// Resolver backed by a [`DnsCache`].
#[derive(Clone)]
pub struct CachedResolver {
    cache: Arc<DnsCache>,
}

impl CachedResolver {
    pub fn new(cache: Arc<DnsCache>) -> Self {
        Self { cache }
    }

    /// Build a cache whose expired hosts are re-resolved instead of dropped.
    pub fn with_refresh(expiration: Duration, refresh: Duration) -> Self {
        let cache = Arc::new_cyclic(|weak: &std::sync::Weak<DnsCache>| {
            let weak = weak.clone();
            let hook: ExpiredHook<Arc<DialerCacheEntry>> =
                Arc::new(move |host: String, expired: Arc<DialerCacheEntry>| {
                    let weak = weak.clone();
                    Box::pin(async move {
                        let Some(cache) = weak.upgrade() else {
                            return;
                        };
                        let resolver = CachedResolver::new(cache);
                        if let Err(e) = resolver.store(&host, expired.cursor()).await {
                            warn!(host = %host, error = %e, "dns cache expire hook failed to re-resolve");
                        }
                    })
                });
            Cache::new(expiration, refresh).with_expired_hook(hook)
        });
        Self { cache }
    }

    pub fn cache(&self) -> &Arc<DnsCache> {
        &self.cache
    }

    /// Cached entry for `host`, resolving on a miss.
    pub async fn lookup(&self, host: &str) -> Result<Arc<DialerCacheEntry>> {
        if let Some(entry) = self.cache.get(host) {
            if !entry.is_empty() {
                return Ok(entry);
            }
        }
        self.refresh(host).await
    }

    /// Resolve `host` and replace its entry.
    ///
    /// On failure the host's entry is removed so a stale answer is never
    /// served again.
    pub async fn refresh(&self, host: &str) -> Result<Arc<DialerCacheEntry>> {
        let cursor = self.cache.get(host).map(|prev| prev.cursor()).unwrap_or(0);
        self.store(host, cursor).await
    }

    /// Resolve `host` and store it, continuing round robin from `cursor`.
    async fn store(&self, host: &str, cursor: u32) -> Result<Arc<DialerCacheEntry>> {
        let ips = match dns::resolve(host).await {
            Ok(ips) => ips,
            Err(e) => {
                self.cache.delete(host);
                return Err(e);
            }
        };

        let entry = DialerCacheEntry::with_cursor(ips, cursor)
            .map(Arc::new)
            .ok_or_else(|| Error::LookupIpAddrNotFound(host.to_string()))?;

        info!(host = %host, ips = ?entry.ips(), "lookup succeeded");
        self.cache.set(host, entry.clone());
        Ok(entry)
    }

    pub fn invalidate(&self, host: &str) {
        self.cache.delete(host);
    }
}
