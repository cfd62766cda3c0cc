//! Expiring key/value cache with a background expiry loop.

use futures::future::BoxFuture;
use rustc_hash::FxHashMap;
use std::sync::{Arc, OnceLock, RwLock, Weak};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::warn;

/// Called with each key the expiry loop removes, and the value it held.
pub type ExpiredHook<V> = Arc<dyn Fn(String, V) -> BoxFuture<'static, ()> + Send + Sync>;

struct CacheEntry<V> {
    value: V,
    expires_at: Instant,
}

/// TTL cache keyed by string.
///
/// Entries expire `expiration` after their last `set`. Reads of an expired
/// entry miss; the entry itself is removed (and the hook fired) by the
/// expiry loop started with [`Cache::start`].
pub struct Cache<V> {
    entries: RwLock<FxHashMap<String, CacheEntry<V>>>,
    expiration: Duration,
    check_interval: Duration,
    expired_hook: Option<ExpiredHook<V>>,
    expiry_task: OnceLock<JoinHandle<()>>,
}

impl<V: Clone + Send + Sync + 'static> Cache<V> {
    pub fn new(expiration: Duration, check_interval: Duration) -> Self {
        Self {
            entries: RwLock::new(FxHashMap::default()),
            expiration,
            check_interval,
            expired_hook: None,
            expiry_task: OnceLock::new(),
        }
    }

    /// Register the hook fired for every expired key.
    pub fn with_expired_hook(mut self, hook: ExpiredHook<V>) -> Self {
        self.expired_hook = Some(hook);
        self
    }

    pub fn expiration(&self) -> Duration {
        self.expiration
    }

    pub fn get(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        let Ok(entries) = self.entries.read() else {
            return None;
        };
        entries
            .get(key)
            .filter(|entry| now < entry.expires_at)
            .map(|entry| entry.value.clone())
    }

    pub fn set(&self, key: impl Into<String>, value: V) {
        let Ok(mut entries) = self.entries.write() else {
            return;
        };
        entries.insert(
            key.into(),
            CacheEntry {
                value,
                expires_at: Instant::now() + self.expiration,
            },
        );
    }

    /// Remove a key, returning its value if it was still live.
    pub fn delete(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        let Ok(mut entries) = self.entries.write() else {
            return None;
        };
        entries
            .remove(key)
            .filter(|entry| now < entry.expires_at)
            .map(|entry| entry.value)
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Start the expiry loop. Only the first call spawns it; it stops once
    /// the cache is dropped.
    ///
    /// The loop runs on the current tokio runtime. Outside a runtime nothing
    /// is started and a later call from inside one can still start it.
    pub fn start(self: &Arc<Self>) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!("cache expiry loop not started: no tokio runtime");
            return;
        };
        let weak = Arc::downgrade(self);
        let interval = self.check_interval.max(Duration::from_millis(1));
        self.expiry_task
            .get_or_init(|| handle.spawn(run_expiry_loop(weak, interval)));
    }

    /// Whether the expiry loop has been started.
    pub fn is_started(&self) -> bool {
        self.expiry_task.get().is_some()
    }

    /// Remove expired entries and return them.
    fn remove_expired(&self) -> Vec<(String, V)> {
        let now = Instant::now();
        let Ok(mut entries) = self.entries.write() else {
            return Vec::new();
        };
        let keys: Vec<String> = entries
            .iter()
            .filter(|(_, entry)| now >= entry.expires_at)
            .map(|(key, _)| key.clone())
            .collect();
        keys.into_iter()
            .filter_map(|key| entries.remove(&key).map(|entry| (key, entry.value)))
            .collect()
    }
}

impl<V> Drop for Cache<V> {
    fn drop(&mut self) {
        if let Some(task) = self.expiry_task.get() {
            task.abort();
        }
    }
}

async fn run_expiry_loop<V: Clone + Send + Sync + 'static>(cache: Weak<Cache<V>>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    interval.tick().await; // Skip first immediate tick
    loop {
        interval.tick().await;
        let Some(cache) = cache.upgrade() else {
            return;
        };
        let expired = cache.remove_expired();
        if let Some(hook) = cache.expired_hook.clone() {
            for (key, value) in expired {
                tokio::spawn(hook(key, value));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn get_returns_live_value() {
        let cache = Cache::new(Duration::from_secs(60), Duration::from_secs(60));
        cache.set("vald-agent", 1u32);

        assert_eq!(cache.get("vald-agent"), Some(1));
        assert_eq!(cache.get("other"), None);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn get_misses_expired_value() {
        let cache = Cache::new(Duration::ZERO, Duration::from_secs(60));
        cache.set("vald-agent", 1u32);

        assert_eq!(cache.get("vald-agent"), None);
    }

    #[test]
    fn set_overwrites() {
        let cache = Cache::new(Duration::from_secs(60), Duration::from_secs(60));
        cache.set("k", 1u32);
        cache.set("k", 2u32);

        assert_eq!(cache.get("k"), Some(2));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn delete_removes() {
        let cache = Cache::new(Duration::from_secs(60), Duration::from_secs(60));
        cache.set("k", 1u32);

        assert_eq!(cache.delete("k"), Some(1));
        assert_eq!(cache.get("k"), None);
        assert!(cache.is_empty());
        assert_eq!(cache.delete("k"), None);
    }

    #[tokio::test]
    async fn expiry_loop_fires_hook_with_expired_value() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let hook_seen = seen.clone();
        let hook: ExpiredHook<u32> = Arc::new(move |key: String, value: u32| {
            let seen = hook_seen.clone();
            Box::pin(async move {
                seen.lock().unwrap().push((key, value));
            })
        });
        let cache = Arc::new(
            Cache::new(Duration::from_millis(20), Duration::from_millis(10))
                .with_expired_hook(hook),
        );
        cache.set("a", 7u32);
        cache.start();

        tokio::time::sleep(Duration::from_millis(200)).await;

        assert!(cache.is_empty());
        assert_eq!(seen.lock().unwrap().as_slice(), [("a".to_string(), 7)]);
    }

    #[test]
    fn start_outside_runtime_does_nothing() {
        let cache: Arc<Cache<u32>> =
            Arc::new(Cache::new(Duration::from_secs(1), Duration::from_secs(1)));

        cache.start();

        assert!(!cache.is_started());
    }

    #[tokio::test]
    async fn start_is_idempotent() {
        let cache: Arc<Cache<u32>> =
            Arc::new(Cache::new(Duration::from_secs(1), Duration::from_secs(1)));
        assert!(!cache.is_started());

        cache.start();
        cache.start();

        assert!(cache.is_started());
    }
}
